use thiserror::Error;

use crate::dom::NodeId;

/// Errors raised by the page model when a DOM operation is invalid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {0} is not an element")]
    NotAnElement(NodeId),

    #[error("Hierarchy request error: {0}")]
    HierarchyRequest(String),

    #[error("Element {0} has no writable value")]
    NoValueProperty(NodeId),

    #[error("Element {0} already hosts a shadow root")]
    ShadowRootExists(NodeId),

    #[error("Element <{0}> cannot host a shadow root")]
    InvalidShadowHost(String),

    #[error("Option index {index} out of range for select {select} ({len} options)")]
    OptionOutOfRange {
        select: NodeId,
        index: usize,
        len: usize,
    },
}

/// Unexpected failures while deriving an element locator.
///
/// Missing or malformed element data is *not* an error: it produces a
/// degraded value instead (see [`crate::locator::Degradation`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocatorError {
    #[error("Cannot locate node {0}: not present in the page")]
    NodeNotFound(NodeId),

    #[error("Cannot locate node {0}: not an element")]
    NotAnElement(NodeId),
}
