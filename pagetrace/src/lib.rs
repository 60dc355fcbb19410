//! Page model and element locators for web action recording
//!
//! This crate provides the pieces of a web page the recorder needs to reason
//! about: an in-memory DOM with shadow roots, event dispatch and mutation
//! observers, plus the locator engine that turns any element into a stable
//! XPath and an attribute-safe CSS selector.

pub mod dom;
pub mod errors;
pub mod locator;
#[cfg(test)]
mod tests;

pub use dom::{
    DispatchedEvent, Dom, EventCallback, EventInit, EventType, ListenerId, MutationCallback,
    MutationRecord, NodeId, ObserveOptions, ObserverId, PageId,
};
pub use errors::{DomError, LocatorError};
pub use locator::{
    compute_css_selector, compute_xpath, css_escape, Degradation, Derived, ElementLocator,
};
