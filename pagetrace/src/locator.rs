//! Stable element locators
//!
//! Derives an XPath and a CSS selector for an element so that a recorded action
//! can be mapped back onto the page later. Both derivations are pure functions of
//! the page state and never fail on malformed element data: missing tags or
//! detached nodes produce a *degraded* value instead. Only structurally impossible
//! requests (unknown node ids, non-element nodes) are errors.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::dom::{Dom, NodeId};
use crate::errors::LocatorError;

/// Tag placeholder used when an element carries no usable tag data.
pub const UNKNOWN_TAG: &str = "unknown";

/// Separator inserted into XPaths where the path crosses into a shadow tree.
pub const SHADOW_ROOT_STEP: &str = "#shadow-root";

static SAFE_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static pattern"));

/// Attributes that may appear in a generated CSS selector. `aria-*` is handled separately.
const ATTRIBUTE_ALLOW_LIST: &[&str] = &[
    "id",
    "name",
    "type",
    "placeholder",
    "role",
    "for",
    "autocomplete",
    "required",
    "readonly",
    "alt",
    "title",
    "src",
    "href",
    "target",
    // test id conventions
    "data-testid",
    "data-test-id",
    "data-test",
    "data-cy",
    "data-qa",
];

/// Why a derived value is a fallback rather than a faithful locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// The element (or an ancestor) has empty or whitespace-only tag data.
    MissingTag,
    /// The element is not attached to the document or a shadow root.
    Detached,
}

/// A derived locator string and whether it had to fall back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derived {
    pub value: String,
    pub degradation: Option<Degradation>,
}

impl Derived {
    fn exact(value: String) -> Self {
        Self {
            value,
            degradation: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degradation.is_some()
    }
}

/// The pair of identifiers attached to every captured action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementLocator {
    pub xpath: String,
    pub css_selector: String,
}

impl ElementLocator {
    /// Compute both identifiers for `element`. Degradations are reported alongside.
    pub fn compute(dom: &Dom, element: NodeId) -> Result<(Self, Option<Degradation>), LocatorError> {
        let xpath = compute_xpath(dom, element)?;
        let css = compute_css_selector(dom, element)?;
        let degradation = xpath.degradation.or(css.degradation);
        Ok((
            Self {
                xpath: xpath.value,
                css_selector: css.value,
            },
            degradation,
        ))
    }
}

fn ensure_element(dom: &Dom, node: NodeId) -> Result<(), LocatorError> {
    if !dom.contains_node(node) {
        return Err(LocatorError::NodeNotFound(node));
    }
    if !dom.is_element(node) {
        return Err(LocatorError::NotAnElement(node));
    }
    Ok(())
}

/// Lowercased tag, or `None` when the tag data is empty or whitespace.
fn tag_of(dom: &Dom, element: NodeId) -> Option<String> {
    let tag = dom.tag_name(element).ok()?.trim();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_ascii_lowercase())
    }
}

/// Compute an XPath for `element`.
///
/// * an element with a non-empty `id` yields `id("<id>")`;
/// * `<body>` yields `body`;
/// * otherwise the parent's path followed by `/tag[k]`, where `k` counts
///   preceding siblings with the same tag (1-based);
/// * inside a shadow tree the path continues from the host through `#shadow-root`;
/// * a parentless element yields its bare tag.
pub fn compute_xpath(dom: &Dom, element: NodeId) -> Result<Derived, LocatorError> {
    ensure_element(dom, element)?;

    if let Some(id) = dom.attribute(element, "id").filter(|id| !id.is_empty()) {
        return Ok(Derived::exact(format!("id(\"{id}\")")));
    }

    let Some(tag) = tag_of(dom, element) else {
        trace!(%element, "element has no tag data");
        return Ok(Derived {
            value: UNKNOWN_TAG.to_string(),
            degradation: Some(Degradation::MissingTag),
        });
    };

    if element == dom.body() {
        return Ok(Derived::exact(tag));
    }

    let Some(parent) = dom.parent_node(element) else {
        return Ok(Derived {
            value: tag,
            degradation: Some(Degradation::Detached),
        });
    };

    let index = same_tag_index(dom, element, &tag);

    if dom.is_element(parent) {
        let parent_path = compute_xpath(dom, parent)?;
        return Ok(Derived {
            value: format!("{}/{tag}[{index}]", parent_path.value),
            degradation: parent_path.degradation,
        });
    }

    if let Some(host) = dom.shadow_host(parent) {
        let host_path = compute_xpath(dom, host)?;
        return Ok(Derived {
            value: format!("{}/{SHADOW_ROOT_STEP}/{tag}[{index}]", host_path.value),
            degradation: host_path.degradation,
        });
    }

    if parent == dom.document() {
        // the document element
        return Ok(Derived::exact(tag));
    }

    // Parent is neither an element, a shadow root nor the document.
    Ok(Derived {
        value: tag,
        degradation: Some(Degradation::Detached),
    })
}

fn same_tag_index(dom: &Dom, element: NodeId, tag: &str) -> usize {
    1 + dom
        .preceding_element_siblings(element)
        .into_iter()
        .filter(|s| tag_of(dom, *s).as_deref() == Some(tag))
        .count()
}

/// Compute a CSS selector for `element` from its tag, safe classes and allow-listed attributes.
pub fn compute_css_selector(dom: &Dom, element: NodeId) -> Result<Derived, LocatorError> {
    ensure_element(dom, element)?;

    let (mut selector, degradation) = match tag_of(dom, element) {
        Some(tag) => (tag, None),
        None => (UNKNOWN_TAG.to_string(), Some(Degradation::MissingTag)),
    };

    for class in dom.class_list(element) {
        if SAFE_CLASS.is_match(class) {
            selector.push('.');
            selector.push_str(class);
        } else {
            trace!(%element, class, "skipping unsafe class");
        }
    }

    let attributes = dom
        .attributes(element)
        .map_err(|_| LocatorError::NotAnElement(element))?;
    for (name, value) in attributes {
        if name == "class" {
            continue;
        }
        let Some(fragment) = attribute_fragment(name, value) else {
            continue;
        };
        selector.push_str(&fragment);
    }

    Ok(Derived {
        value: selector,
        degradation,
    })
}

/// Whether an attribute may contribute to a selector.
pub fn is_allowed_attribute(name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    ATTRIBUTE_ALLOW_LIST.contains(&lower.as_str())
        || (lower.starts_with("aria-") && lower.len() > "aria-".len())
}

/// Build the `[name...]` fragment for one attribute, or `None` if it is not allow-listed.
pub fn attribute_fragment(name: &str, value: &str) -> Option<String> {
    if !is_allowed_attribute(name) {
        return None;
    }
    let name = css_escape(name.trim());
    if value.is_empty() {
        return Some(format!("[{name}]"));
    }
    if value.chars().any(is_unsafe_value_char) {
        return Some(match longest_safe_run(value) {
            Some(run) => format!("[{name}*=\"{run}\"]"),
            None => format!("[{name}]"),
        });
    }
    Some(format!("[{name}=\"{value}\"]"))
}

/// Characters that cannot appear inside a double-quoted selector value without escaping.
fn is_unsafe_value_char(c: char) -> bool {
    matches!(c, '"' | '\'' | '<' | '>' | '`' | '\\') || c.is_whitespace() || c.is_control()
}

fn longest_safe_run(value: &str) -> Option<&str> {
    value
        .split(is_unsafe_value_char)
        .filter(|run| !run.is_empty())
        .fold(None, |best: Option<&str>, run| match best {
            Some(b) if b.chars().count() >= run.chars().count() => Some(b),
            _ => Some(run),
        })
}

/// Serialize an identifier the way `CSS.escape()` does.
pub fn css_escape(ident: &str) -> String {
    let chars: Vec<char> = ident.chars().collect();
    let mut out = String::with_capacity(ident.len());
    if chars.len() == 1 && chars[0] == '-' {
        return "\\-".to_string();
    }
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '\0' => out.push('\u{FFFD}'),
            '\u{1}'..='\u{1f}' | '\u{7f}' => {
                let _ = write!(out, "\\{:x} ", c as u32);
            }
            '0'..='9' if i == 0 || (i == 1 && chars[0] == '-') => {
                let _ = write!(out, "\\{:x} ", c as u32);
            }
            c if c as u32 >= 0x80 || c == '-' || c == '_' || c.is_ascii_alphanumeric() => {
                out.push(c)
            }
            c => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out
}
