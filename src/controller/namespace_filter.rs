//! Namespace scoping for the drain controller

use super::config::NamespaceSelector;

/// Whether `namespace` is in scope for the given selector.
///
/// Rules, in priority order:
/// 1. no selector matches everything
/// 2. a present `include` list matches exactly its members (an empty list
///    matches nothing, and exclude is not consulted)
/// 3. a namespace listed in `exclude` does not match
/// 4. anything else matches
pub fn namespace_matches(namespace: &str, selector: Option<&NamespaceSelector>) -> bool {
    let Some(selector) = selector else {
        return true;
    };

    if let Some(include) = &selector.include {
        return include.iter().any(|ns| ns == namespace);
    }

    !selector
        .exclude
        .as_ref()
        .is_some_and(|exclude| exclude.iter().any(|ns| ns == namespace))
}

impl NamespaceSelector {
    pub fn matches(&self, namespace: &str) -> bool {
        namespace_matches(namespace, Some(self))
    }
}
