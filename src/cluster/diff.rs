//! Pod set differ
//!
//! Pods are compared by `metadata.uid`; output order mirrors input order.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Pod;

#[derive(Debug, Clone, Default)]
pub struct PodDiff {
    pub added: Vec<Pod>,
    pub removed: Vec<Pod>,
}

impl PodDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn uid(pod: &Pod) -> &str {
    pod.metadata.uid.as_deref().unwrap_or_default()
}

/// Members of `left` whose identity is absent from `right`
fn missing_from<'a>(left: &'a [Pod], right: &'a [Pod]) -> impl Iterator<Item = &'a Pod> {
    let known: HashSet<&str> = right.iter().map(uid).collect();
    left.iter().filter(move |pod| !known.contains(uid(pod)))
}

// ============================================================================
// SBIO: Pure diff (no I/O)
// ============================================================================

pub fn diff_pods(previous: &[Pod], current: &[Pod]) -> PodDiff {
    PodDiff {
        added: missing_from(current, previous).cloned().collect(),
        removed: missing_from(previous, current).cloned().collect(),
    }
}
