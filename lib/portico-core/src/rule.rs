//! Per-rule request matching and scoring

use std::sync::Arc;

use portico_api::v1alpha1::http_route::{BackendRef, PathMatchType, RouteMatch, RouteRule};
use tracing::error;

use crate::filter::{build_filter, ErrorFilter, Filter};

/// An immutable rule within a route: match predicates, the filter
/// chain built from the rule's filter references, and backend refs
pub(crate) struct Rule {
    matches: Vec<RouteMatch>,
    pub(crate) filters: Vec<Arc<dyn Filter>>,
    pub(crate) backend_refs: Vec<BackendRef>,
}

impl Rule {
    /// Build a rule, constructing its filters eagerly. A filter whose
    /// construction fails is replaced by an error-sink filter so the
    /// rule keeps its declared shape; the failure is logged here once.
    pub(crate) async fn build(
        client: Option<&kube::Client>,
        namespace: &str,
        rule: &RouteRule,
    ) -> Rule {
        let mut filters: Vec<Arc<dyn Filter>> = Vec::new();
        for conf in &rule.filters {
            match build_filter(client, namespace, conf).await {
                Ok(filter) => filters.push(filter),
                Err(err) => {
                    error!("error building filter: {}", err);
                    filters.push(Arc::new(ErrorFilter::new(err.to_string())));
                }
            }
        }

        Rule {
            matches: rule.matches.clone(),
            filters,
            backend_refs: rule.backend_refs.clone(),
        }
    }

    /// Score this rule against a request path.
    ///
    /// An empty match list matches every request with a score of 1.
    /// Otherwise all predicates must hold; the score is 1 plus the
    /// length of each path predicate's value, so longer prefixes win.
    /// A rule that does not match yields no score at all.
    pub(crate) fn score(&self, path: &str) -> Option<i64> {
        if self.matches.is_empty() {
            return Some(1);
        }

        if !self.matches.iter().all(|m| satisfies_match(m, path)) {
            return None;
        }

        let mut score = 1;
        for m in &self.matches {
            if let Some(path_match) = &m.path {
                score += path_match.value.as_deref().unwrap_or("/").len() as i64;
            }
        }
        Some(score)
    }
}

fn satisfies_match(m: &RouteMatch, path: &str) -> bool {
    if let Some(path_match) = &m.path {
        let value = path_match.value.as_deref().unwrap_or("/");
        match path_match.r#type.unwrap_or_default() {
            PathMatchType::PathPrefix => {
                if !path.starts_with(value) {
                    return false;
                }
            }
            PathMatchType::Exact => {
                if path != value {
                    return false;
                }
            }
        }
    }
    true
}
