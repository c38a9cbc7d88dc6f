//! Hostname-keyed route table with concurrent lookup and atomic update

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use portico_api::v1alpha1::http_route::HTTPRouteSpec;
use tokio::sync::RwLock;
use tracing::debug;

use crate::rule::Rule;

/// Identity of a route object: (namespace, name)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteId {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// An immutable snapshot built from one route object.
///
/// Once inserted into the table a route is never mutated; replacement
/// is by construction of a new route and an atomic swap under the
/// table's write lock.
pub struct Route {
    pub id: RouteId,
    pub hosts: Vec<String>,
    pub namespace: String,
    pub(crate) rules: Vec<Rule>,
}

impl Route {
    /// Build an immutable route from a spec, constructing rule filters
    /// eagerly (see [`Rule::build`])
    pub(crate) async fn build(
        client: Option<&kube::Client>,
        id: RouteId,
        spec: &HTTPRouteSpec,
    ) -> Route {
        let hosts = spec
            .hostnames
            .iter()
            .map(|host| host.to_lowercase())
            .collect();

        let mut rules = Vec::with_capacity(spec.rules.len());
        for rule in &spec.rules {
            rules.push(Rule::build(client, &id.namespace, rule).await);
        }

        Route {
            namespace: id.namespace.clone(),
            id,
            hosts,
            rules,
        }
    }

    /// The best-scoring rule of this route for a request path
    fn best_match(&self, path: &str) -> Option<(usize, i64)> {
        let mut best: Option<(usize, i64)> = None;
        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(score) = rule.score(path) {
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((index, score));
                }
            }
        }
        best
    }
}

/// A matched (route, rule) pair
pub(crate) struct RouteMatch {
    pub route: Arc<Route>,
    pub rule_index: usize,
    pub score: i64,
}

/// The mutable hostname-keyed index of routes.
///
/// Lookups take the read lock only long enough to snapshot the host's
/// route list; scoring runs on the snapshot. Writers serialize among
/// themselves on the write lock.
pub(crate) struct RouteTable {
    inner: RwLock<TableInner>,
}

#[derive(Default)]
struct TableInner {
    by_id: HashMap<RouteId, Arc<Route>>,
    by_host: HashMap<String, Vec<Arc<Route>>>,
}

impl RouteTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner::default()),
        }
    }

    /// Insert or replace the route with this id
    pub(crate) async fn update(&self, route: Arc<Route>) {
        let mut inner = self.inner.write().await;

        if let Some(old) = inner.by_id.insert(route.id.clone(), route.clone()) {
            remove_hosts(&mut inner, &old);
        }
        for host in &route.hosts {
            inner.by_host.entry(host.clone()).or_default().push(route.clone());
        }

        debug!("updated route {}", route.id);
    }

    /// Remove the route with this id, pruning empty host entries
    pub(crate) async fn delete(&self, id: &RouteId) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.by_id.remove(id) {
            remove_hosts(&mut inner, &old);
            debug!("deleted route {}", id);
        }
    }

    /// Find the best (route, rule) for a request host and path
    pub(crate) async fn lookup(&self, host: &str, path: &str) -> Option<RouteMatch> {
        let host = host_without_port(host).to_lowercase();

        let snapshot = {
            let inner = self.inner.read().await;
            inner.by_host.get(&host).cloned().unwrap_or_default()
        };

        let mut best: Option<RouteMatch> = None;
        for route in snapshot {
            if let Some((rule_index, score)) = route.best_match(path) {
                if best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(RouteMatch {
                        route,
                        rule_index,
                        score,
                    });
                }
            }
        }

        if best.is_none() {
            debug!("no routes for host {:?}", host);
        }
        best
    }
}

fn remove_hosts(inner: &mut TableInner, old: &Arc<Route>) {
    for host in &old.hosts {
        if let Some(routes) = inner.by_host.get_mut(host) {
            routes.retain(|route| route.id != old.id);
            if routes.is_empty() {
                inner.by_host.remove(host);
            }
        }
    }
}

/// Strip an optional port from a Host header value without corrupting
/// a bracketed IPv6 literal
pub(crate) fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [::1] or [::1]:8080
        match rest.find(']') {
            Some(end) => return &rest[..end],
            None => return host,
        }
    }
    match host.rfind(':') {
        // More than one colon without brackets is a bare IPv6 literal,
        // not a host:port pair.
        Some(index) if host[..index].contains(':') => host,
        Some(index) => &host[..index],
        None => host,
    }
}
