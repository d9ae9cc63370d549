//! Filter engine. A stateless predicate over a
//! decoded event, with exact-match or `*`-wildcard string fields.

use crate::core::event::{Event, EventKind};
use crate::core::timestamp::Timestamp;
use std::collections::BTreeMap;

/// A query predicate. Every field is optional; an absent field matches
/// anything. Present string fields may be `"*"` for wildcard, which also
/// matches anything but is kept distinct from `None` so `FilterSummary` can
/// report it was asked for explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub group: Option<String>,
    pub version: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub event_type: Option<EventKind>,
    pub from_ts: Option<Timestamp>,
    pub to_ts: Option<Timestamp>,
}

const WILDCARD: &str = "*";

fn field_matches(pattern: &Option<String>, value: &str) -> bool {
    match pattern {
        None => true,
        Some(p) if p == WILDCARD => true,
        Some(p) => p == value,
    }
}

impl QueryFilter {
    pub fn time_range(&self) -> (Timestamp, Timestamp) {
        (
            self.from_ts.unwrap_or(Timestamp::MIN),
            self.to_ts.unwrap_or(Timestamp::MAX),
        )
    }

    /// Whether `event` satisfies every predicate.
    /// `timeRange` is re-checked here even though the scan layer already
    /// prefilters on it, per the contract's "re-asserted for safety".
    pub fn matches(&self, event: &Event) -> bool {
        let (from, to) = self.time_range();
        if event.timestamp < from || event.timestamp > to {
            return false;
        }
        if let Some(kind) = self.event_type {
            if event.kind != kind {
                return false;
            }
        }
        field_matches(&self.group, &event.resource.group)
            && field_matches(&self.version, &event.resource.version)
            && field_matches(&self.kind, &event.resource.kind)
            && field_matches(&self.namespace, &event.resource.namespace)
    }

    /// A human-readable `field -> value` map for observability.
    pub fn summary(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(v) = &self.group {
            map.insert("group".to_string(), v.clone());
        }
        if let Some(v) = &self.version {
            map.insert("version".to_string(), v.clone());
        }
        if let Some(v) = &self.kind {
            map.insert("kind".to_string(), v.clone());
        }
        if let Some(v) = &self.namespace {
            map.insert("namespace".to_string(), v.clone());
        }
        if let Some(v) = self.event_type {
            map.insert("eventType".to_string(), v.to_string());
        }
        let (from, to) = self.time_range();
        map.insert("fromTs".to_string(), from.as_nanos().to_string());
        map.insert("toTs".to_string(), to.as_nanos().to_string());
        map
    }

    /// True iff `a` and `b` agree on every non-wildcard, non-absent field —
    /// i.e. neither names a concrete value the other contradicts. Used to validate that a watcher
    /// reconfiguration doesn't silently invalidate a long-running query's
    /// assumptions.
    pub fn are_compatible(a: &QueryFilter, b: &QueryFilter) -> bool {
        fn compatible_field(x: &Option<String>, y: &Option<String>) -> bool {
            match (x, y) {
                (Some(x), Some(y)) if x != WILDCARD && y != WILDCARD => x == y,
                _ => true,
            }
        }
        compatible_field(&a.group, &b.group)
            && compatible_field(&a.version, &b.version)
            && compatible_field(&a.kind, &b.kind)
            && compatible_field(&a.namespace, &b.namespace)
            && match (a.event_type, b.event_type) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::ResourceRef;
    use bytes::Bytes;

    fn pod_event(namespace: &str) -> Event {
        let resource = ResourceRef::new("", "v1", "Pod", namespace, "p1", "u1");
        Event::new(Timestamp::from_nanos(100), EventKind::Create, resource, Bytes::from_static(b"{}"))
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(QueryFilter::default().matches(&pod_event("default")));
    }

    #[test]
    fn namespace_exact_match() {
        let filter = QueryFilter { namespace: Some("default".to_string()), ..Default::default() };
        assert!(filter.matches(&pod_event("default")));
        assert!(!filter.matches(&pod_event("kube-system")));
    }

    #[test]
    fn wildcard_matches_any_namespace() {
        let filter = QueryFilter { namespace: Some("*".to_string()), ..Default::default() };
        assert!(filter.matches(&pod_event("kube-system")));
    }

    #[test]
    fn time_range_is_reasserted() {
        let filter = QueryFilter {
            from_ts: Some(Timestamp::from_nanos(1000)),
            ..Default::default()
        };
        assert!(!filter.matches(&pod_event("default")));
    }

    #[test]
    fn compatible_filters_agree_on_concrete_fields() {
        let a = QueryFilter { namespace: Some("default".to_string()), ..Default::default() };
        let b = QueryFilter { namespace: Some("default".to_string()), kind: Some("Pod".to_string()), ..Default::default() };
        assert!(QueryFilter::are_compatible(&a, &b));
    }

    #[test]
    fn incompatible_filters_contradict_a_concrete_field() {
        let a = QueryFilter { namespace: Some("default".to_string()), ..Default::default() };
        let b = QueryFilter { namespace: Some("kube-system".to_string()), ..Default::default() };
        assert!(!QueryFilter::are_compatible(&a, &b));
    }

    #[test]
    fn wildcard_never_conflicts() {
        let a = QueryFilter { namespace: Some("*".to_string()), ..Default::default() };
        let b = QueryFilter { namespace: Some("kube-system".to_string()), ..Default::default() };
        assert!(QueryFilter::are_compatible(&a, &b));
    }
}
