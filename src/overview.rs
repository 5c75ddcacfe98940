//! Compact multi-node summary: a few recent buckets per entity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::cluster::{ClusterSnapshot, Node, PeerSnapshot, Source};
use crate::history::{
    build_connectivity_timeline, build_timeline, by_configured_order, resolve_entities,
    samples_by_entity, TimelineClass, TimelinePoint,
};
use crate::storage::ConnectivityStatus;
use crate::window::Window;

pub const OVERVIEW_BUCKET_MINUTES: i64 = 10;
pub const OVERVIEW_BUCKET_COUNT: usize = 3;

const CONNECTIVITY_ID: &str = "connectivity";

/// The window covered by an overview ending at `now`.
pub fn overview_window(now: DateTime<Utc>) -> Window {
    Window::ending_at(
        now,
        Duration::minutes(OVERVIEW_BUCKET_MINUTES * OVERVIEW_BUCKET_COUNT as i64),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverviewState {
    Ok,
    Issue,
    Unknown,
}

impl From<TimelineClass> for OverviewState {
    fn from(class: TimelineClass) -> Self {
        match class {
            TimelineClass::Success => Self::Ok,
            TimelineClass::Warning | TimelineClass::Error => Self::Issue,
            TimelineClass::Missing | TimelineClass::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Service,
    Connectivity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverviewBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: OverviewState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&TimelinePoint> for OverviewBucket {
    fn from(point: &TimelinePoint) -> Self {
        let detail = point.details.first().and_then(|d| {
            [d.state.trim(), d.error.trim()]
                .into_iter()
                .find(|s| !s.is_empty())
                .map(str::to_string)
        });
        Self {
            start: point.start,
            end: point.end,
            state: point.class.into(),
            detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverviewItem {
    pub node_id: String,
    pub node_name: String,
    pub id: String,
    pub name: String,
    pub kind: ItemKind,
    pub buckets: Vec<OverviewBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverviewSnapshot {
    pub generated_at: DateTime<Utc>,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub bucket_seconds: i64,
    /// The node serving this overview.
    pub node: Node,
    pub items: Vec<OverviewItem>,
}

/// Build the overview from a cluster snapshot taken over [`overview_window`].
///
/// Each node is one group. Services are picked round-robin across groups
/// until `limit` items are chosen (zero means no limit), so a node with many
/// targets cannot crowd out the others. Connectivity items are extra.
pub fn build_overview(cluster: &ClusterSnapshot, limit: usize) -> OverviewSnapshot {
    let window = Window {
        start: cluster.range_start,
        end: cluster.range_end,
    };

    let mut nodes: Vec<&PeerSnapshot> = cluster.nodes.iter().collect();
    nodes.sort_by(|a, b| node_order(a, b));

    let connectivity: Vec<OverviewItem> = nodes
        .iter()
        .filter_map(|node| connectivity_item(node, &window))
        .collect();

    let groups: Vec<Vec<OverviewItem>> = nodes
        .iter()
        .map(|node| service_items(node, &window))
        .collect();

    let mut items = connectivity;
    items.extend(round_robin(groups, limit).into_iter().flatten());

    let local = cluster
        .nodes
        .iter()
        .find(|n| n.source == Source::Local)
        .map(|n| n.node.clone())
        .unwrap_or_default();

    OverviewSnapshot {
        generated_at: cluster.generated_at,
        range_start: window.start,
        range_end: window.end,
        bucket_seconds: OVERVIEW_BUCKET_MINUTES * 60,
        node: local,
        items,
    }
}

/// Select up to `limit` items, taking one from each group per round.
///
/// Groups keep their order and so do the items inside each group.
pub fn round_robin<T>(groups: Vec<Vec<T>>, limit: usize) -> Vec<Vec<T>> {
    let total: usize = groups.iter().map(Vec::len).sum();
    let limit = if limit == 0 { total } else { limit.min(total) };

    let mut quota = vec![0usize; groups.len()];
    let mut picked = 0;
    let mut round = 0;
    while picked < limit {
        for (i, group) in groups.iter().enumerate() {
            if picked == limit {
                break;
            }
            if round < group.len() {
                quota[i] += 1;
                picked += 1;
            }
        }
        round += 1;
    }

    groups
        .into_iter()
        .zip(quota)
        .map(|(group, n)| group.into_iter().take(n).collect())
        .collect()
}

/// Local node first, then peers by name (case-insensitive), ties by id.
fn node_order(a: &PeerSnapshot, b: &PeerSnapshot) -> Ordering {
    let local = |n: &PeerSnapshot| n.source != Source::Local;
    local(a)
        .cmp(&local(b))
        .then_with(|| {
            a.node
                .name
                .to_lowercase()
                .cmp(&b.node.name.to_lowercase())
        })
        .then_with(|| a.node.id.cmp(&b.node.id))
}

fn service_items(node: &PeerSnapshot, window: &Window) -> Vec<OverviewItem> {
    let mut entities = resolve_entities(&node.targets, node.history.iter().chain(&node.status));
    entities.sort_by(by_configured_order);

    let mut samples = samples_by_entity(&node.history);
    entities
        .into_iter()
        .map(|entity| {
            let series = samples.remove(&entity.id).unwrap_or_default();
            let timeline = build_timeline(series, window, OVERVIEW_BUCKET_COUNT);
            OverviewItem {
                node_id: node.node.id.clone(),
                node_name: node.node.name.clone(),
                id: entity.id,
                name: entity.name,
                kind: ItemKind::Service,
                buckets: timeline.iter().map(OverviewBucket::from).collect(),
            }
        })
        .collect()
}

fn connectivity_item(node: &PeerSnapshot, window: &Window) -> Option<OverviewItem> {
    let samples: Vec<ConnectivityStatus> = node
        .connectivity_lead_in
        .iter()
        .chain(&node.connectivity_history)
        .cloned()
        .collect();
    if samples.is_empty() {
        return None;
    }
    let timeline = build_connectivity_timeline(&samples, window, OVERVIEW_BUCKET_COUNT);
    Some(OverviewItem {
        node_id: node.node.id.clone(),
        node_name: node.node.name.clone(),
        id: CONNECTIVITY_ID.to_string(),
        name: "Connectivity".to_string(),
        kind: ItemKind::Connectivity,
        buckets: timeline.iter().map(OverviewBucket::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Check, ConnectivityStatus, StatusEntry, Target};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn node(id: &str, name: &str, source: Source, services: &[(&str, bool)]) -> PeerSnapshot {
        let mut snap = PeerSnapshot::identity(
            Node {
                id: id.to_string(),
                name: name.to_string(),
                interval_minutes: 5,
                connectivity_interval_seconds: None,
            },
            source,
        );
        snap.history = vec![StatusEntry {
            timestamp: now() - Duration::minutes(5),
            checks: services
                .iter()
                .map(|(sid, ok)| Check {
                    id: sid.to_string(),
                    name: sid.to_string(),
                    ok: *ok,
                    state: if *ok { "active" } else { "failed" }.to_string(),
                    ..Default::default()
                })
                .collect(),
        }];
        snap
    }

    fn cluster(nodes: Vec<PeerSnapshot>) -> ClusterSnapshot {
        let window = overview_window(now());
        ClusterSnapshot {
            generated_at: now(),
            range: "overview".to_string(),
            range_start: window.start,
            range_end: window.end,
            nodes,
        }
    }

    fn keys(overview: &OverviewSnapshot) -> Vec<String> {
        overview
            .items
            .iter()
            .map(|i| format!("{}/{}", i.node_id, i.id))
            .collect()
    }

    #[test]
    fn test_round_robin() {
        let groups = vec![vec!["a1", "a2", "a3", "a4"], vec!["b1"], vec!["c1", "c2"]];
        assert_eq!(
            round_robin(groups.clone(), 4),
            vec![vec!["a1", "a2"], vec!["b1"], vec!["c1"]]
        );
        assert_eq!(
            round_robin(groups.clone(), 5),
            vec![vec!["a1", "a2"], vec!["b1"], vec!["c1", "c2"]]
        );
        assert_eq!(round_robin(groups.clone(), 0), groups);
        assert_eq!(round_robin(groups.clone(), 100), groups);
        assert_eq!(round_robin(Vec::<Vec<u8>>::new(), 3), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn test_fair_selection_across_nodes() {
        let snapshot = cluster(vec![
            node("p2", "zulu", Source::Peer, &[("x", true)]),
            node("p1", "Alpha", Source::Peer, &[("m", true), ("n", true)]),
            node(
                "local",
                "Home",
                Source::Local,
                &[("a", true), ("b", true), ("c", true), ("d", false)],
            ),
        ]);

        let overview = build_overview(&snapshot, 4);
        assert_eq!(keys(&overview), vec!["local/a", "local/b", "p1/m", "p2/x"]);
        assert_eq!(overview.node.id, "local");
        assert_eq!(overview.bucket_seconds, 600);

        let all = build_overview(&snapshot, 0);
        assert_eq!(all.items.len(), 7);
    }

    #[test]
    fn test_bucket_states_and_configured_order() {
        let mut local = node("local", "Home", Source::Local, &[("b", true), ("a", false)]);
        local.targets = vec![Target {
            id: "b".to_string(),
            name: "Beta".to_string(),
            ..Default::default()
        }];
        let overview = build_overview(&cluster(vec![local]), 0);

        assert_eq!(keys(&overview), vec!["local/b", "local/a"]);
        let beta = &overview.items[0];
        assert_eq!(beta.name, "Beta");
        assert_eq!(beta.buckets.len(), 3);
        assert_eq!(beta.buckets[0].state, OverviewState::Unknown);
        assert_eq!(beta.buckets[2].state, OverviewState::Ok);

        let failing = &overview.items[1];
        assert_eq!(failing.buckets[2].state, OverviewState::Issue);
        assert_eq!(failing.buckets[2].detail.as_deref(), Some("failed"));
    }

    #[test]
    fn test_connectivity_items_not_limited() {
        let mut local = node("local", "Home", Source::Local, &[("a", true), ("b", true)]);
        local.connectivity_history = vec![ConnectivityStatus {
            target: "1.1.1.1".to_string(),
            ok: false,
            latency_ms: 0,
            error: Some("dial tcp: timeout".to_string()),
            checked_at: now() - Duration::minutes(2),
        }];
        let peer = node("p1", "Alpha", Source::Peer, &[("m", true)]);

        let overview = build_overview(&cluster(vec![peer, local]), 1);
        assert_eq!(keys(&overview), vec!["local/connectivity", "local/a"]);

        let conn = &overview.items[0];
        assert_eq!(conn.kind, ItemKind::Connectivity);
        assert_eq!(conn.buckets[2].state, OverviewState::Issue);
        assert_eq!(conn.buckets[2].detail.as_deref(), Some("offline"));
    }

    #[test]
    fn test_connectivity_seeded_before_overview_window() {
        let sample = |ago: i64| ConnectivityStatus {
            target: "1.1.1.1".to_string(),
            ok: true,
            latency_ms: 12,
            error: None,
            checked_at: now() - Duration::minutes(ago),
        };
        let mut local = node("local", "Home", Source::Local, &[]);
        local.connectivity_lead_in = vec![sample(35)];
        local.connectivity_history = vec![sample(15)];

        let overview = build_overview(&cluster(vec![local]), 0);
        let conn = &overview.items[0];
        assert_eq!(conn.kind, ItemKind::Connectivity);
        let states: Vec<_> = conn.buckets.iter().map(|b| b.state).collect();
        assert_eq!(states, vec![OverviewState::Ok; 3]);
    }

    #[test]
    fn test_lead_in_alone_yields_connectivity_item() {
        let mut local = node("local", "Home", Source::Local, &[]);
        local.connectivity_lead_in = vec![ConnectivityStatus {
            target: "1.1.1.1".to_string(),
            ok: true,
            latency_ms: 8,
            error: None,
            checked_at: now() - Duration::minutes(31),
        }];

        let overview = build_overview(&cluster(vec![local]), 0);
        assert_eq!(keys(&overview), vec!["local/connectivity"]);
        assert_eq!(overview.items[0].buckets[0].state, OverviewState::Ok);
        assert_eq!(overview.items[0].buckets[2].state, OverviewState::Unknown);
    }
}
