use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use weft_core::message::{Envelope, Payload, TypeTag, WorkflowMessage};
use weft_core::types::ExecutorId;

/// Predicate over a routed payload.
#[derive(Clone)]
pub struct Condition {
    label: String,
    predicate: Arc<dyn Fn(&Payload) -> bool + Send + Sync>,
}

impl Condition {
    pub fn new<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Payload) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// A predicate over the decoded payload. Payloads of another type never match.
    pub fn when<T, F>(label: impl Into<String>, predicate: F) -> Self
    where
        T: WorkflowMessage,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::new(label, move |payload| {
            payload.decode::<T>().map(|v| predicate(&v)).unwrap_or(false)
        })
    }

    pub fn evaluate(&self, payload: &Payload) -> bool {
        (self.predicate)(payload)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condition").field(&self.label).finish()
    }
}

/// One guarded branch of a switch.
#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub condition: Condition,
    pub sink: ExecutorId,
}

/// A directed connection between executors.
#[derive(Debug, Clone)]
pub struct Edge {
    pub id: String,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub enum EdgeKind {
    /// Source to one sink, optionally gated by a predicate.
    Direct {
        source: ExecutorId,
        sink: ExecutorId,
        condition: Option<Condition>,
    },
    /// Source to every sink that accepts the payload type.
    FanOut {
        source: ExecutorId,
        sinks: Vec<ExecutorId>,
    },
    /// Join: the sink fires once every source has contributed.
    FanIn {
        sources: Vec<ExecutorId>,
        sink: ExecutorId,
    },
    /// First matching case wins, otherwise the default.
    Switch {
        source: ExecutorId,
        cases: Vec<SwitchCase>,
        default: Option<ExecutorId>,
    },
}

impl Edge {
    pub fn direct(id: impl Into<String>, source: impl Into<ExecutorId>, sink: impl Into<ExecutorId>) -> Self {
        Self {
            id: id.into(),
            kind: EdgeKind::Direct {
                source: source.into(),
                sink: sink.into(),
                condition: None,
            },
        }
    }

    pub fn sources(&self) -> Vec<&ExecutorId> {
        match &self.kind {
            EdgeKind::Direct { source, .. }
            | EdgeKind::FanOut { source, .. }
            | EdgeKind::Switch { source, .. } => vec![source],
            EdgeKind::FanIn { sources, .. } => sources.iter().collect(),
        }
    }

    pub fn sinks(&self) -> Vec<&ExecutorId> {
        match &self.kind {
            EdgeKind::Direct { sink, .. } | EdgeKind::FanIn { sink, .. } => vec![sink],
            EdgeKind::FanOut { sinks, .. } => sinks.iter().collect(),
            EdgeKind::Switch { cases, default, .. } => {
                let mut sinks: Vec<&ExecutorId> = cases.iter().map(|c| &c.sink).collect();
                if let Some(d) = default {
                    sinks.push(d);
                }
                sinks
            }
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EdgeKind::Direct { .. } => "direct",
            EdgeKind::FanOut { .. } => "fan_out",
            EdgeKind::FanIn { .. } => "fan_in",
            EdgeKind::Switch { .. } => "switch",
        }
    }
}

/// Fan-in contributions waiting for the rest of their generation:
/// edge id -> source id -> queued payloads.
pub type FanInState = BTreeMap<String, BTreeMap<ExecutorId, VecDeque<Payload>>>;

/// Result of routing one outgoing message.
#[derive(Debug, Default)]
pub(crate) struct Routed {
    pub deliveries: Vec<Envelope>,
    /// The message matched at least one edge, including a fan-in buffer.
    pub matched: bool,
    /// Fan-in aggregates the sink cannot accept.
    pub rejected_joins: Vec<(ExecutorId, TypeTag)>,
}

/// Edges indexed by source, in registration order.
#[derive(Debug, Clone, Default)]
pub(crate) struct EdgeMap {
    edges: Vec<Edge>,
    by_source: HashMap<ExecutorId, Vec<usize>>,
}

impl EdgeMap {
    pub fn new(edges: Vec<Edge>) -> Self {
        let mut by_source: HashMap<ExecutorId, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            for source in edge.sources() {
                let list = by_source.entry(source.clone()).or_default();
                if !list.contains(&i) {
                    list.push(i);
                }
            }
        }
        Self { edges, by_source }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn has_outgoing(&self, source: &ExecutorId) -> bool {
        self.by_source.get(source).is_some_and(|l| !l.is_empty())
    }

    pub fn fan_in_ids(&self) -> impl Iterator<Item = &str> {
        self.edges
            .iter()
            .filter(|e| matches!(e.kind, EdgeKind::FanIn { .. }))
            .map(|e| e.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Route a message sent by `source` over its outgoing edges.
    ///
    /// `accepts` reports whether a sink can handle a payload tag. An explicit
    /// target restricts delivery to that sink.
    pub fn route<F>(
        &self,
        source: &ExecutorId,
        envelope: &Envelope,
        accepts: F,
        fan_in: &mut FanInState,
        join_max_retries: u32,
    ) -> Routed
    where
        F: Fn(&ExecutorId, &TypeTag) -> bool,
    {
        let mut routed = Routed::default();
        let Some(indices) = self.by_source.get(source) else {
            return routed;
        };
        let target = envelope.meta.target.as_ref();
        let allowed = |sink: &ExecutorId| target.map_or(true, |t| t == sink);
        let tag = envelope.tag();

        for &i in indices {
            let edge = &self.edges[i];
            match &edge.kind {
                EdgeKind::Direct {
                    sink, condition, ..
                } => {
                    if !allowed(sink) || !accepts(sink, tag) {
                        continue;
                    }
                    if condition.as_ref().map_or(true, |c| c.evaluate(&envelope.payload)) {
                        routed.matched = true;
                        routed.deliveries.push(deliver(envelope, sink));
                    }
                }
                EdgeKind::FanOut { sinks, .. } => {
                    for sink in sinks {
                        if allowed(sink) && accepts(sink, tag) {
                            routed.matched = true;
                            routed.deliveries.push(deliver(envelope, sink));
                        }
                    }
                }
                EdgeKind::Switch { cases, default, .. } => {
                    let chosen = cases
                        .iter()
                        .find(|c| c.condition.evaluate(&envelope.payload))
                        .map(|c| &c.sink)
                        .or(default.as_ref());
                    if let Some(sink) = chosen {
                        if allowed(sink) && accepts(sink, tag) {
                            routed.matched = true;
                            routed.deliveries.push(deliver(envelope, sink));
                        }
                    }
                }
                EdgeKind::FanIn { sources, sink } => {
                    if !allowed(sink) {
                        continue;
                    }
                    routed.matched = true;
                    let buffers = fan_in.entry(edge.id.clone()).or_default();
                    buffers
                        .entry(source.clone())
                        .or_default()
                        .push_back(envelope.payload.clone());

                    if let Some(parts) = take_generation(buffers, sources) {
                        let joined = Payload::list(parts);
                        if accepts(sink, &joined.tag) {
                            routed.deliveries.push(
                                Envelope::new(joined)
                                    .with_target(sink.clone())
                                    .with_max_retries(join_max_retries),
                            );
                        } else {
                            routed.rejected_joins.push((sink.clone(), joined.tag));
                        }
                    }
                    if buffers.values().all(|q| q.is_empty()) {
                        fan_in.remove(&edge.id);
                    }
                }
            }
        }
        routed
    }
}

fn deliver(envelope: &Envelope, sink: &ExecutorId) -> Envelope {
    let mut copy = envelope.clone();
    copy.meta.target = Some(sink.clone());
    copy
}

/// Pop one payload per source, in source order, once every source has one.
fn take_generation(
    buffers: &mut BTreeMap<ExecutorId, VecDeque<Payload>>,
    sources: &[ExecutorId],
) -> Option<Vec<Payload>> {
    let ready = sources
        .iter()
        .all(|s| buffers.get(s).is_some_and(|q| !q.is_empty()));
    if !ready {
        return None;
    }
    let mut parts = Vec::with_capacity(sources.len());
    for s in sources {
        if let Some(p) = buffers.get_mut(s).and_then(|q| q.pop_front()) {
            parts.push(p);
        }
    }
    buffers.retain(|_, q| !q.is_empty());
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_all(_: &ExecutorId, _: &TypeTag) -> bool {
        true
    }

    fn sent_by(source: &str, text: &str) -> Envelope {
        Envelope::new(Payload::text(text)).with_source(source)
    }

    fn targets(routed: &Routed) -> Vec<String> {
        routed
            .deliveries
            .iter()
            .map(|e| e.meta.target.as_ref().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_direct_condition() {
        let mut edge = Edge::direct("e0", "enrich", "fraud");
        if let EdgeKind::Direct { condition, .. } = &mut edge.kind {
            *condition = Some(Condition::when::<String, _>("blocked", |s| s.contains('B')));
        }
        let map = EdgeMap::new(vec![edge]);
        let mut fan_in = FanInState::new();

        let hit = map.route(&"enrich".into(), &sent_by("enrich", "123B"), accept_all, &mut fan_in, 0);
        assert_eq!(targets(&hit), vec!["fraud"]);

        let miss = map.route(&"enrich".into(), &sent_by("enrich", "123"), accept_all, &mut fan_in, 0);
        assert!(miss.deliveries.is_empty());
        assert!(!miss.matched);
    }

    #[test]
    fn test_fan_out_respects_can_handle() {
        let map = EdgeMap::new(vec![Edge {
            id: "e0".into(),
            kind: EdgeKind::FanOut {
                source: "src".into(),
                sinks: vec!["strings".into(), "numbers".into()],
            },
        }]);
        let accepts = |sink: &ExecutorId, tag: &TypeTag| {
            sink.as_str() == "strings" && *tag == TypeTag::of::<String>()
        };
        let routed = map.route(&"src".into(), &sent_by("src", "x"), accepts, &mut FanInState::new(), 0);
        assert_eq!(targets(&routed), vec!["strings"]);
    }

    #[test]
    fn test_switch_first_match_then_default() {
        let map = EdgeMap::new(vec![Edge {
            id: "e0".into(),
            kind: EdgeKind::Switch {
                source: "src".into(),
                cases: vec![
                    SwitchCase {
                        condition: Condition::when::<String, _>("a", |s| s.starts_with('a')),
                        sink: "first".into(),
                    },
                    SwitchCase {
                        condition: Condition::when::<String, _>("ab", |s| s.starts_with("ab")),
                        sink: "second".into(),
                    },
                ],
                default: Some("fallback".into()),
            },
        }]);
        let mut fan_in = FanInState::new();
        let routed = map.route(&"src".into(), &sent_by("src", "abc"), accept_all, &mut fan_in, 0);
        assert_eq!(targets(&routed), vec!["first"]);
        let routed = map.route(&"src".into(), &sent_by("src", "zzz"), accept_all, &mut fan_in, 0);
        assert_eq!(targets(&routed), vec!["fallback"]);
    }

    #[test]
    fn test_explicit_target_limits_delivery() {
        let map = EdgeMap::new(vec![Edge {
            id: "e0".into(),
            kind: EdgeKind::FanOut {
                source: "src".into(),
                sinks: vec!["a".into(), "b".into()],
            },
        }]);
        let env = sent_by("src", "x").with_target("b");
        let routed = map.route(&"src".into(), &env, accept_all, &mut FanInState::new(), 0);
        assert_eq!(targets(&routed), vec!["b"]);
    }

    #[test]
    fn test_fan_in_waits_for_every_source() {
        let map = EdgeMap::new(vec![Edge {
            id: "join".into(),
            kind: EdgeKind::FanIn {
                sources: vec!["a".into(), "b".into()],
                sink: "c".into(),
            },
        }]);
        let mut fan_in = FanInState::new();

        // b completes first; the sink must not fire yet.
        let routed = map.route(&"b".into(), &sent_by("b", "from-b"), accept_all, &mut fan_in, 0);
        assert!(routed.matched);
        assert!(routed.deliveries.is_empty());
        let routed = map.route(&"b".into(), &sent_by("b", "from-b-2"), accept_all, &mut fan_in, 0);
        assert!(routed.deliveries.is_empty());

        let routed = map.route(&"a".into(), &sent_by("a", "from-a"), accept_all, &mut fan_in, 0);
        assert_eq!(routed.deliveries.len(), 1);
        let joined: Vec<String> = routed.deliveries[0].payload.decode().unwrap();
        assert_eq!(joined, vec!["from-a", "from-b"]);

        // The second contribution from b starts the next generation.
        assert_eq!(fan_in["join"][&ExecutorId::new("b")].len(), 1);
        assert!(!fan_in["join"].contains_key(&ExecutorId::new("a")));
    }

    #[test]
    fn test_unknown_source_routes_nowhere() {
        let map = EdgeMap::new(vec![Edge::direct("e0", "a", "b")]);
        assert!(!map.has_outgoing(&"b".into()));
        let routed = map.route(&"b".into(), &sent_by("b", "x"), accept_all, &mut FanInState::new(), 0);
        assert!(!routed.matched);
    }
}
