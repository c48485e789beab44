use std::sync::Arc;

use deck_transport::ChunkBuffer;
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;

use crate::node::{Node, NodeKind, Schedule};
use crate::{AudioParam, Clock};

pub type NodeId = NodeIndex;

/// Edge between an output port of one node and an input port of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub output: u16,
    pub input: u16,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum GraphError {
    #[error("node {0:?} does not exist")]
    NodeNotFound(NodeId),

    #[error("{node:?} has no port {port}")]
    InvalidPort { node: NodeId, port: u16 },

    #[error("connection would create a cycle")]
    WouldCreateCycle,

    #[error("{node:?} is a {kind} node, not a source")]
    NotASource { node: NodeId, kind: &'static str },

    #[error("{0:?} was already started")]
    AlreadyStarted(NodeId),

    #[error("{node:?} is a {kind} node, not a gain")]
    NotAGain { node: NodeId, kind: &'static str },
}

/// Audio processing graph shared between the control side and the renderer.
///
/// Cloning is cheap: sample data is held behind `Arc`s.
#[derive(Clone)]
pub struct AudioGraph {
    pub(crate) graph: StableGraph<Node, Connection>,
    clock: Arc<dyn Clock>,
    sample_rate: u32,
    destination: NodeId,
}

impl std::fmt::Debug for AudioGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioGraph")
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl AudioGraph {
    pub fn new(clock: Arc<dyn Clock>, sample_rate: u32, channels: u16) -> Self {
        let mut graph = StableGraph::new();
        let destination = graph.add_node(Node::new(NodeKind::Destination { channels }));
        Self {
            graph,
            clock,
            sample_rate,
            destination,
        }
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn destination(&self) -> NodeId {
        self.destination
    }

    pub fn destination_channels(&self) -> u16 {
        match self.graph.node_weight(self.destination).map(|n| &n.kind) {
            Some(NodeKind::Destination { channels }) => *channels,
            _ => 0,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.graph.contains_node(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn create_gain(&mut self, value: f32) -> NodeId {
        self.graph.add_node(Node::new(NodeKind::Gain {
            gain: AudioParam::new(value),
            channels: None,
        }))
    }

    pub fn create_buffer_source(&mut self, buffer: Arc<ChunkBuffer>) -> NodeId {
        self.graph.add_node(Node::new(NodeKind::BufferSource {
            buffer,
            schedule: None,
        }))
    }

    pub fn create_constant_source(&mut self, value: f32) -> NodeId {
        self.graph.add_node(Node::new(NodeKind::ConstantSource {
            value,
            schedule: None,
        }))
    }

    pub fn create_splitter(&mut self, outputs: u16) -> NodeId {
        self.graph.add_node(Node::new(NodeKind::Splitter { outputs }))
    }

    pub fn create_merger(&mut self, inputs: u16) -> NodeId {
        self.graph.add_node(Node::new(NodeKind::Merger { inputs }))
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.connect_ports(from, 0, to, 0)
    }

    /// Connect `output` of `from` to `input` of `to`. Connecting twice is a no-op.
    pub fn connect_ports(
        &mut self,
        from: NodeId,
        output: u16,
        to: NodeId,
        input: u16,
    ) -> Result<(), GraphError> {
        let connection = Connection { output, input };
        if self
            .graph
            .edges_directed(from, Direction::Outgoing)
            .any(|edge| edge.target() == to && *edge.weight() == connection)
        {
            return Ok(());
        }

        let from_node = self.graph.node_weight(from).ok_or(GraphError::NodeNotFound(from))?;
        let to_node = self.graph.node_weight(to).ok_or(GraphError::NodeNotFound(to))?;
        if output >= from_node.output_ports() {
            return Err(GraphError::InvalidPort {
                node: from,
                port: output,
            });
        }
        if input >= to_node.input_ports() {
            return Err(GraphError::InvalidPort {
                node: to,
                port: input,
            });
        }

        if from == to || has_path_connecting(&self.graph, to, from, None) {
            return Err(GraphError::WouldCreateCycle);
        }

        self.graph.add_edge(from, to, connection);
        Ok(())
    }

    /// Remove every connection from `from` to `to`. Missing connections are ignored.
    pub fn disconnect(&mut self, from: NodeId, to: NodeId) {
        while let Some(edge) = self.graph.find_edge(from, to) {
            self.graph.remove_edge(edge);
        }
    }

    /// Remove every outgoing connection of `node`.
    pub fn disconnect_all(&mut self, node: NodeId) {
        let edges: Vec<_> = self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .map(|edge| edge.id())
            .collect();
        for edge in edges {
            self.graph.remove_edge(edge);
        }
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.graph.find_edge(from, to).is_some()
    }

    pub fn outputs(&self, node: NodeId) -> Vec<NodeId> {
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect()
    }

    /// Remove a node and all its connections.
    pub fn remove(&mut self, node: NodeId) {
        if node == self.destination {
            log::warn!("refusing to remove the graph destination");
            return;
        }
        self.graph.remove_node(node);
    }

    /// Schedule a source node to play `duration` seconds starting at graph
    /// time `when`, beginning `offset` seconds into its buffer.
    pub fn start_source(
        &mut self,
        node: NodeId,
        when: f64,
        offset: f64,
        duration: f64,
    ) -> Result<(), GraphError> {
        let weight = self
            .graph
            .node_weight_mut(node)
            .ok_or(GraphError::NodeNotFound(node))?;
        let kind = weight.name();
        let slot = match &mut weight.kind {
            NodeKind::BufferSource { schedule, .. } | NodeKind::ConstantSource { schedule, .. } => {
                schedule
            }
            _ => return Err(GraphError::NotASource { node, kind }),
        };
        if slot.is_some() {
            return Err(GraphError::AlreadyStarted(node));
        }
        *slot = Some(Schedule {
            start: when,
            offset,
            duration: duration.max(0.0),
        });
        Ok(())
    }

    /// Graph time at which a started source stops producing output.
    pub fn source_end(&self, node: NodeId) -> Option<f64> {
        self.graph
            .node_weight(node)
            .and_then(Node::schedule)
            .map(Schedule::end)
    }

    /// Whether a source has played out by `now`. Missing nodes count as finished.
    pub fn is_finished(&self, node: NodeId, now: f64) -> bool {
        match self.graph.node_weight(node) {
            Some(weight) => weight.schedule().is_some_and(|s| now >= s.end()),
            None => true,
        }
    }

    pub fn gain_value_at(&self, node: NodeId, time: f64) -> Option<f32> {
        match self.graph.node_weight(node).map(|n| &n.kind) {
            Some(NodeKind::Gain { gain, .. }) => Some(gain.value_at(time)),
            _ => None,
        }
    }

    pub fn gain_target(&self, node: NodeId) -> Option<f32> {
        match self.graph.node_weight(node).map(|n| &n.kind) {
            Some(NodeKind::Gain { gain, .. }) => Some(gain.target()),
            _ => None,
        }
    }

    fn gain_param_mut(&mut self, node: NodeId) -> Result<&mut AudioParam, GraphError> {
        let weight = self
            .graph
            .node_weight_mut(node)
            .ok_or(GraphError::NodeNotFound(node))?;
        let kind = weight.name();
        match &mut weight.kind {
            NodeKind::Gain { gain, .. } => Ok(gain),
            _ => Err(GraphError::NotAGain { node, kind }),
        }
    }

    pub fn set_gain(&mut self, node: NodeId, value: f32) -> Result<(), GraphError> {
        self.gain_param_mut(node)?.set_value(value);
        Ok(())
    }

    /// Ramp a gain linearly from its current value to `target` over `fade` seconds.
    pub fn set_gain_ramp(&mut self, node: NodeId, target: f32, fade: f64) -> Result<(), GraphError> {
        let now = self.now();
        self.gain_param_mut(node)?
            .cancel_and_ramp(now, target, now + fade);
        Ok(())
    }

    pub fn set_channel_count(&mut self, node: NodeId, count: Option<u16>) -> Result<(), GraphError> {
        let weight = self
            .graph
            .node_weight_mut(node)
            .ok_or(GraphError::NodeNotFound(node))?;
        let kind = weight.name();
        match &mut weight.kind {
            NodeKind::Gain { channels, .. } => {
                *channels = count;
                Ok(())
            }
            _ => Err(GraphError::NotAGain { node, kind }),
        }
    }

    pub fn channel_count(&self, node: NodeId) -> Option<u16> {
        match self.graph.node_weight(node).map(|n| &n.kind) {
            Some(NodeKind::Gain { channels, .. }) => *channels,
            Some(NodeKind::Destination { channels }) => Some(*channels),
            Some(NodeKind::Merger { inputs }) => Some(*inputs),
            Some(NodeKind::Splitter { outputs }) => Some(*outputs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    fn graph() -> (AudioGraph, ManualClock) {
        let clock = ManualClock::new();
        (AudioGraph::new(Arc::new(clock.clone()), 48000, 2), clock)
    }

    fn buffer() -> Arc<ChunkBuffer> {
        Arc::new(ChunkBuffer::from_channels(vec![vec![0.5; 480]], 48000))
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (mut g, _) = graph();
        let gain = g.create_gain(1.0);
        g.connect(gain, g.destination()).unwrap();
        g.connect(gain, g.destination()).unwrap();
        assert_eq!(g.edge_count(), 1);

        g.disconnect(gain, g.destination());
        assert_eq!(g.edge_count(), 0);
        g.disconnect(gain, g.destination());
    }

    #[test]
    fn test_connect_rejects_cycles() {
        let (mut g, _) = graph();
        let a = g.create_gain(1.0);
        let b = g.create_gain(1.0);
        g.connect(a, b).unwrap();
        assert_eq!(g.connect(b, a), Err(GraphError::WouldCreateCycle));
        assert_eq!(g.connect(a, a), Err(GraphError::WouldCreateCycle));
    }

    #[test]
    fn test_connect_validates_ports() {
        let (mut g, _) = graph();
        let splitter = g.create_splitter(4);
        let merger = g.create_merger(4);
        g.connect_ports(splitter, 3, merger, 1).unwrap();
        assert!(matches!(
            g.connect_ports(splitter, 4, merger, 0),
            Err(GraphError::InvalidPort { port: 4, .. })
        ));
        let source = g.create_buffer_source(buffer());
        assert!(g.connect(merger, source).is_err());
    }

    #[test]
    fn test_disconnect_all_and_remove() {
        let (mut g, _) = graph();
        let a = g.create_gain(1.0);
        let b = g.create_gain(1.0);
        g.connect(a, b).unwrap();
        g.connect(a, g.destination()).unwrap();
        g.connect(b, g.destination()).unwrap();

        g.disconnect_all(a);
        assert_eq!(g.edge_count(), 1);

        g.remove(b);
        assert_eq!(g.edge_count(), 0);
        assert!(!g.contains(b));

        g.remove(g.destination());
        assert!(g.contains(g.destination()));
    }

    #[test]
    fn test_start_source() {
        let (mut g, _) = graph();
        let source = g.create_buffer_source(buffer());
        g.start_source(source, 1.0, 0.0, 0.01).unwrap();
        assert_eq!(
            g.start_source(source, 1.0, 0.0, 0.01),
            Err(GraphError::AlreadyStarted(source))
        );
        assert!(!g.is_finished(source, 1.0));
        assert!(g.is_finished(source, 1.01));

        let gain = g.create_gain(1.0);
        assert_eq!(
            g.start_source(gain, 0.0, 0.0, 1.0),
            Err(GraphError::NotASource { node: gain, kind: "gain" })
        );
        assert_eq!(
            g.start_source(gain, 0.0, 0.0, 1.0).unwrap_err().to_string(),
            format!("{gain:?} is a gain node, not a source")
        );
    }

    #[test]
    fn test_unstarted_source_never_finishes() {
        let (mut g, _) = graph();
        let timer = g.create_constant_source(0.0);
        assert!(!g.is_finished(timer, 1e9));
        g.remove(timer);
        assert!(g.is_finished(timer, 0.0));
    }

    #[test]
    fn test_gain_ramp_uses_clock() {
        let (mut g, clock) = graph();
        let gain = g.create_gain(1.0);
        clock.set(10.0);
        g.set_gain_ramp(gain, 0.0, 1.0).unwrap();
        assert_eq!(g.gain_value_at(gain, 10.0), Some(1.0));
        assert_eq!(g.gain_value_at(gain, 11.0), Some(0.0));
        assert_eq!(g.gain_target(gain), Some(0.0));
        assert_eq!(
            g.set_gain_ramp(g.destination(), 0.0, 1.0),
            Err(GraphError::NotAGain {
                node: g.destination(),
                kind: "destination",
            })
        );
    }
}
