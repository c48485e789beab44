use crate::{AudioGraph, GraphError, NodeId};

/// Reorders the four channels of a first-order ambisonic signal.
///
/// `channel_map[i]` is the output channel that input channel `i` lands on.
#[derive(Debug, Clone)]
pub struct FoaRouter {
    pub input: NodeId,
    pub output: NodeId,
    channel_map: [u16; 4],
}

impl FoaRouter {
    /// Identity routing.
    pub const IDENTITY: [u16; 4] = [0, 1, 2, 3];

    pub fn new(graph: &mut AudioGraph, channel_map: [u16; 4]) -> Result<Self, GraphError> {
        let mut router = Self {
            input: graph.create_splitter(4),
            output: graph.create_merger(4),
            channel_map,
        };
        router.set_channel_map(graph, channel_map)?;
        Ok(router)
    }

    pub fn channel_map(&self) -> [u16; 4] {
        self.channel_map
    }

    pub fn set_channel_map(
        &mut self,
        graph: &mut AudioGraph,
        channel_map: [u16; 4],
    ) -> Result<(), GraphError> {
        graph.disconnect(self.input, self.output);
        for (channel, target) in channel_map.iter().enumerate() {
            graph.connect_ports(self.input, channel as u16, self.output, *target)?;
        }
        self.channel_map = channel_map;
        Ok(())
    }

    /// Drop the router's outgoing connections, keeping its internal wiring.
    pub fn disconnect(&self, graph: &mut AudioGraph) {
        graph.disconnect_all(self.output);
    }

    pub fn remove(self, graph: &mut AudioGraph) {
        graph.remove(self.input);
        graph.remove(self.output);
    }
}
