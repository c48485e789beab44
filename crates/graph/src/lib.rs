//! Retained audio node graph.
//!
//! Nodes live in a stable arena so ids survive removals. The control thread
//! mutates an [`AudioGraph`] directly; the output side pulls samples out of a
//! clone of it with [`render`].

mod clock;
mod graph;
mod node;
mod param;
mod render;
mod router;

pub use clock::{Clock, FrameClock, ManualClock};
pub use graph::{AudioGraph, Connection, GraphError, NodeId};
pub use node::{Node, NodeKind, Schedule};
pub use param::AudioParam;
pub use render::render;
pub use router::FoaRouter;
