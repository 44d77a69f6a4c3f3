//! Graph data model
//!
//! Nodes are samples identified by their external id. Topology and metadata
//! refer to nodes by [`NodeId`] only, so the two stores stay independent.

mod edge;
mod frontier;
mod node;

pub use edge::{Edge, EdgeKey, EdgeKind};
pub use frontier::{FrontierEntry, FrontierReason, FrontierSnapshot};
pub use node::{MetadataRecord, NodeId, SampleAttributes, SampleRecord};
