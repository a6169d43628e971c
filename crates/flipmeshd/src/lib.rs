//! flipmeshd: a peer-to-peer node replicating a single boolean over TCP.

pub mod console;
pub mod node;

pub use node::{Node, NodeConfig, NodeError, NodeState};
