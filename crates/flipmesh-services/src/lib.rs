//! flipmesh-services: connection handling, the peer registry, and the
//! replicated state register shared by every node.

pub mod connection;
pub mod registry;
pub mod state;

pub use connection::{Connection, ConnectionError};
pub use registry::{PeerRegistry, RegistryError};
pub use state::{supersedes, StateHandler, StateRegister, StateSnapshot};
