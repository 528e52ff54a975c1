//! Object store adapters implementing [`crate::domain::ClusterStore`]

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::{Fault, InMemoryStore, StoreOp};
