mod pruner;
mod registry;

pub use pruner::Pruner;
pub use registry::{Registry, RegistryConfig, Snapshot, SnapshotEndpoint};
