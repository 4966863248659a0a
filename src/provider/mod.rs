//! Provider catalog, reachability probing, and purpose-based routing.

pub mod catalog;
pub mod probe;
pub mod router;

pub use catalog::{ProviderCatalog, ProviderSpec};
pub use probe::{ReachabilityProbe, StaticProbe, TcpProbe};
pub use router::{ProviderRouter, ProviderSelection, Purpose};
