//! Query access: a centralized query service when available, otherwise
//! peer-to-peer aggregation of node resources.

pub mod aggregator;
pub mod cache;
pub mod client;
pub mod node_client;

pub use aggregator::{QueryAggregator, QueryHandle, QueryMode, QuerySettings};
pub use cache::{NodeCache, NodeState};
pub use client::QueryClient;
pub use node_client::{NodeClient, NodeSnapshot};
