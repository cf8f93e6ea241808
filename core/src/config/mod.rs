//! Authoritative configuration: on-disk shapes and the update-hook store.

pub mod store;
pub mod types;

pub use store::{ConfigStore, ConfigStoreError};
pub use types::{ChainConfig, GostConfig, Hop, LimiterConfig, NodeConfig, RuntimeConfig, Selector, ServiceConfig};
