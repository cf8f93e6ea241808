//! Core engine for the forwarding daemon: config store, registries,
//! crypto, listeners, forwarding handler, service runtime and control
//! channel. `gost-daemon` wires these together at startup.

pub mod chain;
pub mod config;
pub mod control;
pub mod core;
pub mod crypto;
pub mod error;
pub mod handler;
pub mod listener;
pub mod port;
pub mod proxy_protocol;
pub mod registry;
pub mod reporter;
pub mod service;
pub mod sniff;
pub mod telemetry;
pub mod traffic;

pub use chain::Chain;
pub use config::{ChainConfig, ConfigStore, ConfigStoreError, GostConfig, Hop, LimiterConfig, NodeConfig, RuntimeConfig, Selector, ServiceConfig};
pub use control::{ControlChannel, SessionState};
pub use core::Core;
pub use crypto::{Codec, DecryptError};
pub use error::{ForwardError, Result};
pub use handler::{AllowAll, HandlerConfig, RateLimiter};
pub use listener::{Conn, ForwardListener};
pub use registry::Registry;
pub use reporter::{run_config_reporter, run_traffic_reporter};
pub use service::{LifecycleHooks, Service, ServiceStatusSnapshot};
pub use sniff::Protocol;
pub use telemetry::{HostTelemetry, SystemInfo, detect_client_ip};
pub use traffic::{Stats, TrafficManager};
