//! On-disk and wire config shapes.
//!
//! `RuntimeConfig` is the required `config.json` read once at startup
//! (§6). `GostConfig` is the authoritative, mutable configuration
//! (`gost.json`) the control channel and registries keep in lock-step.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The required local startup file, `config.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    pub addr: String,
    pub secret: String,
    #[serde(default)]
    pub http: u8,
    #[serde(default)]
    pub tls: u8,
    #[serde(default)]
    pub socks: u8,
}

impl RuntimeConfig {
    /// Whether inbound connections whose first bytes sniff as the given
    /// protocol should be blocked at the service-runtime peek-detector.
    pub fn forbids(&self, proto: crate::sniff::Protocol) -> bool {
        match proto {
            crate::sniff::Protocol::Http => self.http != 0,
            crate::sniff::Protocol::Tls => self.tls != 0,
            crate::sniff::Protocol::Socks => self.socks != 0,
            crate::sniff::Protocol::Unknown => false,
        }
    }
}

/// A candidate upstream endpoint within a hop. `options["network"]`
/// selects `unix` vs the default `tcp` dial (§4.G.5); there is no
/// separate top-level field for it.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NodeConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// Hop-local failover behaviour. `fail_timeout` is always normalised to
/// nanoseconds by the time it reaches this type (see
/// [`crate::control::normalize_durations`]).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Selector {
    #[serde(rename = "failTimeout", default)]
    pub fail_timeout_ns: Option<i64>,
    #[serde(default)]
    pub strategy: Option<String>,
}

/// One ordered hop: a name and its candidate nodes.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Hop {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub selector: Selector,
}

/// Named, ordered list of hop groups forming the selectable upstream path.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ChainConfig {
    pub name: String,
    #[serde(default)]
    pub hops: Vec<Hop>,
}

/// Named rate/quota specification consumed by the listener stack. The
/// algorithm's internals are out of scope; only the shape that round-trips
/// through the registry and on-disk config matters here.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LimiterConfig {
    pub name: String,
    #[serde(default)]
    pub limits: Vec<String>,
}

/// A named forwarding unit: listener address, handler/listener type tag,
/// optional chain/limiter references, and arbitrary metadata (notably a
/// `paused` flag).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    #[serde(default = "default_service_type")]
    pub r#type: String,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub limiter: Option<String>,
    #[serde(default)]
    pub sniffing: bool,
    /// PEM certificate chain path, required when `r#type == "tls"`.
    /// Certificate/chain internals beyond loading them are out of scope.
    #[serde(default)]
    pub tls_cert: Option<String>,
    /// PEM private key path, required when `r#type == "tls"`.
    #[serde(default)]
    pub tls_key: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_service_type() -> String {
    "tcp".to_string()
}

impl ServiceConfig {
    pub fn is_paused(&self) -> bool {
        self.metadata
            .get("paused")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_paused(&mut self, paused: bool) {
        if paused {
            self.metadata
                .insert("paused".to_string(), serde_json::Value::Bool(true));
        } else {
            self.metadata.remove("paused");
        }
    }
}

/// The authoritative configuration, persisted to `gost.json` after every
/// successful mutation.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GostConfig {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
}

impl GostConfig {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceConfig> {
        self.services.iter_mut().find(|s| s.name == name)
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }

    pub fn limiter(&self, name: &str) -> Option<&LimiterConfig> {
        self.limiters.iter().find(|l| l.name == name)
    }
}
