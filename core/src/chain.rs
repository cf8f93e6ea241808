//! Runtime chain/hop/node selection with marker-based failure back-off.
//!
//! Grounded in the design note "Marker-based failure detection on nodes":
//! the original repo's `Marker` is a small object (bool + last-fail time)
//! mutated concurrently by handlers; here it is a lock-free flag plus an
//! atomic timestamp rather than a mutex-guarded struct.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::types::{ChainConfig, NodeConfig};
use crate::sniff::Protocol;

/// Concurrently-mutated failure flag for one node. `fail_timeout` governs
/// how long a marked node is skipped by [`Hop::select`] before it is
/// retried.
#[derive(Default)]
pub struct Marker {
    failed: AtomicBool,
    failed_at_unix_ms: AtomicI64,
}

impl Marker {
    pub fn mark(&self) {
        self.failed.store(true, Ordering::Relaxed);
        self.failed_at_unix_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.failed.store(false, Ordering::Relaxed);
    }

    /// Whether the node should currently be skipped by selection, given a
    /// hop-level `fail_timeout` in nanoseconds (`None` = never retry a
    /// marked node).
    pub fn is_down(&self, fail_timeout_ns: Option<i64>) -> bool {
        if !self.failed.load(Ordering::Relaxed) {
            return false;
        }
        match fail_timeout_ns {
            None => true,
            Some(timeout_ns) => {
                let elapsed_ms = now_unix_ms() - self.failed_at_unix_ms.load(Ordering::Relaxed);
                elapsed_ms < timeout_ns / 1_000_000
            }
        }
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A node paired with its runtime marker.
pub struct Node {
    pub config: NodeConfig,
    pub marker: Marker,
}

impl Node {
    fn from_config(config: NodeConfig) -> Self {
        Self {
            config,
            marker: Marker::default(),
        }
    }
}

/// One hop's live candidate set plus its selection policy.
pub struct Hop {
    pub name: String,
    pub nodes: Vec<Arc<Node>>,
    pub fail_timeout_ns: Option<i64>,
}

impl Hop {
    /// Selects a single live node. A node whose `options.protocol` names
    /// the sniffed protocol (`"http"`, `"tls"`, `"socks"`, case-
    /// insensitive) is preferred; nodes with no `protocol` tag are the
    /// hop's default route and are tried if no protocol-specific node is
    /// live. Returns `None` only if every candidate is marked down
    /// (yields `NoNode` to the caller).
    pub fn select(&self, protocol: Protocol) -> Option<Arc<Node>> {
        let live = |n: &&Arc<Node>| !n.marker.is_down(self.fail_timeout_ns);

        if protocol != Protocol::Unknown {
            if let Some(node) = self
                .nodes
                .iter()
                .filter(live)
                .find(|n| protocol_matches(n.config.options.get("protocol"), protocol))
            {
                return Some(node.clone());
            }
        }

        self.nodes
            .iter()
            .filter(live)
            .find(|n| n.config.options.get("protocol").is_none())
            .or_else(|| self.nodes.iter().find(live))
            .cloned()
    }
}

fn protocol_matches(tag: Option<&String>, protocol: Protocol) -> bool {
    let Some(tag) = tag else { return false };
    match protocol {
        Protocol::Http => tag.eq_ignore_ascii_case("http"),
        Protocol::Tls => tag.eq_ignore_ascii_case("tls"),
        Protocol::Socks => tag.eq_ignore_ascii_case("socks"),
        Protocol::Unknown => false,
    }
}

/// A named, ordered list of hops forming the selectable upstream path.
pub struct Chain {
    pub name: String,
    pub hops: Vec<Hop>,
}

impl Chain {
    pub fn from_config(config: &ChainConfig) -> Self {
        let hops = config
            .hops
            .iter()
            .map(|hop| Hop {
                name: hop.name.clone(),
                nodes: hop
                    .nodes
                    .iter()
                    .cloned()
                    .map(|n| Arc::new(Node::from_config(n)))
                    .collect(),
                fail_timeout_ns: hop.selector.fail_timeout_ns,
            })
            .collect();
        Self {
            name: config.name.clone(),
            hops,
        }
    }

    /// Selects a node from the chain's first hop whose selection succeeds.
    /// A chain with no viable node anywhere yields `None` (`NoNode`).
    pub fn select(&self, protocol: Protocol) -> Option<Arc<Node>> {
        self.hops.iter().find_map(|hop| hop.select(protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Hop as HopConfig, Selector};

    fn node(name: &str, addr: &str) -> NodeConfig {
        NodeConfig {
            name: name.into(),
            addr: addr.into(),
            ..Default::default()
        }
    }

    #[test]
    fn selects_first_live_node() {
        let config = ChainConfig {
            name: "c1".into(),
            hops: vec![HopConfig {
                name: "h1".into(),
                nodes: vec![node("n1", "127.0.0.1:1"), node("n2", "127.0.0.1:2")],
                selector: Selector::default(),
            }],
        };
        let chain = Chain::from_config(&config);
        let selected = chain.select(Protocol::Unknown).unwrap();
        assert_eq!(selected.config.name, "n1");
    }

    #[test]
    fn marked_node_is_skipped_without_fail_timeout() {
        let config = ChainConfig {
            name: "c1".into(),
            hops: vec![HopConfig {
                name: "h1".into(),
                nodes: vec![node("n1", "127.0.0.1:1"), node("n2", "127.0.0.1:2")],
                selector: Selector::default(),
            }],
        };
        let chain = Chain::from_config(&config);
        chain.hops[0].nodes[0].marker.mark();
        let selected = chain.select(Protocol::Unknown).unwrap();
        assert_eq!(selected.config.name, "n2");
    }

    #[test]
    fn routes_by_sniffed_protocol_with_a_default_fallback() {
        let mut http_node = node("A", "127.0.0.1:10");
        http_node.options.insert("protocol".into(), "http".into());
        let mut tls_node = node("B", "127.0.0.1:20");
        tls_node.options.insert("protocol".into(), "tls".into());
        let default_node = node("default", "127.0.0.1:30");

        let config = ChainConfig {
            name: "c1".into(),
            hops: vec![HopConfig {
                name: "h1".into(),
                nodes: vec![http_node, tls_node, default_node],
                selector: Selector::default(),
            }],
        };
        let chain = Chain::from_config(&config);

        assert_eq!(chain.select(Protocol::Http).unwrap().config.name, "A");
        assert_eq!(chain.select(Protocol::Tls).unwrap().config.name, "B");
        assert_eq!(chain.select(Protocol::Unknown).unwrap().config.name, "default");
    }

    #[test]
    fn empty_chain_yields_no_node() {
        let config = ChainConfig {
            name: "c1".into(),
            hops: vec![],
        };
        let chain = Chain::from_config(&config);
        assert!(chain.select(Protocol::Unknown).is_none());
    }

    #[test]
    fn reset_makes_a_marked_node_selectable_again() {
        let config = ChainConfig {
            name: "c1".into(),
            hops: vec![HopConfig {
                name: "h1".into(),
                nodes: vec![node("n1", "127.0.0.1:1")],
                selector: Selector::default(),
            }],
        };
        let chain = Chain::from_config(&config);
        chain.hops[0].nodes[0].marker.mark();
        assert!(chain.select(Protocol::Unknown).is_none());
        chain.hops[0].nodes[0].marker.reset();
        assert!(chain.select(Protocol::Unknown).is_some());
    }
}
