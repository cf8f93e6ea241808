//! `Core`: the single value every component is wired through, per the
//! design note "Global state as an externalised collaborator" — the
//! original repository leans on process-global variables (traffic
//! manager, config store, HTTP sink URL); here they are fields of one
//! struct passed by `Arc` reference instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chain::Chain;
use crate::config::{ConfigStore, GostConfig, LimiterConfig, RuntimeConfig, ServiceConfig};
use crate::error::ForwardError;
use crate::handler::{AllowAll, HandlerConfig};
use crate::listener::ForwardListener;
use crate::registry::Registry;
use crate::service::{LifecycleHooks, Service};
use crate::traffic::TrafficManager;

const RESUME_SETTLE: Duration = Duration::from_millis(300);
const UPDATE_SETTLE: Duration = Duration::from_millis(500);

/// Everything a running forwarding agent needs, wired once at startup and
/// shared by `Arc` with the control channel, the reporters, and every
/// running service.
pub struct Core {
    pub runtime_config: RuntimeConfig,
    pub config: Arc<ConfigStore>,
    pub traffic: Arc<TrafficManager>,
    pub services: Registry<Arc<Service>>,
    pub chains: Registry<Arc<Chain>>,
    pub limiters: Registry<LimiterConfig>,
    service_tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl Core {
    pub fn new(runtime_config: RuntimeConfig, config: ConfigStore) -> Self {
        Self {
            runtime_config,
            config: Arc::new(config),
            traffic: Arc::new(TrafficManager::new()),
            services: Registry::new(),
            chains: Registry::new(),
            limiters: Registry::new(),
            service_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Loads chains and limiters from the persisted config into their
    /// registries, then starts every non-paused service. Called once at
    /// startup after `ConfigStore::load`.
    pub async fn restore_from_config(&self) -> Result<(), ForwardError> {
        let snapshot = self.config.global();
        for chain_cfg in &snapshot.chains {
            self.chains.register(&chain_cfg.name, Arc::new(Chain::from_config(chain_cfg)))?;
        }
        for limiter_cfg in &snapshot.limiters {
            self.limiters.register(&limiter_cfg.name, limiter_cfg.clone())?;
        }
        for service_cfg in &snapshot.services {
            if service_cfg.is_paused() {
                continue;
            }
            self.start_service(service_cfg).await?;
        }
        Ok(())
    }

    /// Binds the listener, builds the handler config, registers the
    /// running service, and spawns its accept loop. Does not touch the
    /// on-disk config; callers in `control.rs` persist separately as part
    /// of the three-phase transaction.
    pub async fn start_service(&self, cfg: &ServiceConfig) -> Result<(), ForwardError> {
        let chain = cfg.chain.as_ref().and_then(|name| self.chains.get(name));
        let listener = if cfg.r#type.eq_ignore_ascii_case("tls") {
            let cert = cfg
                .tls_cert
                .as_deref()
                .ok_or_else(|| ForwardError::Invalid(format!("{}: tls service missing tls_cert", cfg.name)))?;
            let key = cfg
                .tls_key
                .as_deref()
                .ok_or_else(|| ForwardError::Invalid(format!("{}: tls service missing tls_key", cfg.name)))?;
            let acceptor = crate::listener::tls::build_acceptor(cert, key)?;
            ForwardListener::bind_tls(&cfg.addr, acceptor)
                .await
                .map_err(|e| ForwardError::Invalid(format!("{}: {e}", cfg.addr)))?
        } else {
            ForwardListener::bind_tcp(&cfg.addr)
                .await
                .map_err(|e| ForwardError::Invalid(format!("{}: {e}", cfg.addr)))?
        };

        let handler_config = HandlerConfig {
            service: cfg.name.clone(),
            chain,
            sniffing: cfg.sniffing,
            sniff_timeout: Duration::from_secs(3),
            rate_limiter: Arc::new(AllowAll),
            traffic: self.traffic.clone(),
        };

        let service = Service::new(
            cfg.name.clone(),
            listener,
            handler_config,
            self.runtime_config.clone(),
            LifecycleHooks::default(),
            Duration::from_secs(5),
        )
        .await;
        let service = Arc::new(service);

        self.services.register(&cfg.name, service.clone())?;

        let token = CancellationToken::new();
        self.service_tokens.lock().expect("service token lock poisoned").insert(cfg.name.clone(), token.clone());

        let spawned = service.clone();
        tokio::spawn(async move {
            spawned.serve(token).await;
        });

        Ok(())
    }

    /// Cancels the service's accept loop, runs its close hooks (which
    /// force-closes lingering port connections), and removes it from the
    /// registry. A no-op if `name` isn't running.
    pub async fn stop_service(&self, name: &str) {
        if let Some(token) = self.service_tokens.lock().expect("service token lock poisoned").remove(name) {
            token.cancel();
        }
        if let Some(service) = self.services.unregister(name) {
            service.close().await;
        }
    }

    /// Pause semantics: stop the running service (which force-closes
    /// lingering sessions) but leave its config entry in place.
    pub async fn pause_service(&self, name: &str) {
        self.stop_service(name).await;
    }

    /// Resume semantics: settle briefly so the port clears, then start
    /// the service back up from its config entry.
    pub async fn resume_service(&self, cfg: &ServiceConfig) -> Result<(), ForwardError> {
        tokio::time::sleep(RESUME_SETTLE).await;
        self.start_service(cfg).await
    }

    /// Update semantics: stop the old instance, settle, start the new
    /// definition.
    pub async fn update_service(&self, cfg: &ServiceConfig) -> Result<(), ForwardError> {
        self.stop_service(&cfg.name).await;
        tokio::time::sleep(UPDATE_SETTLE).await;
        self.start_service(cfg).await
    }

    pub fn config_snapshot(&self) -> GostConfig {
        self.config.global()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ServiceConfig;

    fn test_runtime_config() -> RuntimeConfig {
        RuntimeConfig {
            addr: "controller.example:8080".into(),
            secret: "topsecret".into(),
            http: 0,
            tls: 0,
            socks: 0,
        }
    }

    /// `ConfigStore::load` never touches disk for a path that doesn't
    /// exist (it just starts from an empty config), and these tests never
    /// call `on_update`, so a bare non-existent path is enough — no
    /// tempdir needed.
    fn test_core() -> Core {
        let store = ConfigStore::load("/nonexistent/gost-core-test.json").unwrap();
        Core::new(test_runtime_config(), store)
    }

    /// S2: pausing a running service severs its listener so a new
    /// connect fails, and the registry no longer carries the service.
    #[tokio::test]
    async fn pause_unregisters_and_new_connects_fail() {
        let core = test_core();
        let cfg = ServiceConfig {
            name: "s1".into(),
            addr: "127.0.0.1:0".into(),
            ..Default::default()
        };
        core.start_service(&cfg).await.unwrap();
        let bound_addr = core.services.get("s1").unwrap().addr().to_string();

        assert!(tokio::net::TcpStream::connect(&bound_addr).await.is_ok());

        core.pause_service("s1").await;
        assert!(core.services.get("s1").is_none());

        assert!(tokio::net::TcpStream::connect(&bound_addr).await.is_err());
    }

    /// Resuming brings a paused service back up under a fresh bind.
    #[tokio::test]
    async fn resume_after_pause_accepts_connections_again() {
        let core = test_core();
        let cfg = ServiceConfig {
            name: "s1".into(),
            addr: "127.0.0.1:0".into(),
            ..Default::default()
        };
        core.start_service(&cfg).await.unwrap();
        core.pause_service("s1").await;

        core.resume_service(&cfg).await.unwrap();
        let bound_addr = core.services.get("s1").unwrap().addr().to_string();
        assert!(tokio::net::TcpStream::connect(&bound_addr).await.is_ok());
    }

    /// A service tagged `type: "tls"` without `tls_cert`/`tls_key` fails
    /// fast with `Invalid` instead of silently falling back to plain TCP.
    #[tokio::test]
    async fn tls_service_without_cert_paths_is_rejected() {
        let core = test_core();
        let cfg = ServiceConfig {
            name: "s1".into(),
            addr: "127.0.0.1:0".into(),
            r#type: "tls".into(),
            ..Default::default()
        };
        let err = core.start_service(&cfg).await.unwrap_err();
        assert_eq!(err.kind(), "Invalid");
        assert!(!core.services.is_registered("s1"));
    }
}
