//! Service runtime: binds a listener to the forwarding handler, runs the
//! accept loop with backoff, and drives the stats observer. Grounded in
//! `original_source/go-gost/x/service/service.go`'s `NewService`/`Serve`/
//! `Close`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::types::RuntimeConfig;
use crate::error::ForwardError;
use crate::handler::{self, HandlerConfig};
use crate::listener::ForwardListener;
use crate::port;
use crate::sniff;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Observable service lifecycle state, per the data model's `Service
/// status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Ready,
    Failed,
    Closed,
}

impl ServiceState {
    fn label(self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Ready => "ready",
            ServiceState::Failed => "failed",
            ServiceState::Closed => "closed",
        }
    }
}

/// One bounded ring event. `MaxEventSize` caps retained history so a
/// long-lived service doesn't grow this unboundedly.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub at_unix_ms: i64,
    pub message: String,
}

const MAX_EVENT_SIZE: usize = 64;

/// Aggregate counters plus an "updated since last read" flag, matching
/// the opaque stats handle in the data model.
#[derive(Default)]
pub struct ServiceStats {
    pub total_conns: AtomicU64,
    pub current_conns: AtomicI64,
    pub input_bytes: AtomicU64,
    pub output_bytes: AtomicU64,
    pub total_errs: AtomicU64,
    updated: std::sync::atomic::AtomicBool,
}

impl ServiceStats {
    pub fn mark_updated(&self) {
        self.updated.store(true, Ordering::Relaxed);
    }

    /// Reads and clears the "updated" flag.
    pub fn take_updated(&self) -> bool {
        self.updated.swap(false, Ordering::Relaxed)
    }
}

/// Shared, lockable state the service exposes to callers (status queries,
/// event log).
pub struct ServiceStatus {
    pub state: std::sync::RwLock<ServiceState>,
    pub events: std::sync::Mutex<std::collections::VecDeque<ServiceEvent>>,
    pub stats: Arc<ServiceStats>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            state: std::sync::RwLock::new(ServiceState::Running),
            events: std::sync::Mutex::new(std::collections::VecDeque::new()),
            stats: Arc::new(ServiceStats::default()),
        }
    }
}

/// The wire-facing snapshot of one service's status, embedded into that
/// service's entry in the config reporter's `/flow/config` payload.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatusSnapshot {
    pub state: &'static str,
    #[serde(rename = "totalConns")]
    pub total_conns: u64,
    #[serde(rename = "currentConns")]
    pub current_conns: i64,
    #[serde(rename = "totalErrs")]
    pub total_errs: u64,
    pub events: Vec<String>,
}

impl ServiceStatus {
    pub fn snapshot(&self) -> ServiceStatusSnapshot {
        let events = self
            .events
            .lock()
            .expect("status lock poisoned")
            .iter()
            .map(|e| e.message.clone())
            .collect();
        ServiceStatusSnapshot {
            state: self.state().label(),
            total_conns: self.stats.total_conns.load(Ordering::Relaxed),
            current_conns: self.stats.current_conns.load(Ordering::Relaxed),
            total_errs: self.stats.total_errs.load(Ordering::Relaxed),
            events,
        }
    }

    pub fn set_state(&self, state: ServiceState) {
        *self.state.write().expect("status lock poisoned") = state;
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read().expect("status lock poisoned")
    }

    pub fn push_event(&self, message: impl Into<String>) {
        let mut events = self.events.lock().expect("status lock poisoned");
        if events.len() >= MAX_EVENT_SIZE {
            events.pop_front();
        }
        events.push_back(ServiceEvent {
            at_unix_ms: chrono::Utc::now().timestamp_millis(),
            message: message.into(),
        });
    }
}

/// Shell hooks run around the service lifecycle, each a single
/// `/bin/sh -c <cmd>`; failures are logged and never fatal.
#[derive(Debug, Clone, Default)]
pub struct LifecycleHooks {
    pub pre_up: Vec<String>,
    pub post_up: Vec<String>,
    pub pre_down: Vec<String>,
    pub post_down: Vec<String>,
}

async fn exec_cmds(cmds: &[String], phase: &str) {
    for cmd in cmds {
        match Command::new("/bin/sh").arg("-c").arg(cmd).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => log::warn!("{phase} hook {cmd:?} exited with {status}"),
            Err(e) => log::warn!("{phase} hook {cmd:?} failed to spawn: {e}"),
        }
    }
}

pub struct Service {
    pub name: String,
    addr: String,
    listener: ForwardListener,
    handler_config: HandlerConfig,
    runtime_config: RuntimeConfig,
    hooks: LifecycleHooks,
    pub status: Arc<ServiceStatus>,
    observer_period: Duration,
}

impl Service {
    /// The bound listener address, used by the port enforcer and by
    /// callers that need to observe where an ephemeral (`:0`) service
    /// actually landed.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn status_snapshot(&self) -> ServiceStatusSnapshot {
        self.status.snapshot()
    }

    pub async fn new(
        name: String,
        listener: ForwardListener,
        handler_config: HandlerConfig,
        runtime_config: RuntimeConfig,
        hooks: LifecycleHooks,
        observer_period: Duration,
    ) -> Self {
        let addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
        exec_cmds(&hooks.pre_up, "pre-up").await;
        let status = Arc::new(ServiceStatus::default());
        status.set_state(ServiceState::Running);
        Self {
            name,
            addr,
            listener,
            handler_config,
            runtime_config,
            hooks,
            status,
            observer_period: observer_period.max(Duration::from_secs(1)),
        }
    }

    /// Runs the accept loop and the stats observer until `shutdown` is
    /// cancelled. Temporary accept errors back off from 1s doubling to a
    /// 5s cap; a permanent error closes the service.
    pub async fn serve(&self, shutdown: CancellationToken) {
        exec_cmds(&self.hooks.post_up, "post-up").await;
        self.status.set_state(ServiceState::Ready);

        let observer = tokio::spawn(observe_stats(
            self.status.clone(),
            self.handler_config.traffic.clone(),
            self.name.clone(),
            self.observer_period,
            shutdown.child_token(),
        ));

        let mut backoff = BACKOFF_START;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((conn, peer_addr)) => {
                            backoff = BACKOFF_START;
                            self.status.set_state(ServiceState::Ready);
                            self.spawn_connection(conn, peer_addr, shutdown.child_token());
                        }
                        Err(e) if is_temporary(&e) => {
                            self.status.set_state(ServiceState::Failed);
                            self.status.push_event(format!("accept error (temporary): {e}"));
                            log::warn!("service {}: temporary accept error: {e}", self.name);
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(BACKOFF_MAX);
                        }
                        Err(e) => {
                            self.status.set_state(ServiceState::Closed);
                            self.status.push_event(format!("accept error (fatal): {e}"));
                            log::error!("service {}: permanent accept error: {e}", self.name);
                            break;
                        }
                    }
                }
            }
        }

        observer.abort();
    }

    fn spawn_connection(&self, conn: crate::listener::Conn, peer_addr: std::net::SocketAddr, token: CancellationToken) {
        let cfg = clone_handler_config(&self.handler_config);
        let status = self.status.clone();
        let forbid = self.runtime_config.clone();
        status.stats.total_conns.fetch_add(1, Ordering::Relaxed);
        status.stats.current_conns.fetch_add(1, Ordering::Relaxed);
        status.stats.mark_updated();

        tokio::spawn(async move {
            let (mut conn, client_addr) = (conn, peer_addr);
            let (proxy_ip, leftover) = crate::proxy_protocol::decode(&mut conn).await;
            let conn = conn.with_prefix(leftover);
            let client_addr = match proxy_ip {
                Some(ip) => std::net::SocketAddr::new(ip, client_addr.port()),
                None => client_addr,
            };

            let conn = match peek_forbidden(conn, &forbid).await {
                Some(c) => c,
                None => {
                    status.stats.current_conns.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };

            let record = handler::handle(&cfg, conn, client_addr, token).await;
            status.stats.current_conns.fetch_sub(1, Ordering::Relaxed);
            if record.error_kind.is_some() {
                status.stats.total_errs.fetch_add(1, Ordering::Relaxed);
            }
            status.stats.mark_updated();
        });
    }

    pub async fn close(&self) {
        exec_cmds(&self.hooks.pre_down, "pre-down").await;
        port::force_close_port_connections(&self.addr).await;
        self.status.set_state(ServiceState::Closed);
        exec_cmds(&self.hooks.post_down, "post-down").await;
    }
}

fn is_temporary(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
    )
}

/// Peek-once protocol-forbid detector: closes the connection at first
/// read if its leading bytes match a protocol forbidden by the local
/// `config.json` bits, otherwise returns the connection untouched (with
/// its prefix intact) for normal handling.
async fn peek_forbidden(mut conn: crate::listener::Conn, forbid: &RuntimeConfig) -> Option<crate::listener::Conn> {
    use tokio::io::AsyncReadExt;
    if forbid.http == 0 && forbid.tls == 0 && forbid.socks == 0 {
        return Some(conn);
    }
    let mut buf = [0u8; 16];
    let n = match tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        _ => return Some(conn),
    };
    let protocol = sniff::classify(&buf[..n]);
    if forbid.forbids(protocol) {
        return None;
    }
    Some(conn.with_prefix(buf[..n].to_vec()))
}

fn clone_handler_config(cfg: &HandlerConfig) -> HandlerConfig {
    HandlerConfig {
        service: cfg.service.clone(),
        chain: cfg.chain.clone(),
        sniffing: cfg.sniffing,
        sniff_timeout: cfg.sniff_timeout,
        rate_limiter: cfg.rate_limiter.clone(),
        traffic: cfg.traffic.clone(),
    }
}

/// Periodic stats observer. Default/minimum period enforced in
/// [`Service::new`]. On a non-zero byte delta it is the reporter
/// (`reporter.rs`) that actually publishes and subtracts — this loop only
/// surfaces status/event data, per the Open Question resolution that the
/// handler-level 5s sampler is the sole traffic-accounting path.
async fn observe_stats(
    status: Arc<ServiceStatus>,
    _traffic: Arc<crate::traffic::TrafficManager>,
    service_name: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if status.stats.take_updated() {
                    log::trace!(
                        "service {service_name}: conns={} total={} errs={}",
                        status.stats.current_conns.load(Ordering::Relaxed),
                        status.stats.total_conns.load(Ordering::Relaxed),
                        status.stats.total_errs.load(Ordering::Relaxed),
                    );
                }
            }
        }
    }
}
