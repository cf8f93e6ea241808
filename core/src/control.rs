//! Control-channel session: WebSocket reconnect loop, encrypted/
//! compressed frame unwrapping, command routing, and the three-phase
//! transactional registry mutations. Grounded in
//! `original_source/go-gost/x/socket/websocket_reporter.go` (dial URL
//! shape, reconnect/telemetry cadence, command routing table) blended
//! with the teacher's `yahoo_logic/upstream.rs` connection-lifecycle
//! idiom (outer reconnect loop, inner `tokio::select!` over read/ticker),
//! and `x/api/config_service.go`'s `pauseServices`/`resumeServices`
//! three-phase validate/apply/commit structure.

use std::io::Read as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::chain::Chain;
use crate::config::types::ServiceConfig;
use crate::core::Core;
use crate::crypto::Codec;
use crate::telemetry::HostTelemetry;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const READ_DEADLINE: Duration = Duration::from_secs(30);
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(2);
const TCP_PING_DEFAULT_COUNT: u32 = 4;
const TCP_PING_DEFAULT_TIMEOUT_MS: u64 = 5000;
const TCP_PING_GAP: Duration = Duration::from_millis(100);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = futures_util::stream::SplitSink<WsStream, WsMessage>;

/// Connection state, per the data model's control-channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Draining,
}

#[derive(Debug, Deserialize)]
struct CommandMessage {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    data: Value,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommandResponse {
    #[serde(rename = "type")]
    type_: String,
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

/// Long-lived session driving one controller connection. A single
/// outbound writer is serialised by an async mutex so the telemetry
/// ticker and the command-response path never interleave a write.
pub struct ControlChannel {
    core: Arc<Core>,
    controller_addr: String,
    secret: String,
    client_ip: Option<String>,
    version: Option<String>,
    codec: Option<Arc<Codec>>,
    state: std::sync::Mutex<SessionState>,
}

impl ControlChannel {
    pub fn new(
        core: Arc<Core>,
        controller_addr: String,
        secret: String,
        client_ip: Option<String>,
        version: Option<String>,
        codec: Option<Arc<Codec>>,
    ) -> Self {
        Self {
            core,
            controller_addr,
            secret,
            client_ip,
            version,
            codec,
            state: std::sync::Mutex::new(SessionState::Idle),
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("control channel state lock poisoned") = state;
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("control channel state lock poisoned")
    }

    fn dial_url(&self) -> String {
        let mut url = format!(
            "ws://{}/system-info?type=1&secret={}",
            self.controller_addr, self.secret
        );
        if let Some(ip) = &self.client_ip {
            url.push_str(&format!("&client_ip={ip}"));
        }
        if let Some(v) = &self.version {
            url.push_str(&format!("&version={v}"));
        }
        url
    }

    /// Outer reconnect loop: dial, run the session to completion, wait
    /// `RECONNECT_INTERVAL`, repeat, until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            self.set_state(SessionState::Connecting);
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(self.dial_url())).await {
                Ok(Ok((stream, _response))) => {
                    log::info!("control channel: connected to {}", self.controller_addr);
                    self.set_state(SessionState::Connected);
                    let span = tracing::info_span!("control_session", controller = %self.controller_addr);
                    let (write, read) = stream.split();
                    self.session_loop(write, read, shutdown.child_token())
                        .instrument(span)
                        .await;
                }
                Ok(Err(e)) => log::warn!("control channel: dial failed: {e}"),
                Err(_) => log::warn!("control channel: handshake timed out"),
            }

            self.set_state(SessionState::Draining);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            }
            self.set_state(SessionState::Idle);
        }
    }

    async fn session_loop(
        &self,
        write: WsWrite,
        mut read: futures_util::stream::SplitStream<WsStream>,
        cancel: CancellationToken,
    ) {
        let write = Arc::new(AsyncMutex::new(write));
        let mut telemetry = HostTelemetry::new();
        let mut ticker = tokio::time::interval(TELEMETRY_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let mut w = write.lock().await;
                    let _ = w.close().await;
                    return;
                }
                _ = ticker.tick() => {
                    let info = telemetry.collect().await;
                    let body = serde_json::to_vec(&info).expect("SystemInfo always serialises");
                    self.send_frame(&write, &self.wrap_outbound(&body)).await;
                }
                readout = tokio::time::timeout(READ_DEADLINE, read.next()) => {
                    match readout {
                        Ok(Some(Ok(WsMessage::Text(text)))) => {
                            self.handle_inbound(&write, text.as_str()).await;
                        }
                        Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => {
                            log::info!("control channel: connection closed by controller");
                            return;
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            log::warn!("control channel: read error: {e}");
                            return;
                        }
                        Err(_) => {
                            log::warn!("control channel: read deadline exceeded");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn wrap_outbound(&self, body: &[u8]) -> Value {
        match &self.codec {
            Some(codec) => json!({
                "encrypted": true,
                "data": codec.encrypt(body),
                "timestamp": chrono::Utc::now().timestamp(),
            }),
            None => serde_json::from_slice(body).unwrap_or(Value::Null),
        }
    }

    async fn send_frame(&self, write: &Arc<AsyncMutex<WsWrite>>, value: &Value) {
        let text = value.to_string();
        let mut w = write.lock().await;
        if let Err(e) = w.send(WsMessage::Text(text.into())).await {
            log::warn!("control channel: write failed: {e}");
        }
    }

    async fn handle_inbound(&self, write: &Arc<AsyncMutex<WsWrite>>, text: &str) {
        let mut value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("control channel: malformed frame: {e}");
                return;
            }
        };

        if value.get("encrypted").and_then(Value::as_bool) == Some(true) {
            let Some(codec) = &self.codec else {
                log::warn!("control channel: received encrypted frame with no codec configured");
                return;
            };
            let Some(data) = value.get("data").and_then(Value::as_str) else {
                log::warn!("control channel: encrypted frame missing data field");
                return;
            };
            let plaintext = match codec.decrypt(data) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("control channel: decrypt failed: {e}");
                    return;
                }
            };
            value = match serde_json::from_slice(&plaintext) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("control channel: decrypted body is not valid JSON: {e}");
                    return;
                }
            };
        }

        if value.get("compressed").and_then(Value::as_bool) == Some(true) {
            match decompress_command(&value) {
                Ok(expanded) => value = expanded,
                Err(e) => {
                    log::warn!("control channel: decompress failed: {e}");
                    return;
                }
            }
        }

        let mut command: CommandMessage = match serde_json::from_value(value) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("control channel: malformed command: {e}");
                return;
            }
        };

        if command.type_ == "call" {
            // Stub pending server-side definition; accept and no-op.
            return;
        }

        normalize_durations(&mut command.data);

        tracing::debug!(
            command = %command.type_,
            request_id = command.request_id.as_deref().unwrap_or(""),
            "dispatching control-channel command"
        );
        let (success, message, data) = self.dispatch(&command.type_, command.data).await;

        let response = CommandResponse {
            type_: format!("{}Response", command.type_),
            success,
            message,
            data,
            request_id: command.request_id,
        };
        let body = serde_json::to_vec(&response).expect("CommandResponse always serialises");
        self.send_frame(write, &self.wrap_outbound(&body)).await;
    }

    async fn dispatch(&self, type_: &str, data: Value) -> (bool, String, Option<Value>) {
        let result = match type_ {
            "AddService" => self.add_services(data).await,
            "UpdateService" => self.update_services(data).await,
            "DeleteService" => self.delete_services(data).await,
            "PauseService" => self.pause_services(data).await,
            "ResumeService" => self.resume_services(data).await,
            "AddChains" | "UpdateChains" => self.upsert_chain(data).await,
            "DeleteChains" => self.delete_chain(data).await,
            "AddLimiters" | "UpdateLimiters" => self.upsert_limiter(data).await,
            "DeleteLimiters" => self.delete_limiter(data).await,
            "TcpPing" => Ok(tcp_ping(data).await),
            "Ping" => Ok(os_ping(data).await),
            other => Err(crate::error::ForwardError::Invalid(format!("unknown command type {other:?}"))),
        };
        match result {
            Ok(value) => (true, "ok".to_string(), Some(value)),
            Err(e) => (false, format!("{}: {e}", e.kind()), None),
        }
    }

    // -- Service batch commands -----------------------------------------

    async fn add_services(&self, data: Value) -> Result<Value, crate::error::ForwardError> {
        let items: Vec<ServiceConfig> = parse_batch(data)?;
        for item in &items {
            if item.name.trim().is_empty() {
                return Err(invalid("service name must not be empty"));
            }
            if self.core.services.is_registered(&item.name) {
                return Err(duplicate(&item.name));
            }
        }

        let mut started = Vec::new();
        for item in &items {
            if let Err(e) = self.core.start_service(item).await {
                for name in started.iter().rev() {
                    self.core.stop_service(name).await;
                }
                return Err(e);
            }
            started.push(item.name.clone());
        }

        let persisted = self.core.config.on_update(|c| {
            c.services.extend(items.iter().cloned());
            Ok(())
        });
        if let Err(e) = persisted {
            for name in started.iter().rev() {
                self.core.stop_service(name).await;
            }
            return Err(fatal(e));
        }
        Ok(json!({ "added": started }))
    }

    async fn update_services(&self, data: Value) -> Result<Value, crate::error::ForwardError> {
        let items: Vec<ServiceConfig> = parse_batch(data)?;
        let before = self.core.config.global();
        for item in &items {
            if before.service(&item.name).is_none() {
                return Err(not_found(&item.name));
            }
        }

        let mut previous = Vec::new();
        for item in &items {
            let old = before.service(&item.name).cloned();
            if let Err(e) = self.core.update_service(item).await {
                for prev in previous.iter().rev() {
                    let _ = self.core.update_service(prev).await;
                }
                return Err(e);
            }
            if let Some(old) = old {
                previous.push(old);
            }
        }

        let persisted = self.core.config.on_update(|c| {
            for item in &items {
                if let Some(slot) = c.service_mut(&item.name) {
                    *slot = item.clone();
                }
            }
            Ok(())
        });
        if let Err(e) = persisted {
            for prev in previous.iter().rev() {
                let _ = self.core.update_service(prev).await;
            }
            return Err(fatal(e));
        }
        Ok(json!({ "updated": items.iter().map(|i| i.name.clone()).collect::<Vec<_>>() }))
    }

    async fn delete_services(&self, data: Value) -> Result<Value, crate::error::ForwardError> {
        let names: Vec<String> = parse_batch(data)?;
        let before = self.core.config.global();
        for name in &names {
            if before.service(name).is_none() {
                return Err(not_found(name));
            }
        }

        let mut removed = Vec::new();
        for name in &names {
            let cfg = before.service(name).cloned();
            self.core.stop_service(name).await;
            if let Some(cfg) = cfg {
                removed.push(cfg);
            }
        }

        let persisted = self.core.config.on_update(|c| {
            c.services.retain(|s| !names.contains(&s.name));
            Ok(())
        });
        if let Err(e) = persisted {
            for cfg in removed.iter().rev() {
                let _ = self.core.start_service(cfg).await;
            }
            return Err(fatal(e));
        }
        Ok(json!({ "deleted": names }))
    }

    async fn pause_services(&self, data: Value) -> Result<Value, crate::error::ForwardError> {
        let names: Vec<String> = parse_batch(data)?;
        let before = self.core.config.global();
        for name in &names {
            let svc = before.service(name).ok_or_else(|| not_found(name))?;
            if svc.is_paused() {
                return Err(invalid(&format!("{name} is already paused")));
            }
        }

        let mut paused = Vec::new();
        for name in &names {
            self.core.pause_service(name).await;
            paused.push(name.clone());
        }

        let persisted = self.core.config.on_update(|c| {
            for name in &names {
                if let Some(slot) = c.service_mut(name) {
                    slot.set_paused(true);
                }
            }
            Ok(())
        });
        if let Err(e) = persisted {
            for name in paused.iter().rev() {
                if let Some(cfg) = before.service(name) {
                    let _ = self.core.start_service(cfg).await;
                }
            }
            return Err(fatal(e));
        }
        Ok(json!({ "paused": names }))
    }

    async fn resume_services(&self, data: Value) -> Result<Value, crate::error::ForwardError> {
        let names: Vec<String> = parse_batch(data)?;
        let before = self.core.config.global();
        for name in &names {
            let svc = before.service(name).ok_or_else(|| not_found(name))?;
            if !svc.is_paused() {
                return Err(invalid(&format!("{name} is not paused")));
            }
        }

        let mut resumed = Vec::new();
        for name in &names {
            let mut cfg = before.service(name).cloned().expect("checked above");
            cfg.set_paused(false);
            self.core.resume_service(&cfg).await?;
            resumed.push(name.clone());
        }

        let persisted = self.core.config.on_update(|c| {
            for name in &names {
                if let Some(slot) = c.service_mut(name) {
                    slot.set_paused(false);
                }
            }
            Ok(())
        });
        if let Err(e) = persisted {
            for name in resumed.iter().rev() {
                self.core.pause_service(name).await;
            }
            return Err(fatal(e));
        }
        Ok(json!({ "resumed": names }))
    }

    // -- Single-item chain/limiter commands --------------------------------

    async fn upsert_chain(&self, data: Value) -> Result<Value, crate::error::ForwardError> {
        let cfg: crate::config::types::ChainConfig = serde_json::from_value(data).map_err(parse_err)?;
        if cfg.name.trim().is_empty() {
            return Err(invalid("chain name must not be empty"));
        }
        self.core.chains.unregister(&cfg.name);
        self.core.chains.register(&cfg.name, Arc::new(Chain::from_config(&cfg)))?;
        self.core
            .config
            .on_update(|c| {
                c.chains.retain(|existing| existing.name != cfg.name);
                c.chains.push(cfg.clone());
                Ok(())
            })
            .map_err(fatal)?;
        Ok(json!({ "chain": cfg.name }))
    }

    async fn delete_chain(&self, data: Value) -> Result<Value, crate::error::ForwardError> {
        let name = single_name(data)?;
        if self.core.chains.unregister(&name).is_none() {
            return Err(not_found(&name));
        }
        self.core
            .config
            .on_update(|c| {
                c.chains.retain(|existing| existing.name != name);
                Ok(())
            })
            .map_err(fatal)?;
        Ok(json!({ "deleted": name }))
    }

    async fn upsert_limiter(&self, data: Value) -> Result<Value, crate::error::ForwardError> {
        let cfg: crate::config::types::LimiterConfig = serde_json::from_value(data).map_err(parse_err)?;
        if cfg.name.trim().is_empty() {
            return Err(invalid("limiter name must not be empty"));
        }
        self.core.limiters.unregister(&cfg.name);
        self.core.limiters.register(&cfg.name, cfg.clone())?;
        self.core
            .config
            .on_update(|c| {
                c.limiters.retain(|existing| existing.name != cfg.name);
                c.limiters.push(cfg.clone());
                Ok(())
            })
            .map_err(fatal)?;
        Ok(json!({ "limiter": cfg.name }))
    }

    async fn delete_limiter(&self, data: Value) -> Result<Value, crate::error::ForwardError> {
        let name = single_name(data)?;
        if self.core.limiters.unregister(&name).is_none() {
            return Err(not_found(&name));
        }
        self.core
            .config
            .on_update(|c| {
                c.limiters.retain(|existing| existing.name != name);
                Ok(())
            })
            .map_err(fatal)?;
        Ok(json!({ "deleted": name }))
    }
}

fn invalid(msg: &str) -> crate::error::ForwardError {
    crate::error::ForwardError::Invalid(msg.to_string())
}
fn duplicate(name: &str) -> crate::error::ForwardError {
    crate::error::ForwardError::Duplicate(name.to_string())
}
fn not_found(name: &str) -> crate::error::ForwardError {
    crate::error::ForwardError::NotFound(name.to_string())
}
fn fatal(e: impl std::fmt::Display) -> crate::error::ForwardError {
    crate::error::ForwardError::Fatal(e.to_string())
}
fn parse_err(e: impl std::fmt::Display) -> crate::error::ForwardError {
    crate::error::ForwardError::Parse(e.to_string())
}

fn parse_batch<T: serde::de::DeserializeOwned>(data: Value) -> Result<Vec<T>, crate::error::ForwardError> {
    let array = data.get("data").cloned().unwrap_or(data);
    serde_json::from_value(array).map_err(parse_err)
}

fn single_name(data: Value) -> Result<String, crate::error::ForwardError> {
    data.get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid("missing name"))
}

/// Decompresses a `{type, compressed:true, data:<base64-of-gzipped-json>,
/// requestId?}` frame into a plain `CommandMessage`-shaped value, per
/// "gunzip `data` to yield the command's `data` field".
fn decompress_command(value: &Value) -> Result<Value, String> {
    let type_ = value.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
    let request_id = value.get("requestId").and_then(Value::as_str).map(str::to_string);
    let encoded = value
        .get("data")
        .and_then(Value::as_str)
        .ok_or("compressed frame missing data field")?;
    let gz_bytes = BASE64.decode(encoded).map_err(|e| e.to_string())?;
    let mut decoder = GzDecoder::new(&gz_bytes[..]);
    let mut raw_json = String::new();
    decoder.read_to_string(&mut raw_json).map_err(|e| e.to_string())?;
    let inner_data: Value = serde_json::from_str(&raw_json).map_err(|e| e.to_string())?;
    Ok(json!({ "type": type_, "data": inner_data, "requestId": request_id }))
}

/// Walks a JSON tree replacing any string-valued `failTimeout` field with
/// its parsed nanosecond value; integers and unparseable strings pass
/// through unchanged.
pub fn normalize_durations(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get("failTimeout") {
                if let Some(ns) = parse_duration_ns(s) {
                    map.insert("failTimeout".to_string(), json!(ns));
                }
            }
            for v in map.values_mut() {
                normalize_durations(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                normalize_durations(item);
            }
        }
        _ => {}
    }
}

/// Minimal Go-style duration literal parser: sequences of
/// `<number><unit>` where unit is one of `ns`, `us`/`µs`, `ms`, `s`, `m`,
/// `h`. Handles the forms the control channel actually sends ("30s",
/// "1m30s", "500ms").
fn parse_duration_ns(s: &str) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    let negative = s.starts_with('-');
    let body = s.strip_prefix(['-', '+']).unwrap_or(s);
    if body.is_empty() {
        return None;
    }

    let bytes = body.as_bytes();
    let mut i = 0;
    let mut total = 0f64;
    let mut matched_any = false;

    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        if i == start {
            return None;
        }
        let number: f64 = body[start..i].parse().ok()?;

        let unit_start = i;
        while i < bytes.len() && !(bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        let unit = &body[unit_start..i];
        let unit_ns = match unit {
            "ns" => 1.0,
            "us" | "\u{b5}s" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60_000_000_000.0,
            "h" => 3_600_000_000_000.0,
            _ => return None,
        };
        total += number * unit_ns;
        matched_any = true;
    }

    if !matched_any {
        return None;
    }
    Some(if negative { -(total as i64) } else { total as i64 })
}

#[derive(Debug, Deserialize)]
struct TcpPingRequest {
    ip: String,
    port: u16,
    #[serde(default = "default_count")]
    count: u32,
    #[serde(default = "default_timeout_ms")]
    timeout: u64,
}

fn default_count() -> u32 {
    TCP_PING_DEFAULT_COUNT
}
fn default_timeout_ms() -> u64 {
    TCP_PING_DEFAULT_TIMEOUT_MS
}

async fn tcp_ping(data: Value) -> Value {
    let req: TcpPingRequest = match serde_json::from_value(data) {
        Ok(r) => r,
        Err(e) => return json!({ "error": format!("parse: {e}") }),
    };
    let attempts = req.count.max(1);
    let timeout = Duration::from_millis(req.timeout.max(1));
    let addr = format!("{}:{}", req.ip, req.port);

    let mut successes = 0u32;
    let mut total_elapsed = Duration::ZERO;
    for attempt in 0..attempts {
        let started = Instant::now();
        if tokio::time::timeout(timeout, TcpStream::connect(&addr)).await.map(|r| r.is_ok()).unwrap_or(false) {
            successes += 1;
            total_elapsed += started.elapsed();
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(TCP_PING_GAP).await;
        }
    }

    let average_time_ms = if successes > 0 {
        total_elapsed.as_secs_f64() * 1000.0 / successes as f64
    } else {
        0.0
    };
    let packet_loss = 1.0 - (successes as f64 / attempts as f64);
    json!({ "averageTime": average_time_ms, "packetLoss": packet_loss })
}

async fn os_ping(data: Value) -> Value {
    let ip = data.get("ip").and_then(Value::as_str).unwrap_or_default().to_string();
    let count = data.get("count").and_then(Value::as_u64).unwrap_or(4).max(1);

    let output = if cfg!(target_os = "windows") {
        tokio::process::Command::new("ping")
            .arg("-n")
            .arg(count.to_string())
            .arg(&ip)
            .output()
            .await
    } else {
        tokio::process::Command::new("ping")
            .arg("-c")
            .arg(count.to_string())
            .arg(&ip)
            .output()
            .await
    };

    let Ok(output) = output else {
        return json!({ "averageTime": 0.0, "packetLoss": 1.0 });
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let (average_time, packet_loss) = parse_ping_output(&text);
    json!({ "averageTime": average_time, "packetLoss": packet_loss })
}

fn parse_ping_output(text: &str) -> (f64, f64) {
    let packet_loss = text
        .lines()
        .find_map(|line| {
            let idx = line.find("% packet loss")?;
            let start = line[..idx].rfind(char::is_whitespace).map(|p| p + 1).unwrap_or(0);
            line[start..idx].parse::<f64>().ok().map(|pct| pct / 100.0)
        })
        .unwrap_or(1.0);

    let average_time = text
        .lines()
        .find_map(|line| {
            let stats = line.split('=').nth(1)?;
            let first_field = stats.trim().split_whitespace().next()?;
            let avg_str = first_field.split('/').nth(1)?;
            avg_str.parse::<f64>().ok()
        })
        .unwrap_or(0.0);

    (average_time, packet_loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_seconds() {
        assert_eq!(parse_duration_ns("30s"), Some(30_000_000_000));
    }

    #[test]
    fn parses_compound_duration() {
        assert_eq!(parse_duration_ns("1m30s"), Some(90_000_000_000));
    }

    #[test]
    fn parses_milliseconds() {
        assert_eq!(parse_duration_ns("500ms"), Some(500_000_000));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert_eq!(parse_duration_ns("30x"), None);
    }

    #[test]
    fn normalizes_string_fail_timeout_in_place() {
        let mut value = json!({ "services": [{ "name": "x", "selector": { "failTimeout": "1m30s" } }] });
        normalize_durations(&mut value);
        assert_eq!(value["services"][0]["selector"]["failTimeout"], json!(90_000_000_000i64));
    }

    #[test]
    fn leaves_integer_fail_timeout_unchanged() {
        let mut value = json!({ "selector": { "failTimeout": 42 } });
        normalize_durations(&mut value);
        assert_eq!(value["selector"]["failTimeout"], json!(42));
    }

    #[test]
    fn leaves_unparseable_fail_timeout_untouched() {
        let mut value = json!({ "selector": { "failTimeout": "not-a-duration" } });
        normalize_durations(&mut value);
        assert_eq!(value["selector"]["failTimeout"], json!("not-a-duration"));
    }

    fn test_channel() -> ControlChannel {
        let store = crate::config::ConfigStore::load("/nonexistent/gost-control-test.json").unwrap();
        let runtime_config = crate::config::RuntimeConfig {
            addr: "controller.example:8080".into(),
            secret: "topsecret".into(),
            http: 0,
            tls: 0,
            socks: 0,
        };
        let core = Arc::new(crate::core::Core::new(runtime_config, store));
        ControlChannel::new(core, "controller.example:8080".into(), "topsecret".into(), None, None, None)
    }

    /// S3: a batch `AddService` where the second item collides with the
    /// first (same name) fails the whole batch and leaves neither the
    /// registry nor the persisted config touched.
    #[tokio::test]
    async fn add_services_rolls_back_mid_batch_duplicate() {
        let channel = test_channel();
        let data = json!({
            "data": [
                { "name": "a", "addr": "127.0.0.1:0" },
                { "name": "a", "addr": "127.0.0.1:0" },
            ]
        });

        let result = channel.add_services(data).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), "Duplicate");

        assert!(!channel.core.services.is_registered("a"));
        assert!(channel.core.config.global().services.is_empty());
    }

    /// A clean single-item `AddService` registers the service and
    /// persists it to the config snapshot.
    #[tokio::test]
    async fn add_services_registers_and_persists_on_success() {
        let channel = test_channel();
        let data = json!({ "data": [{ "name": "a", "addr": "127.0.0.1:0" }] });

        let result = channel.add_services(data).await;
        assert!(result.is_ok());
        assert!(channel.core.services.is_registered("a"));
        assert_eq!(channel.core.config.global().services.len(), 1);
    }

    #[test]
    fn parses_linux_ping_output() {
        let sample = "PING 1.1.1.1 (1.1.1.1): 56 data bytes\n\
            \n\
            --- 1.1.1.1 ping statistics ---\n\
            4 packets transmitted, 4 received, 0% packet loss, time 3005ms\n\
            rtt min/avg/max/mdev = 10.123/12.456/15.789/1.234 ms\n";
        let (avg, loss) = parse_ping_output(sample);
        assert_eq!(loss, 0.0);
        assert!((avg - 12.456).abs() < 1e-6);
    }

    /// S4: a `TcpPing` command arriving as an encrypted frame is decrypted,
    /// dispatched, and answered with a frame re-encrypted under the same
    /// codec — exercised over a real loopback WebSocket pair, not a direct
    /// call into `dispatch`.
    #[tokio::test]
    async fn encrypted_tcp_ping_round_trips_through_handle_inbound() {
        use tokio::net::TcpListener;

        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = echo.accept().await;
        });

        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (raw, _) = ws_listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(raw).await.unwrap();
            let (_write, mut read) = ws.split();
            let msg = read.next().await.unwrap().unwrap();
            msg.into_text().unwrap()
        });

        let (ws_stream, _) = connect_async(format!("ws://{ws_addr}/")).await.unwrap();
        let (write, _read) = ws_stream.split();
        let write = Arc::new(AsyncMutex::new(write));

        let codec = Arc::new(crate::crypto::Codec::new("topsecret"));
        let channel = {
            let mut c = test_channel();
            c.codec = Some(codec.clone());
            c
        };

        let command = json!({
            "type": "TcpPing",
            "requestId": "req-1",
            "data": { "ip": "127.0.0.1", "port": echo_addr.port(), "count": 1, "timeout": 500 },
        });
        let plaintext = serde_json::to_vec(&command).unwrap();
        let frame = json!({ "encrypted": true, "data": codec.encrypt(&plaintext) });

        channel.handle_inbound(&write, &frame.to_string()).await;

        let raw_response = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        let wrapped: Value = serde_json::from_str(&raw_response).unwrap();
        assert_eq!(wrapped["encrypted"], json!(true));
        let decrypted = codec.decrypt(wrapped["data"].as_str().unwrap()).unwrap();
        let response: Value = serde_json::from_slice(&decrypted).unwrap();

        assert_eq!(response["type"], json!("TcpPingResponse"));
        assert_eq!(response["success"], json!(true));
        assert_eq!(response["requestId"], json!("req-1"));
        assert_eq!(response["data"]["packetLoss"], json!(0.0));
    }
}
