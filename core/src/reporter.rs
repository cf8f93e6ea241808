//! Periodic HTTP sink reporters, grounded in
//! `original_source/go-gost/traffic/traffic_reporter.go`'s
//! `StartTrafficReporter` (5s ticker, `TrafficReportItem{n,t,u,d}`, POST
//! + literal `"ok"` check) and the config-reporter variant in
//! `x/service/service.go`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::Core;
use crate::crypto::Codec;
use crate::traffic::{Stats, TrafficManager};

const TRAFFIC_TICK: Duration = Duration::from_secs(5);
const CONFIG_TICK: Duration = Duration::from_secs(600);
const TRAFFIC_TIMEOUT: Duration = Duration::from_secs(5);
const CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

/// One service-key's delta, matching the wire shape `{n,t,u,d}`.
#[derive(Debug, Serialize)]
struct TrafficReportItem {
    n: String,
    t: String,
    u: i64,
    d: i64,
}

fn split_service_key(key: &str) -> Option<(&str, &str)> {
    let (service, kind) = key.rsplit_once(':')?;
    Some((service, kind))
}

fn to_report_items(snapshot: &HashMap<String, Stats>) -> Vec<TrafficReportItem> {
    snapshot
        .iter()
        .filter_map(|(key, stats)| {
            let (service, kind) = split_service_key(key)?;
            Some(TrafficReportItem {
                n: service.to_string(),
                t: kind.to_string(),
                u: stats.upload,
                d: stats.download,
            })
        })
        .collect()
}

/// Wraps `body` for the wire if a codec is configured, matching the
/// encrypted-envelope shape `{encrypted:true, data, timestamp}`.
fn maybe_encrypt(body: &[u8], codec: Option<&Codec>) -> serde_json::Value {
    match codec {
        Some(codec) => serde_json::json!({
            "encrypted": true,
            "data": codec.encrypt(body),
            "timestamp": chrono::Utc::now().timestamp(),
        }),
        None => serde_json::from_slice(body).unwrap_or(serde_json::Value::Null),
    }
}

async fn post_and_check_ok(client: &reqwest::Client, url: &str, body: serde_json::Value, timeout: Duration) -> bool {
    let result = client
        .post(url)
        .timeout(timeout)
        .json(&body)
        .send()
        .await;
    match result {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(text) if text.trim() == "ok" => true,
            Ok(text) => {
                log::warn!("publish to {url} rejected: unexpected body {text:?}");
                false
            }
            Err(e) => {
                log::warn!("publish to {url}: failed to read response body: {e}");
                false
            }
        },
        Ok(resp) => {
            log::warn!("publish to {url} rejected: status {}", resp.status());
            false
        }
        Err(e) => {
            log::warn!("publish to {url} failed: {e}");
            false
        }
    }
}

/// Periodic (5s) drain-and-publish of traffic counters. On success the
/// published delta is subtracted so concurrently-accumulated bytes are
/// preserved; on failure nothing is subtracted and the same residual is
/// re-read next tick.
pub async fn run_traffic_reporter(
    controller_addr: String,
    secret: String,
    traffic: Arc<TrafficManager>,
    codec: Option<Arc<Codec>>,
    cancel: CancellationToken,
) {
    let client = reqwest::Client::new();
    let url = format!("http://{controller_addr}/flow/upload?secret={secret}");
    let mut ticker = tokio::time::interval(TRAFFIC_TICK);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let snapshot = traffic.get_all_services_stats();
        if snapshot.is_empty() {
            continue;
        }
        let items = to_report_items(&snapshot);
        let body = serde_json::to_vec(&items).expect("traffic report items always serialise");
        let payload = maybe_encrypt(&body, codec.as_deref());

        if post_and_check_ok(&client, &url, payload, TRAFFIC_TIMEOUT).await {
            traffic.subtract_traffic_stats(&snapshot);
        }
    }
}

/// Periodic (10 minute) drain-and-publish of the authoritative config
/// plus each service's latest status snapshot.
pub async fn run_config_reporter(
    controller_addr: String,
    secret: String,
    core: Arc<Core>,
    codec: Option<Arc<Codec>>,
    cancel: CancellationToken,
) {
    let client = reqwest::Client::new();
    let url = format!("http://{controller_addr}/flow/config?secret={secret}");
    let mut ticker = tokio::time::interval(CONFIG_TICK);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let snapshot = config_snapshot_with_status(&core);
        let body = serde_json::to_vec(&snapshot).expect("config snapshot always serialises");
        let payload = maybe_encrypt(&body, codec.as_deref());
        post_and_check_ok(&client, &url, payload, CONFIG_TIMEOUT).await;
    }
}

/// Merges each running service's latest status snapshot into its entry
/// in the authoritative config, matching the wire contract's "full config
/// snapshot with per-service status embedded".
fn config_snapshot_with_status(core: &Core) -> serde_json::Value {
    let mut value = serde_json::to_value(core.config_snapshot()).expect("GostConfig always serialises");
    if let Some(services) = value.get_mut("services").and_then(|v| v.as_array_mut()) {
        for entry in services.iter_mut() {
            let Some(name) = entry.get("name").and_then(|v| v.as_str()).map(str::to_string) else {
                continue;
            };
            let Some(service) = core.services.get(&name) else {
                continue;
            };
            let Ok(status) = serde_json::to_value(service.status_snapshot()) else {
                continue;
            };
            entry
                .as_object_mut()
                .expect("service config entries serialise as objects")
                .insert("status".to_string(), status);
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_service_key_into_name_and_kind() {
        assert_eq!(split_service_key("s1:conn"), Some(("s1", "conn")));
        assert_eq!(split_service_key("s1:cc"), Some(("s1", "cc")));
        assert_eq!(split_service_key("noop"), None);
    }

    #[test]
    fn report_items_carry_the_wire_field_names() {
        let mut snapshot = HashMap::new();
        snapshot.insert("s1:conn".to_string(), Stats { upload: 10, download: 20 });
        let items = to_report_items(&snapshot);
        assert_eq!(items.len(), 1);
        let value = serde_json::to_value(&items[0]).unwrap();
        assert_eq!(value["n"], "s1");
        assert_eq!(value["t"], "conn");
        assert_eq!(value["u"], 10);
        assert_eq!(value["d"], 20);
    }

    /// The `/flow/config` body is the authoritative config with each
    /// running service's status embedded in its own entry, not a bare
    /// `GostConfig` dump.
    #[tokio::test]
    async fn config_snapshot_embeds_running_service_status() {
        let store = crate::config::ConfigStore::load("/nonexistent/gost-reporter-test.json").unwrap();
        let runtime_config = crate::config::RuntimeConfig {
            addr: "controller.example:8080".into(),
            secret: "topsecret".into(),
            http: 0,
            tls: 0,
            socks: 0,
        };
        let core = Core::new(runtime_config, store);
        let cfg = crate::config::types::ServiceConfig {
            name: "s1".into(),
            addr: "127.0.0.1:0".into(),
            ..Default::default()
        };
        core.start_service(&cfg).await.unwrap();

        let value = config_snapshot_with_status(&core);
        let services = value["services"].as_array().expect("services is an array");
        assert_eq!(services.len(), 1);
        let status = &services[0]["status"];
        assert!(matches!(status["state"].as_str(), Some("running") | Some("ready")));
        assert_eq!(status["totalConns"], 0);
        assert_eq!(status["currentConns"], 0);
        assert_eq!(status["totalErrs"], 0);
        assert_eq!(status["events"], serde_json::json!([]));
    }
}
