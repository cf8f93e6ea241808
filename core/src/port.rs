//! Best-effort forcible termination of established TCP sessions on a
//! local port, grounded in
//! `original_source/go-gost/x/internal/util/port/port.go`'s
//! `ForceClosePortConnections` (which shells out to `tcpkill` and always
//! recovers into a nil return). The open question of which of the repo's
//! three mutually-exclusive port-enforcer variants to keep is resolved
//! here in favour of `ss -K`, a single targeted command that needs no
//! helper process and no `/proc` scan of our own; `tcpkill` remains as a
//! fallback for hosts where `ss` lacks kill support.
//!
//! Contract: best effort, never panics, never surfaces an error to the
//! caller. Non-Linux hosts are a no-op.

/// Forcibly terminates established TCP sessions whose local address
/// matches `local_addr` (`host:port` or `:port`). Any internal failure is
/// logged and swallowed; this function cannot fail its caller.
pub async fn force_close_port_connections(local_addr: &str) {
    #[cfg(target_os = "linux")]
    {
        let Some(port) = parse_port(local_addr) else {
            log::debug!("port enforcer: could not parse port out of {local_addr:?}");
            return;
        };
        linux::force_close(port).await;
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = local_addr;
        log::debug!("port enforcer is a no-op on this platform");
    }
}

fn parse_port(local_addr: &str) -> Option<u16> {
    local_addr.rsplit(':').next()?.parse().ok()
}

#[cfg(target_os = "linux")]
mod linux {
    use tokio::process::Command;

    pub async fn force_close(port: u16) {
        if run_ss_kill(port).await {
            return;
        }
        log::debug!("port enforcer: ss -K unavailable or found nothing, falling back to tcpkill for port {port}");
        run_tcpkill(port).await;
    }

    async fn run_ss_kill(port: u16) -> bool {
        let filter = format!("sport = :{port}");
        match Command::new("ss").arg("-K").arg(&filter).output().await {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                log::debug!(
                    "port enforcer: ss -K exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr)
                );
                false
            }
            Err(e) => {
                log::debug!("port enforcer: failed to spawn ss: {e}");
                false
            }
        }
    }

    async fn run_tcpkill(port: u16) {
        let mut child = match Command::new("tcpkill")
            .arg("-i")
            .arg("any")
            .arg("port")
            .arg(port.to_string())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                log::debug!("port enforcer: failed to spawn tcpkill: {e}");
                return;
            }
        };
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        let _ = child.kill().await;
    }
}
