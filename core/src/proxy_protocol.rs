//! PROXY protocol v1 (text) decoding, grounded in
//! `original_source/go-gost/x/listener/tls/listener.go`'s use of
//! `proxyproto.WrapListener` ahead of the TLS handshake — the listener's
//! ordered accept chain (§4.F) puts the proxy-protocol decoder first, so
//! any client address it carries is the one the forwarding handler
//! records instead of the raw socket peer.
//!
//! Only the v1 text header is implemented (`PROXY TCP4/TCP6 <src> <dst>
//! <sport> <dport>\r\n` or `PROXY UNKNOWN\r\n`); the binary v2 header is
//! out of scope — proxy-protocol internals beyond client-address
//! enrichment are an external collaborator per spec.md §1.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEADER_LEN: usize = 107; // longest possible v1 header per the spec
const PEEK_TIMEOUT: Duration = Duration::from_secs(2);

/// Peeks at most one line for a `PROXY ...` header. Returns the
/// source address it carries (if any) plus however many bytes were
/// consumed — callers must re-prepend any consumed-but-not-header bytes
/// to the stream, matching the sniff phase's prefix-preservation
/// contract.
pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> (Option<IpAddr>, Vec<u8>) {
    let mut buf = Vec::with_capacity(MAX_HEADER_LEN);
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= MAX_HEADER_LEN {
            return (None, buf);
        }
        match tokio::time::timeout(PEEK_TIMEOUT, reader.read(&mut byte)).await {
            Ok(Ok(1)) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    break;
                }
            }
            _ => return (None, buf),
        }
    }

    match parse_header(&buf) {
        Some(ip) => (Some(ip), Vec::new()),
        None => (None, buf),
    }
}

fn parse_header(line: &[u8]) -> Option<IpAddr> {
    let text = std::str::from_utf8(line).ok()?.trim_end();
    let mut parts = text.split_whitespace();
    if parts.next()? != "PROXY" {
        return None;
    }
    match parts.next()? {
        "UNKNOWN" => None,
        "TCP4" | "TCP6" => parts.next()?.parse::<IpAddr>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Feeds `payload` through an in-memory duplex pair so `decode` sees a
    /// genuine `AsyncRead` rather than a synchronous buffer.
    async fn decode_bytes(payload: &'static [u8]) -> (Option<IpAddr>, Vec<u8>) {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let _ = client.write_all(payload).await;
        });
        decode(&mut server).await
    }

    #[tokio::test]
    async fn decodes_tcp4_header_and_consumes_it() {
        let (ip, leftover) =
            decode_bytes(b"PROXY TCP4 203.0.113.7 198.51.100.1 56324 443\r\nGET / HTTP/1.1\r\n").await;
        assert_eq!(ip, Some("203.0.113.7".parse().unwrap()));
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn unknown_header_yields_no_address() {
        let (ip, _) = decode_bytes(b"PROXY UNKNOWN\r\nrest").await;
        assert_eq!(ip, None);
    }

    #[tokio::test]
    async fn non_proxy_prefix_is_preserved_for_replay() {
        let (ip, leftover) = decode_bytes(b"GET / HTTP/1.1\r\n").await;
        assert_eq!(ip, None);
        assert_eq!(leftover, b"GET / HTTP/1.1\r\n");
    }
}
