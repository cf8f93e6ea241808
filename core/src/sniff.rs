//! Byte-signature protocol classification, per the forwarding handler's
//! sniff phase. Grounded in `original_source/go-gost/x/handler/forward/
//! local/handler.go`'s use of `sniffing.Sniff()` ahead of a
//! `bufio.Reader`-backed re-wrap so the sniffed prefix is never consumed.

const HTTP_PREFIXES: &[&[u8]] = &[
    b"GET ", b"POST", b"PUT ", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"CONNECT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Tls,
    Socks,
    Unknown,
}

/// Classifies a connection's leading bytes without consuming them. The
/// caller is responsible for re-prepending `prefix` to the stream before
/// handing it to the selected downstream handler (see
/// [`crate::handler`]'s prefix-preserving reader wrap).
pub fn classify(prefix: &[u8]) -> Protocol {
    if is_http(prefix) {
        return Protocol::Http;
    }
    if is_tls(prefix) {
        return Protocol::Tls;
    }
    if is_socks(prefix) {
        return Protocol::Socks;
    }
    Protocol::Unknown
}

fn is_http(prefix: &[u8]) -> bool {
    HTTP_PREFIXES.iter().any(|p| prefix.starts_with(p))
}

fn is_tls(prefix: &[u8]) -> bool {
    matches!(prefix, [0x16, 0x03, 0x01..=0x04, ..])
}

fn is_socks(prefix: &[u8]) -> bool {
    match prefix.first() {
        Some(0x04) => prefix.len() >= 2 && matches!(prefix[1], 0x01 | 0x02),
        Some(0x05) => {
            let Some(&nmethods) = prefix.get(1) else {
                return false;
            };
            let methods = &prefix[2..];
            if methods.len() < nmethods as usize {
                // Not enough of the prefix has arrived yet to tell; treat
                // as plausible rather than unknown so the caller can wait
                // for more bytes if it chooses to.
                return nmethods as usize > 0;
            }
            methods[..nmethods as usize].iter().any(|&m| m == 0x00 || m == 0x02)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_methods() {
        assert_eq!(classify(b"GET / HTTP/1.1\r\n"), Protocol::Http);
        assert_eq!(classify(b"POST /upload HTTP/1.1\r\n"), Protocol::Http);
        assert_eq!(classify(b"CONNECT x:443 HTTP/1.1\r\n"), Protocol::Http);
    }

    #[test]
    fn classifies_tls_client_hello() {
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0x00, 0x40]), Protocol::Tls);
        assert_eq!(classify(&[0x16, 0x03, 0x03, 0x00, 0x40]), Protocol::Tls);
    }

    #[test]
    fn classifies_socks4_connect() {
        assert_eq!(classify(&[0x04, 0x01, 0x00, 0x50]), Protocol::Socks);
    }

    #[test]
    fn classifies_socks5_with_supported_method() {
        assert_eq!(classify(&[0x05, 0x01, 0x00]), Protocol::Socks);
        assert_eq!(classify(&[0x05, 0x02, 0x00, 0x02]), Protocol::Socks);
    }

    #[test]
    fn unknown_prefix_falls_through() {
        assert_eq!(classify(b"\x00\x00\x00\x00"), Protocol::Unknown);
        assert_eq!(classify(b""), Protocol::Unknown);
    }

    /// A third byte of `0x00` names no real TLS record version (1.0..1.3
    /// map to 0x01..0x04) and must not be classified as TLS.
    #[test]
    fn rejects_version_byte_zero() {
        assert_eq!(classify(&[0x16, 0x03, 0x00, 0x00, 0x40]), Protocol::Unknown);
    }
}
