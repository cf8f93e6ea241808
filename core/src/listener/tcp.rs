//! Plain TCP listener: a thin wrap around `tokio::net::TcpListener`.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::error::ForwardError;
use super::Conn;

pub struct TcpListenerHandle {
    inner: TcpListener,
}

impl TcpListenerHandle {
    pub async fn bind(addr: &str) -> Result<Self, ForwardError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| ForwardError::Fatal(format!("bind {addr}: {e}")))?;
        Ok(Self { inner })
    }

    pub async fn accept(&self) -> std::io::Result<(Conn, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        Ok((Conn::Plain(stream), addr))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
