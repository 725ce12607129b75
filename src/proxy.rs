//! Proxy server: accept loop, GUID sniffing, and instance dialing
//!
//! The server makes exactly one routing decision per connection, from the
//! first segment the client sends, before any instance byte flows back.
//! After that it is a dumb pipe; mid-stream GUIDs are never inspected.

use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

use crate::db::RoutingStore;
use crate::pool::BufferPool;
use crate::relay;
use crate::routing;

/// Listen address used when the configured one is empty.
pub const DEFAULT_LISTEN_ADDR: &str = ":8003";

/// GUID-routing proxy server.
pub struct Server {
    addr: String,
    target: String,
    store: Arc<dyn RoutingStore>,
    buffer_pool: BufferPool,
}

impl Server {
    /// Create a server that listens on `addr` and falls back to `target`.
    ///
    /// An empty `addr` becomes [`DEFAULT_LISTEN_ADDR`]. `target` must be in
    /// `host:port` form; validating it is the caller's configuration
    /// problem, not this server's.
    pub fn new(
        store: Arc<dyn RoutingStore>,
        addr: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let mut addr = addr.into();
        if addr.is_empty() {
            addr = DEFAULT_LISTEN_ADDR.to_string();
        }
        Self {
            addr,
            target: target.into(),
            store,
            buffer_pool: BufferPool::default(),
        }
    }

    /// Address the server listens on.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Default target in `host:port` form.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Bind the listen address and serve until the process exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound. There is no retry;
    /// a bind failure is fatal to the caller.
    pub async fn listen_and_serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr())
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        self.serve(listener).await
    }

    /// Accept connections forever, dispatching each to its own task.
    ///
    /// A failed accept is logged and the loop keeps going; a single bad
    /// connection attempt must not take the service down.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((client, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_conn(client, peer).await;
                    });
                }
                Err(e) => error!("failed to accept connection: {}", e),
            }
        }
    }

    /// The listen address in a form the socket layer accepts; the
    /// configured `:port` shorthand means every interface.
    fn bind_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }

    async fn handle_conn(&self, mut client: TcpStream, peer: SocketAddr) {
        debug!("new connection from {}", peer);

        let instance = match self.establish_instance_connection(&mut client).await {
            Ok(instance) => instance,
            Err(e) => {
                // Dropping the client socket closes it; nothing was dialed
                // or the dialed socket is already gone.
                warn!("closing connection from {}: {:#}", peer, e);
                return;
            }
        };

        let (sent, received) = relay::run(self.buffer_pool.clone(), client, instance).await;
        debug!(
            "connection from {} closed: {} bytes sent, {} bytes received",
            peer, sent, received
        );
    }

    /// Read the opening segment, resolve the destination, dial it, and
    /// forward the already-read bytes so the instance sees exactly what the
    /// client sent.
    async fn establish_instance_connection(&self, client: &mut TcpStream) -> Result<TcpStream> {
        let mut buffer = self.buffer_pool.acquire();
        let n = client
            .read(buffer.as_mut_slice())
            .await
            .context("failed to read opening bytes from client")?;
        if n == 0 {
            bail!("client closed the connection before sending any data");
        }
        let initial = &buffer[..n];

        let destination = self.resolve_destination(initial).await;
        let mut instance = TcpStream::connect(&destination)
            .await
            .with_context(|| format!("failed to dial instance at {}", destination))?;

        instance
            .write_all(initial)
            .await
            .with_context(|| format!("failed to forward opening bytes to {}", destination))?;

        Ok(instance)
    }

    /// Turn the opening segment into a destination address.
    ///
    /// Fail-open on every path: no GUID, an unknown device, and a store
    /// failure all resolve to the default target, so a degraded store costs
    /// routing precision but never availability.
    async fn resolve_destination(&self, initial: &[u8]) -> String {
        let Some(guid) = routing::extract_guid(initial) else {
            return self.target.clone();
        };
        match self.store.query(guid).await {
            Some(instance) if !instance.is_empty() => {
                let destination = routing::with_instance_host(&self.target, &instance);
                debug!("device {} is owned by {}", guid, instance);
                destination
            }
            _ => self.target.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Store stub with a scripted answer.
    struct StubStore(Option<String>);

    #[async_trait]
    impl RoutingStore for StubStore {
        async fn query(&self, _guid: &str) -> Option<String> {
            self.0.clone()
        }

        async fn health(&self) -> bool {
            false
        }
    }

    fn server_with(result: Option<&str>, target: &str) -> Server {
        Server::new(
            Arc::new(StubStore(result.map(String::from))),
            "",
            target,
        )
    }

    #[test]
    fn empty_listen_address_defaults() {
        let server = server_with(None, "target:1234");
        assert_eq!(server.addr(), ":8003");
        assert_eq!(server.target(), "target:1234");
    }

    #[test]
    fn explicit_listen_address_is_kept() {
        let server = Server::new(Arc::new(StubStore(None)), ":9000", "target:1234");
        assert_eq!(server.addr(), ":9000");
    }

    #[test]
    fn bind_addr_expands_bare_port() {
        assert_eq!(server_with(None, "t:1").bind_addr(), "0.0.0.0:8003");
        let explicit = Server::new(Arc::new(StubStore(None)), "127.0.0.1:8003", "t:1");
        assert_eq!(explicit.bind_addr(), "127.0.0.1:8003");
    }

    #[tokio::test]
    async fn lookup_hit_rewrites_host_and_keeps_port() {
        let server = server_with(Some("127.0.0.1"), "mps:1234");
        let request = b"GET /x/63f32fee-238e-4f6a-a091-092270d22439 HTTP/1.1\r\n\r\n";
        assert_eq!(server.resolve_destination(request).await, "127.0.0.1:1234");
    }

    #[tokio::test]
    async fn lookup_miss_falls_back_to_default_target() {
        let server = server_with(None, "mps:1234");
        let request = b"GET /x/63f32fee-238e-4f6a-a091-092270d22439 HTTP/1.1\r\n\r\n";
        assert_eq!(server.resolve_destination(request).await, "mps:1234");
    }

    #[tokio::test]
    async fn empty_lookup_result_falls_back_to_default_target() {
        let server = server_with(Some(""), "mps:1234");
        let request = b"GET /x/63f32fee-238e-4f6a-a091-092270d22439 HTTP/1.1\r\n\r\n";
        assert_eq!(server.resolve_destination(request).await, "mps:1234");
    }

    #[tokio::test]
    async fn missing_guid_skips_the_store() {
        // The scripted hit must not be consulted without a GUID.
        let server = server_with(Some("127.0.0.1"), "mps:1234");
        assert_eq!(
            server.resolve_destination(b"GET /api/v1/devices HTTP/1.1\r\n\r\n").await,
            "mps:1234"
        );
        assert_eq!(server.resolve_destination(b"no newline here").await, "mps:1234");
    }
}
