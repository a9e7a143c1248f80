//! HTTP server implementation.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use super::handlers::{router, AppState};
use crate::error::Result;

/// HTTP server for the rate limited service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
    /// How long in-flight requests may run after shutdown is requested
    shutdown_grace: Duration,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState, shutdown_grace: Duration) -> Self {
        Self {
            addr,
            state,
            shutdown_grace,
        }
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// After the signal, in-flight requests get `shutdown_grace` to finish
    /// before the server stops waiting for them.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Starting HTTP server");

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();

        let stopping = Arc::new(Notify::new());
        let trigger = Arc::clone(&stopping);
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                trigger.notify_one();
            })
            .into_future();

        let grace = self.shutdown_grace;
        tokio::select! {
            result = server => {
                result?;
                info!("HTTP server stopped");
            }
            _ = async {
                stopping.notified().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(grace = ?grace, "Shutdown grace period elapsed, dropping open connections");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{IdentityResolver, PolicyTable, Quota, RateLimiter};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn test_state() -> AppState {
        let policies = PolicyTable::new(Quota::per_second(2)).with_token("abc123", Quota::per_second(100));
        AppState::new(Arc::new(RateLimiter::new(policies)), IdentityResolver::default())
    }

    async fn raw_get(addr: SocketAddr, token: Option<&str>) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = String::from("GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
        if let Some(token) = token {
            request.push_str(&format!("API_KEY: {}\r\n", token));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let _server = HttpServer::new(addr, test_state(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_serves_and_limits_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = HttpServer::new(addr, test_state(), Duration::from_secs(1));
        let handle = tokio::spawn(server.serve_on(listener, async move {
            let _ = stop_rx.await;
        }));

        // IP identity from the peer address: capacity 2
        assert!(raw_get(addr, None).await.starts_with("HTTP/1.1 200"));
        assert!(raw_get(addr, None).await.starts_with("HTTP/1.1 200"));
        let denied = raw_get(addr, None).await;
        assert!(denied.starts_with("HTTP/1.1 429"));
        assert!(denied.to_ascii_lowercase().contains("retry-after: 1"));

        // A token identity has its own bucket
        assert!(raw_get(addr, Some("abc123")).await.starts_with("HTTP/1.1 200"));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
