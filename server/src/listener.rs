use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::handler::serve_connection;
use crate::ServerError;

/// Accepts client connections and serves each one on its own task.
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        context: Arc<ServerContext>,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, context, config))
    }

    /// Serves on an already bound listener.
    pub fn new(listener: TcpListener, context: Arc<ServerContext>, config: ServerConfig) -> Self {
        Self {
            listener,
            context,
            config,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until `shutdown` completes, then aborts the ones
    /// still open.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(%addr, "Listening");
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, "Could not disable Nagle's algorithm: {e}");
                    }
                    let context = self.context.clone();
                    let config = self.config.clone();
                    connections.spawn(
                        async move {
                            // Failures are logged by the connection itself
                            let _ =
                                serve_connection(stream, peer.to_string(), context, config).await;
                        }
                        .instrument(info_span!("connection", %peer)),
                    );
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!("Connection task failed: {e}");
                    }
                }
            }
        }

        info!(%addr, open = connections.len(), "Shutting down");
        connections.shutdown().await;
        Ok(())
    }
}
