//! Session supervisor: connect, supervise, reconnect
//!
//! The supervisor drives an explicit state machine:
//! `Disconnected -> Connecting -> Connected -> Disconnected` on connection
//! failure, forever, with a fixed delay between attempts. It only reaches
//! the terminal state on an explicit shutdown or a fatal authentication
//! rejection, which retrying cannot resolve. Each successful connect
//! installs a fresh `Wan` and routing table and replays every remote
//! forward registration; the local listeners are bound once and persist.

use crate::config::ClientConfig;
use crate::error::TunnelError;
use crate::forward::{self, ForwardingManager, SessionHandle};
use crate::routing::RoutingTable;
use crate::wan::{Wan, HEARTBEAT_INTERVAL};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, error, info, warn};
use wstun_proto::ForwardSpec;
use wstun_transport::Connector;

/// Fixed delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

enum SessionState {
    Disconnected,
    Connecting,
    Connected(Wan),
    Closed,
}

/// Requests a supervisor shutdown from anywhere.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Top-level tunnel client lifecycle.
pub struct TunnelClient {
    config: ClientConfig,
    specs: Vec<ForwardSpec>,
    connector: Arc<dyn Connector>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("config", &self.config)
            .field("specs", &self.specs)
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self, TunnelError> {
        if config.server.is_empty() {
            return Err(TunnelError::Config("server address is required".to_string()));
        }
        let specs = config.forward_specs()?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(Self {
            config,
            specs,
            connector,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until an explicit shutdown (Ok) or a fatal error (Err).
    pub async fn run(mut self) -> Result<(), TunnelError> {
        let (session_tx, session_rx) = watch::channel(None::<SessionHandle>);
        let manager = ForwardingManager::bind(&self.specs, session_rx).await?;
        manager.spawn();

        let mut state = SessionState::Connecting;
        loop {
            state = match state {
                SessionState::Disconnected => {
                    tokio::select! {
                        _ = time::sleep(RECONNECT_DELAY) => SessionState::Connecting,
                        _ = self.shutdown_rx.recv() => SessionState::Closed,
                    }
                }
                SessionState::Connecting => self.connect_once(&session_tx).await?,
                SessionState::Connected(wan) => {
                    let mut failure = wan.failure_watch();
                    tokio::select! {
                        _ = failure.changed() => {
                            let _ = session_tx.send(None);
                            warn!(
                                "tunnel connection lost; reconnecting in {:?}",
                                RECONNECT_DELAY
                            );
                            SessionState::Disconnected
                        }
                        _ = self.shutdown_rx.recv() => {
                            let _ = session_tx.send(None);
                            wan.shutdown().await;
                            SessionState::Closed
                        }
                    }
                }
                SessionState::Closed => {
                    info!("tunnel client stopped");
                    return Ok(());
                }
            };
        }
    }

    async fn connect_once(
        &self,
        session_tx: &watch::Sender<Option<SessionHandle>>,
    ) -> Result<SessionState, TunnelError> {
        debug!(server = %self.config.server, "connecting");
        match self
            .connector
            .connect(&self.config.server, &self.config.auth)
            .await
        {
            Ok((sink, source)) => {
                let routing = Arc::new(RoutingTable::new());
                let wan = Wan::spawn(sink, source, routing.clone(), HEARTBEAT_INTERVAL);
                let session = SessionHandle {
                    wan: wan.handle(),
                    routing,
                };
                forward::register_remote_forwards(&self.specs, &session).await;
                let _ = session_tx.send(Some(session));
                info!(server = %self.config.server, "tunnel established");
                Ok(SessionState::Connected(wan))
            }
            Err(err) if err.is_fatal() => {
                error!("authentication rejected: {}", err);
                Err(err.into())
            }
            Err(err) => {
                warn!("connect failed: {}; retrying in {:?}", err, RECONNECT_DELAY);
                Ok(SessionState::Disconnected)
            }
        }
    }
}
