//! Forwarding manager: configured forward specs become listeners and
//! virtual streams
//!
//! Local and dynamic listeners bind once and persist across reconnects;
//! every accepted connection picks up the current session from a watch
//! channel (and is refused while no session is live). Remote forwards are
//! re-registered with the peer on every connection establishment.

use crate::error::TunnelError;
use crate::routing::{RoutingTable, StreamHandle};
use crate::stream::{StreamEvent, VirtualStream};
use crate::wan::WanHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use wstun_proto::{ConnectPayload, ForwardSpec, Frame, TargetAddr};

/// The live connection a forward hands its streams to. Replaced wholesale
/// on every reconnect.
#[derive(Clone)]
pub struct SessionHandle {
    pub wan: WanHandle,
    pub routing: Arc<RoutingTable>,
}

enum ListenerKind {
    /// Every connection tunnels to the same configured target
    Fixed(TargetAddr),
    /// The target is read per-connection via a SOCKS5 exchange
    Dynamic,
}

/// Owns the local listeners for the configured local and dynamic forwards.
pub struct ForwardingManager {
    listeners: Vec<(TcpListener, ListenerKind)>,
    session_rx: watch::Receiver<Option<SessionHandle>>,
}

impl ForwardingManager {
    /// Bind a listener for every local and dynamic spec. Remote specs have
    /// no local listener; they are handled by [`register_remote_forwards`].
    pub async fn bind(
        specs: &[ForwardSpec],
        session_rx: watch::Receiver<Option<SessionHandle>>,
    ) -> Result<Self, TunnelError> {
        let mut listeners = Vec::new();
        for spec in specs {
            match spec {
                ForwardSpec::Local { listen, target } => {
                    let listener = bind_listener(listen).await?;
                    info!(listen = %local_addr(&listener), %target, "local forward listening");
                    listeners.push((listener, ListenerKind::Fixed(target.clone())));
                }
                ForwardSpec::Dynamic { listen } => {
                    let listener = bind_listener(listen).await?;
                    info!(listen = %local_addr(&listener), "dynamic (socks5) forward listening");
                    listeners.push((listener, ListenerKind::Dynamic));
                }
                ForwardSpec::Remote { .. } => {}
            }
        }
        Ok(Self {
            listeners,
            session_rx,
        })
    }

    /// Addresses the listeners actually bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(listener, _)| listener.local_addr().ok())
            .collect()
    }

    /// Start one accept loop per listener. The loops run for the process
    /// lifetime, surviving reconnects.
    pub fn spawn(self) {
        for (listener, kind) in self.listeners {
            tokio::spawn(accept_loop(listener, kind, self.session_rx.clone()));
        }
    }
}

async fn bind_listener(listen: &str) -> Result<TcpListener, TunnelError> {
    let addr = normalize_listen_addr(listen);
    TcpListener::bind(&addr)
        .await
        .map_err(|err| TunnelError::Config(format!("failed to bind {}: {}", addr, err)))
}

fn local_addr(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

// A bare ":port" spec means all interfaces.
fn normalize_listen_addr(listen: &str) -> String {
    match listen.strip_prefix(':') {
        Some(port) if !port.contains(':') => format!("0.0.0.0:{}", port),
        _ => listen.to_string(),
    }
}

async fn accept_loop(
    listener: TcpListener,
    kind: ListenerKind,
    session_rx: watch::Receiver<Option<SessionHandle>>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let session = session_rx.borrow().clone();
                let Some(session) = session else {
                    warn!(%peer, "no live tunnel connection; dropping local connection");
                    continue;
                };
                match &kind {
                    ListenerKind::Fixed(target) => {
                        let target = target.clone();
                        tokio::spawn(handle_local_conn(socket, target, session));
                    }
                    ListenerKind::Dynamic => {
                        tokio::spawn(handle_dynamic_conn(socket, session));
                    }
                }
            }
            Err(err) => {
                warn!("accept failed: {}", err);
            }
        }
    }
}

async fn handle_local_conn(socket: TcpStream, target: TargetAddr, session: SessionHandle) {
    let mut stream = match VirtualStream::open(&session.routing, &session.wan, target.clone()).await
    {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%target, "failed to open stream: {}", err);
            return;
        }
    };
    if !stream.establish().await {
        debug!(%target, "peer refused connection");
        return;
    }
    stream.bridge(socket).await;
}

async fn handle_dynamic_conn(mut socket: TcpStream, session: SessionHandle) {
    let target = match socks5_read_target(&mut socket).await {
        Ok(target) => target,
        Err(err) => {
            debug!("socks5 handshake failed: {}", err);
            return;
        }
    };
    debug!(%target, "dynamic forward request");

    let mut stream = match VirtualStream::open(&session.routing, &session.wan, target.clone()).await
    {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%target, "failed to open stream: {}", err);
            let _ = socks5_reply(&mut socket, REP_FAILURE).await;
            return;
        }
    };

    // The success reply waits for the peer's verdict so a failed dial on
    // the far side surfaces to the SOCKS client as an error reply.
    if stream.establish().await {
        if socks5_reply(&mut socket, REP_SUCCESS).await.is_err() {
            stream.close().await;
            return;
        }
        stream.bridge(socket).await;
    } else {
        debug!(%target, "peer refused dynamic connection");
        let _ = socks5_reply(&mut socket, REP_REFUSED).await;
    }
}

/// Re-register every remote forward with the peer. Called once per
/// connection establishment, including every reconnect.
pub async fn register_remote_forwards(specs: &[ForwardSpec], session: &SessionHandle) {
    for spec in specs {
        if let ForwardSpec::Remote { listen, target } = spec {
            if let Err(err) = register_remote(session, listen, target).await {
                warn!(%listen, %target, "remote forward registration failed: {}", err);
            }
        }
    }
}

async fn register_remote(
    session: &SessionHandle,
    listen: &str,
    target: &TargetAddr,
) -> Result<(), TunnelError> {
    let channel_id = session.routing.allocate();
    let (handle, mut events) = StreamHandle::channel();
    if !session.routing.register(channel_id, handle).await {
        return Err(TunnelError::Protocol(format!(
            "channel {} already in use",
            channel_id
        )));
    }

    let payload = ConnectPayload::Register {
        listen: listen.to_string(),
        target: target.clone(),
    }
    .encode()?;
    if let Err(err) = session
        .wan
        .send(Frame::connect(channel_id, payload))
        .await
    {
        session.routing.remove(channel_id).await;
        return Err(err);
    }

    // Watch the peer's verdict; the entry dies with the connection.
    let routing = session.routing.clone();
    let listen = listen.to_string();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Some(StreamEvent::Connected) => {
                    info!(%listen, channel_id, "remote forward registered")
                }
                Some(StreamEvent::Close) => {
                    warn!(%listen, channel_id, "remote forward rejected by peer");
                    routing.remove(channel_id).await;
                    break;
                }
                Some(StreamEvent::Data(_)) => {
                    debug!(%listen, channel_id, "unexpected data on registration channel")
                }
                None => break,
            }
        }
    });
    Ok(())
}

// Minimal SOCKS5 (RFC 1928): no-auth greeting, CONNECT request,
// IPv4/domain/IPv6 address forms.

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_FAILURE: u8 = 0x01;
const REP_REFUSED: u8 = 0x05;
const REP_CMD_UNSUPPORTED: u8 = 0x07;
const REP_ATYP_UNSUPPORTED: u8 = 0x08;

/// Run the SOCKS5 exchange up to (not including) the final reply and
/// return the requested destination.
async fn socks5_read_target<S>(socket: &mut S) -> std::io::Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    socket.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(invalid(format!("unsupported socks version {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    socket.read_exact(&mut methods).await?;
    socket.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(invalid(format!("bad request version {}", request[0])));
    }
    if request[1] != CMD_CONNECT {
        socks5_reply(socket, REP_CMD_UNSUPPORTED).await?;
        return Err(invalid(format!("unsupported command {}", request[1])));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            socket.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        other => {
            socks5_reply(socket, REP_ATYP_UNSUPPORTED).await?;
            return Err(invalid(format!("unsupported address type {}", other)));
        }
    };

    let mut port = [0u8; 2];
    socket.read_exact(&mut port).await?;
    Ok(TargetAddr::new(host, u16::from_be_bytes(port)))
}

async fn socks5_reply<S>(socket: &mut S, rep: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // VER, REP, RSV, ATYP=IPv4, BND.ADDR=0.0.0.0, BND.PORT=0
    socket
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

fn invalid(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}
