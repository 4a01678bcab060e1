//! [`GatewayServer`] – TCP accept loop tying the gateway together.
//!
//! Binding is separate from running so callers (and tests) can bind port `0`
//! and learn the real address before any client connects.
//!
//! Per accepted socket:
//!
//! 1. `TCP_NODELAY` is set and the stream is split.
//! 2. The write half is wrapped in a [`ClientConnection`] and admitted
//!    through the [`TelemetryCache`], which sends the current state and
//!    registers it for broadcasts.
//! 3. The read half runs [`read_commands`] until the client disconnects or
//!    the registry drops the connection; either way the connection is then
//!    removed and both halves are released.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use armlink_hal::ArmHandle;
use armlink_types::ArmError;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcaster::{TelemetryBroadcaster, TelemetryCache};
use crate::demux::{CommandContext, LoopExit, read_commands};
use crate::registry::{ClientConnection, ConnectionRegistry};

/// Default TCP port clients connect to.
pub const DEFAULT_PORT: u16 = 5000;

/// Network and pacing parameters of one gateway instance.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Pause between broadcaster cycles.
    pub cycle_delay: Duration,
    /// Upper bound on one write to one client.
    pub write_timeout: Duration,
    /// Digital output appended to telemetry lines, if any.
    pub signal: Option<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            cycle_delay: Duration::ZERO,
            write_timeout: Duration::from_millis(1000),
            signal: None,
        }
    }
}

/// A bound, not yet running gateway.
///
/// # Example
///
/// ```rust,no_run
/// use armlink_gateway::{CommandContext, GatewayConfig, GatewayServer};
/// use armlink_hal::{ArmHandle, Procedures, SimArm};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), armlink_types::ArmError> {
///     let arm = ArmHandle::new(Box::new(SimArm::new()));
///     arm.startup("127.0.0.1", &Procedures::default(), true).await?;
///     let ctx = CommandContext::new(arm.clone(), Procedures::default());
///     let server = GatewayServer::bind(&GatewayConfig::default(), arm, ctx).await?;
///     server.run(CancellationToken::new()).await
/// }
/// ```
pub struct GatewayServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    cache: Arc<TelemetryCache>,
    broadcaster: TelemetryBroadcaster,
    ctx: CommandContext,
}

impl GatewayServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::Transport`] if the address cannot be bound.
    pub async fn bind(
        config: &GatewayConfig,
        arm: ArmHandle,
        ctx: CommandContext,
    ) -> Result<Self, ArmError> {
        let addr = format!("{}:{}", config.bind_addr, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ArmError::Transport(format!("bind error on {addr}: {e}")))?;

        let registry = Arc::new(ConnectionRegistry::new(config.write_timeout));
        let cache = Arc::new(TelemetryCache::new());
        let broadcaster = TelemetryBroadcaster::new(arm, Arc::clone(&registry), Arc::clone(&cache))
            .with_cycle_delay(config.cycle_delay)
            .with_signal(config.signal);

        Ok(Self {
            listener,
            registry,
            cache,
            broadcaster,
            ctx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ArmError> {
        self.listener
            .local_addr()
            .map_err(|e| ArmError::Transport(format!("listener has no local address: {e}")))
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run the broadcaster and the accept loop until `cancel` fires.
    ///
    /// Connection loops are not interrupted by cancellation; each ends when
    /// its client disconnects.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ArmError> {
        let Self {
            listener,
            registry,
            cache,
            broadcaster,
            ctx,
        } = self;

        let addr = listener
            .local_addr()
            .map_err(|e| ArmError::Transport(e.to_string()))?;
        info!(%addr, "gateway listening");

        let broadcast_task = tokio::spawn(broadcaster.run(cancel.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&registry);
                        let cache = Arc::clone(&cache);
                        let ctx = ctx.clone();
                        tokio::spawn(handle_connection(stream, peer, registry, cache, ctx));
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                },
            }
        }

        info!("accept loop stopped; waiting for the broadcaster");
        if let Err(e) = broadcast_task.await {
            warn!(error = %e, "broadcaster task ended abnormally");
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    cache: Arc<TelemetryCache>,
    ctx: CommandContext,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%peer, error = %e, "could not disable Nagle");
    }
    let (read_half, write_half) = stream.into_split();
    let conn = ClientConnection::new(peer.to_string(), Box::new(write_half));
    let id = conn.id();

    if !cache.admit(&registry, Arc::clone(&conn)).await {
        return;
    }

    match read_commands(read_half, id, ctx, conn.closed()).await {
        LoopExit::Closed => {}
        LoopExit::Dropped => info!(conn_id = %id, %peer, "read loop stopped for dropped client"),
        LoopExit::Transport(reason) => warn!(conn_id = %id, %peer, %reason, "connection read failed"),
    }
    registry.remove(id).await;
}
