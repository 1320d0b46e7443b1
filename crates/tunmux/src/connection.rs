use std::sync::Arc;

use tracing::Span;
use tunmux_proto::TunnelId;

use crate::config::TunmuxConfig;
use crate::registry::{Tunnel, TunnelKind, TunnelRegistry};
use crate::sink::{OutboundReceiver, OutboundSink};

/// State shared by every handler and forwarding task of one physical connection.
///
/// Cloning is cheap: clones refer to the same registry and outbound channel.
#[derive(Debug, Clone)]
pub struct Connection {
    registry: Arc<TunnelRegistry>,
    outbound: OutboundSink,
    cfg: Arc<TunmuxConfig>,
    span: Span,
}

impl Connection {
    /// Creates a connection with an empty registry.
    ///
    /// Everything the connection emits is received on the returned [`OutboundReceiver`], for the
    /// caller to serialize onto its transport.
    pub fn new(cfg: TunmuxConfig) -> (Self, OutboundReceiver) {
        let (outbound, outbound_rx) = OutboundSink::new();

        let conn = Self {
            registry: Arc::new(TunnelRegistry::new()),
            outbound,
            cfg: Arc::new(cfg),
            span: Span::current(),
        };

        (conn, outbound_rx)
    }

    /// Sets the span tunnel spans are attached to.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &TunmuxConfig {
        &self.cfg
    }

    pub fn outbound(&self) -> &OutboundSink {
        &self.outbound
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn add_tunnel(&self, tunnel: Arc<Tunnel>) -> anyhow::Result<()> {
        self.registry.add(tunnel)
    }

    pub fn remove_tunnel(&self, id: TunnelId) -> Option<Arc<Tunnel>> {
        self.registry.remove(id)
    }

    pub fn tunnel(&self, id: TunnelId) -> Option<Arc<Tunnel>> {
        self.registry.get(id)
    }

    /// Closes every registered tunnel without notifying the peer.
    pub fn close_all_tunnels(&self) -> usize {
        let tunnels = self.registry.drain();

        for tunnel in &tunnels {
            tunnel.close();
        }

        tunnels.len()
    }

    /// Unregisters a tunnel that never became usable, closing both ends without notifying the peer.
    pub(crate) fn discard_tunnel(&self, tunnel: &Arc<Tunnel>) -> bool {
        let removed = self.registry.remove_exact(tunnel);
        tunnel.close();
        removed
    }

    pub(crate) fn tunnel_span(&self, id: TunnelId, kind: TunnelKind) -> Span {
        info_span!(parent: &self.span, "tunnel", tunnel.id = %id, %kind)
    }

    /// Tears down a tunnel whose local resource ended.
    ///
    /// Does nothing if the tunnel was already removed, e.g. by a close request from the peer.
    /// Otherwise both ends are closed and the peer is sent a close message carrying `reason`.
    pub(crate) fn close_tunnel_locally(&self, tunnel: &Arc<Tunnel>, reason: &str) -> bool {
        if !self.registry.remove_exact(tunnel) {
            return false;
        }

        tunnel.close();

        if let Err(error) = self.outbound.send_close(tunnel.id(), reason) {
            debug!(%error, "Couldn't send tunnel close message");
        }

        info!(reason, "Tunnel closed");

        true
    }
}

/// Runs the local-side cleanup of a tunnel when dropped, however its forwarding task ends.
pub(crate) struct LocalCloseGuard {
    conn: Connection,
    tunnel: Arc<Tunnel>,
    reason: Option<String>,
}

impl LocalCloseGuard {
    pub(crate) fn new(conn: Connection, tunnel: Arc<Tunnel>) -> Self {
        Self {
            conn,
            tunnel,
            reason: None,
        }
    }

    pub(crate) fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }
}

impl Drop for LocalCloseGuard {
    fn drop(&mut self) {
        let reason = self.reason.take().unwrap_or_else(|| "forwarding task aborted".to_owned());
        self.conn.close_tunnel_locally(&self.tunnel, &reason);
    }
}
