use std::collections::HashMap;

use tunmux_proto::{Envelope, MessageType, Payload as _, TunnelClose, TunnelData, TunnelId};

use crate::connection::Connection;

/// Handles one inbound envelope.
///
/// Handlers run on the receive loop: they must return without waiting on I/O.
pub type Handler = fn(Envelope, &Connection);

/// Routes inbound envelopes to their handler by message type.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    handlers: HashMap<MessageType, Handler>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        let mut handlers: HashMap<MessageType, Handler> = HashMap::with_capacity(4);
        handlers.insert(MessageType::ShellReq, crate::shell::handle_shell_request);
        handlers.insert(MessageType::PortFwdReq, crate::portfwd::handle_portfwd_request);
        handlers.insert(MessageType::TunnelData, handle_tunnel_data);
        handlers.insert(MessageType::TunnelClose, handle_tunnel_close);
        Self { handlers }
    }

    pub fn get(&self, code: u32) -> Option<Handler> {
        let ty = MessageType::try_from(code).ok()?;
        self.handlers.get(&ty).copied()
    }

    /// Calls the handler for `envelope`.
    ///
    /// Returns `false` when no handler is registered for its message type.
    pub fn dispatch(&self, envelope: Envelope, conn: &Connection) -> bool {
        match self.get(envelope.ty) {
            Some(handler) => {
                handler(envelope, conn);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// The peer closed a tunnel: both local ends are closed, nothing is sent back.
pub fn handle_tunnel_close(envelope: Envelope, conn: &Connection) {
    let msg = match TunnelClose::decode(envelope.data) {
        Ok(msg) => msg,
        Err(error) => {
            debug!(%error, "Malformed tunnel close message");
            return;
        }
    };

    let id = TunnelId::from(msg.tunnel_id);

    let Some(tunnel) = conn.remove_tunnel(id) else {
        trace!(tunnel.id = %id, "Close for unknown tunnel");
        return;
    };

    tunnel.close();

    info!(tunnel.id = %id, kind = %tunnel.kind(), reason = %msg.err, "Tunnel closed by peer");
}

/// Data from the peer is queued to the tunnel's local resource.
pub fn handle_tunnel_data(envelope: Envelope, conn: &Connection) {
    let msg = match TunnelData::decode(envelope.data) {
        Ok(msg) => msg,
        Err(error) => {
            debug!(%error, "Malformed tunnel data message");
            return;
        }
    };

    let id = TunnelId::from(msg.tunnel_id);

    let Some(tunnel) = conn.tunnel(id) else {
        trace!(tunnel.id = %id, len = msg.data.len(), "Data for unknown tunnel dropped");
        return;
    };

    trace!(tunnel.id = %id, len = msg.data.len(), "Inbound data");

    if let Err(error) = tunnel.writer().write(msg.data) {
        debug!(tunnel.id = %id, %error, "Couldn't queue data for the tunnel");
    }
}
