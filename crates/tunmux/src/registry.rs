use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tunmux_proto::TunnelId;

pub(crate) type DataReceiver = mpsc::UnboundedReceiver<Bytes>;
type DataSender = mpsc::UnboundedSender<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Shell,
    PortForward,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKind::Shell => write!(f, "shell"),
            TunnelKind::PortForward => write!(f, "portfwd"),
        }
    }
}

/// Readable end of a tunnel.
///
/// The local resource itself is read by the tunnel's forwarding task; this is the handle used to
/// stop that task. Closing it wakes the forwarding task right away, interrupting any pending read.
pub struct TunnelReader {
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl TunnelReader {
    pub(crate) fn new() -> (Self, CloseSignal) {
        let (close_tx, close_rx) = oneshot::channel();
        let reader = Self {
            close_tx: Mutex::new(Some(close_tx)),
        };
        (reader, CloseSignal(close_rx))
    }

    /// Returns `true` only for the call that actually closed the reader.
    pub fn close(&self) -> bool {
        match self.close_tx.lock().take() {
            Some(close_tx) => {
                let _ = close_tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_tx.lock().is_none()
    }
}

/// Completes once the associated [`TunnelReader`] is closed or dropped.
pub struct CloseSignal(oneshot::Receiver<()>);

impl CloseSignal {
    /// Cancel safe. Must not be awaited again once it completed.
    pub async fn closed(&mut self) {
        let _ = (&mut self.0).await;
    }
}

/// Writable end of a tunnel.
///
/// Writes are queued in order to the task owning the local resource, and never block.
pub struct TunnelWriter {
    data_tx: Mutex<Option<DataSender>>,
}

impl TunnelWriter {
    pub(crate) fn new() -> (Self, DataReceiver) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let writer = Self {
            data_tx: Mutex::new(Some(data_tx)),
        };
        (writer, data_rx)
    }

    pub fn write(&self, data: Bytes) -> io::Result<()> {
        let guard = self.data_tx.lock();

        let Some(data_tx) = guard.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel writer is closed"));
        };

        data_tx
            .send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tunnel writer task is gone"))
    }

    /// Returns `true` only for the call that actually closed the writer.
    ///
    /// Data written before closing is still delivered to the local resource.
    pub fn close(&self) -> bool {
        self.data_tx.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.data_tx.lock().is_none()
    }
}

/// One multiplexed stream.
pub struct Tunnel {
    id: TunnelId,
    kind: TunnelKind,
    reader: TunnelReader,
    writer: TunnelWriter,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("reader_closed", &self.reader.is_closed())
            .field("writer_closed", &self.writer.is_closed())
            .finish()
    }
}

impl Tunnel {
    pub fn new(id: TunnelId, kind: TunnelKind, reader: TunnelReader, writer: TunnelWriter) -> Self {
        Self {
            id,
            kind,
            reader,
            writer,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    pub fn reader(&self) -> &TunnelReader {
        &self.reader
    }

    pub fn writer(&self) -> &TunnelWriter {
        &self.writer
    }

    /// Closes the reader, then the writer. Each end is closed at most once.
    pub fn close(&self) {
        let reader_closed = self.reader.close();
        let writer_closed = self.writer.close();
        trace!(tunnel.id = %self.id, reader_closed, writer_closed, "Tunnel ends closed");
    }
}

/// Concurrent mapping from tunnel ID to tunnel.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    tunnels: HashMap<TunnelId, Arc<Tunnel>>,
    /// Set once drained: the connection is going away and accepts no new tunnel.
    closed: bool,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tunnel.
    ///
    /// Registering an ID which is still live is refused; the live tunnel is kept.
    pub fn add(&self, tunnel: Arc<Tunnel>) -> anyhow::Result<()> {
        use std::collections::hash_map::Entry;

        let mut state = self.state.lock();

        if state.closed {
            anyhow::bail!("connection is closed");
        }

        match state.tunnels.entry(tunnel.id()) {
            Entry::Occupied(_) => anyhow::bail!("tunnel {} is already registered", tunnel.id()),
            Entry::Vacant(entry) => {
                entry.insert(tunnel);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: TunnelId) -> Option<Arc<Tunnel>> {
        self.state.lock().tunnels.get(&id).map(Arc::clone)
    }

    pub fn remove(&self, id: TunnelId) -> Option<Arc<Tunnel>> {
        self.state.lock().tunnels.remove(&id)
    }

    /// Removes `tunnel` only if this exact instance is the one registered under its ID.
    pub fn remove_exact(&self, tunnel: &Arc<Tunnel>) -> bool {
        let mut state = self.state.lock();
        let tunnels = &mut state.tunnels;

        match tunnels.get(&tunnel.id()) {
            Some(registered) if Arc::ptr_eq(registered, tunnel) => {
                tunnels.remove(&tunnel.id());
                true
            }
            _ => false,
        }
    }

    /// Removes every tunnel, returning them. Later registrations are refused.
    pub fn drain(&self) -> Vec<Arc<Tunnel>> {
        let mut state = self.state.lock();
        state.closed = true;
        state.tunnels.drain().map(|(_, tunnel)| tunnel).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tunnels.is_empty()
    }
}
