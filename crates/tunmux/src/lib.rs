//! Tunnel multiplexer.
//!
//! Many logical tunnels share one ordered, reliable byte stream. A tunnel is either an
//! interactive shell session or a TCP port-forward, opened on request of the peer. Inbound
//! envelopes are routed by the [`DispatchTable`], and everything produced locally is queued on
//! the connection's [`OutboundSink`].
//!
//! [`TunmuxSession`] runs a whole connection over an `AsyncRead` / `AsyncWrite` pair. Callers
//! with their own transport can drive a [`Connection`] directly instead.

#[macro_use]
extern crate tracing;

mod codec;
mod config;
mod connection;
mod dispatch;
mod portfwd;
mod pty;
mod registry;
mod shell;
mod sink;

pub use self::codec::EnvelopeCodec;
pub use self::config::{FilteringRule, ShellConfig, TunmuxConfig};
pub use self::connection::Connection;
pub use self::dispatch::{DispatchTable, Handler, handle_tunnel_close, handle_tunnel_data};
pub use self::portfwd::handle_portfwd_request;
pub use self::registry::{CloseSignal, Tunnel, TunnelKind, TunnelReader, TunnelRegistry, TunnelWriter};
pub use self::shell::{handle_shell_request, resolve_shell_path};
pub use self::sink::{OutboundReceiver, OutboundSink, TunnelSink};
pub use tunmux_proto;

use std::io;

use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{Instrument as _, Span};

use self::registry::DataReceiver;

const SENDER_BUFFER_SIZE: usize = 16 * 1024; // 16 kiB
const SENDER_FLUSH_DELAY: core::time::Duration = core::time::Duration::from_millis(10);

/// Serves the tunnel protocol over a byte stream until the peer goes away.
pub struct TunmuxSession {
    cfg: TunmuxConfig,
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
}

impl TunmuxSession {
    #[must_use]
    pub fn new(reader: Box<dyn AsyncRead + Unpin + Send>, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            cfg: TunmuxConfig::default(),
            reader,
            writer,
        }
    }

    #[must_use]
    pub fn with_config(mut self, cfg: TunmuxConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let span = Span::current();
        run_session_impl(self, span.clone()).instrument(span).await
    }
}

async fn run_session_impl(session: TunmuxSession, span: Span) -> anyhow::Result<()> {
    let TunmuxSession { cfg, reader, writer } = session;

    let (conn, outbound_rx) = Connection::new(cfg);
    let conn = conn.with_span(span.clone());

    let sender_task_handle = SenderTask { writer, outbound_rx }.spawn(span);

    let receive_result = receive_loop(FramedRead::new(reader, EnvelopeCodec), &conn).await;

    let closed = conn.close_all_tunnels();
    debug!(closed, "Closed remaining tunnels");

    // The sender ends once every outbound handle is gone, forwarding tasks included.
    drop(conn);

    match sender_task_handle.join().await.context("sender task join failed")? {
        Ok(()) => {}
        Err(error) if receive_result.is_ok() => return Err(error.context("sender task failed")),
        Err(error) => debug!(error = format!("{error:#}"), "Sender task failed"),
    }

    receive_result
}

#[instrument("receiver", skip_all)]
async fn receive_loop<T>(mut stream: FramedRead<T, EnvelopeCodec>, conn: &Connection) -> anyhow::Result<()>
where
    T: AsyncRead + Unpin,
{
    use futures_util::StreamExt as _;

    // Safety net against a peer sending garbage.
    const MAX_CONSECUTIVE_MALFORMED_ENVELOPES: u8 = 5;
    let mut nb_consecutive_malformed_envelopes = 0;

    let dispatch = DispatchTable::new();

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                if is_really_an_error(&error) {
                    return Err(anyhow::Error::new(error).context("tunmux pipe error"));
                }

                info!(reason = %error, "Tunmux pipe closed abruptly");
                return Ok(());
            }
        };

        let envelope = match frame {
            Ok(envelope) => {
                nb_consecutive_malformed_envelopes = 0;
                envelope
            }
            Err(error) => {
                debug!(%error, "Malformed envelope");

                nb_consecutive_malformed_envelopes += 1;
                if nb_consecutive_malformed_envelopes > MAX_CONSECUTIVE_MALFORMED_ENVELOPES {
                    anyhow::bail!("forced session shutdown because of too many consecutive malformed envelopes");
                }

                continue;
            }
        };

        trace!(?envelope, "Received envelope");

        let ty = envelope.ty;

        if !dispatch.dispatch(envelope, conn) {
            warn!(ty = format!("{ty:#x}"), "Unhandled message type");
        }
    }

    info!("Tunmux pipe was closed by peer");

    Ok(())
}

// === implementation details === //

struct SenderTask<T: AsyncWrite + Unpin + Send + 'static> {
    writer: T,
    outbound_rx: OutboundReceiver,
}

impl<T: AsyncWrite + Unpin + Send + 'static> SenderTask<T> {
    fn spawn(self, span: Span) -> ChildTask<anyhow::Result<()>> {
        ChildTask::spawn(self.run().instrument(span))
    }

    #[instrument("sender", skip_all)]
    async fn run(self) -> anyhow::Result<()> {
        let Self {
            writer,
            mut outbound_rx,
        } = self;

        let mut writer = tokio::io::BufWriter::with_capacity(SENDER_BUFFER_SIZE, writer);
        let mut buf = bytes::BytesMut::new();
        let mut needs_flush = false;

        loop {
            tokio::select! {
                envelope = outbound_rx.recv() => {
                    let Some(envelope) = envelope else {
                        break;
                    };

                    trace!(?envelope, "Send envelope");

                    buf.clear();
                    envelope.encode(&mut buf).context("couldn't encode envelope")?;

                    writer.write_all(&buf).await?;
                    needs_flush = true;
                }
                _ = tokio::time::sleep(SENDER_FLUSH_DELAY), if needs_flush => {
                    writer.flush().await?;
                    needs_flush = false;
                }
            }
        }

        info!("Closing tunmux sender task...");

        writer.flush().await?;

        Ok(())
    }
}

/// Owns the write half of a tunnel's local resource.
///
/// Data is written in order until the tunnel writer is closed; the resource is then shut down.
pub(crate) struct DataWriterTask<W> {
    writer: W,
    data_rx: DataReceiver,
}

impl<W: AsyncWrite + Unpin + Send + 'static> DataWriterTask<W> {
    pub(crate) fn new(writer: W, data_rx: DataReceiver) -> Self {
        Self { writer, data_rx }
    }

    pub(crate) fn spawn(self, span: Span) -> ChildTask<()> {
        let Self {
            mut writer,
            mut data_rx,
        } = self;

        ChildTask::spawn(
            async move {
                while let Some(data) = data_rx.recv().await {
                    if let Err(error) = writer.write_all(&data).await {
                        if is_really_an_error(&error) {
                            warn!(%error, "Writer task failed");
                        } else {
                            debug!(%error, "Writer task ended");
                        }

                        return;
                    }
                }

                if let Err(error) = writer.shutdown().await {
                    debug!(%error, "Couldn't shut down the writer");
                }
            }
            .instrument(span),
        )
    }
}

/// Aborts the running task when dropped.
/// Also see https://github.com/tokio-rs/tokio/issues/1830 for some background.
#[must_use]
pub(crate) struct ChildTask<T>(JoinHandle<T>);

impl<T: Send + 'static> ChildTask<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        ChildTask(tokio::spawn(future))
    }
}

impl<T> ChildTask<T> {
    pub(crate) async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    pub(crate) fn abort(&self) {
        self.0.abort()
    }

    pub(crate) fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Walks source chain and check for status codes like ECONNRESET or ECONNABORTED that we don’t consider to be actual errors
pub(crate) fn is_really_an_error(original_error: &(dyn std::error::Error + 'static)) -> bool {
    let mut dyn_error: Option<&dyn std::error::Error> = Some(original_error);

    while let Some(source_error) = dyn_error.take() {
        if let Some(io_error) = source_error.downcast_ref::<io::Error>() {
            match io_error.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => {
                    return false;
                }
                _ => {}
            }

            // `io::Error::source` skips the wrapped error itself.
            if let Some(inner) = io_error.get_ref() {
                dyn_error = Some(inner);
                continue;
            }
        }

        dyn_error = source_error.source();
    }

    true
}
