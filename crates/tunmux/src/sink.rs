use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tunmux_proto::{Envelope, MessageType, Payload, TunnelClose, TunnelData, TunnelId, TunnelOpenResponse};

pub type OutboundReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Connection-wide enqueue point for outgoing envelopes.
///
/// Can be cloned and used from any number of tasks. Each envelope is enqueued atomically, and
/// envelopes pushed from a single task are sent in the order they were pushed.
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl OutboundSink {
    pub fn new() -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, ty: MessageType, payload: Bytes, correlation_id: Option<u64>) -> io::Result<()> {
        self.send_envelope(Envelope::new(ty, payload).with_correlation_id(correlation_id))
    }

    pub fn send_envelope(&self, envelope: Envelope) -> io::Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "outbound channel is closed"))
    }

    /// Frames `data` as a tunnel-data message. Empty payloads are not sent.
    pub fn send_data(&self, id: TunnelId, data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.send_envelope(Envelope::from_payload(
            MessageType::TunnelData,
            &TunnelData::new(id, data),
        ))
    }

    pub fn send_close(&self, id: TunnelId, reason: &str) -> io::Result<()> {
        self.send_envelope(Envelope::from_payload(
            MessageType::TunnelClose,
            &TunnelClose::new(id, reason),
        ))
    }

    pub fn send_response(
        &self,
        ty: MessageType,
        correlation_id: Option<u64>,
        response: &TunnelOpenResponse,
    ) -> io::Result<()> {
        self.send(ty, response.to_bytes(), correlation_id)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Writer adapter framing everything written to it as tunnel-data messages for one tunnel.
///
/// A zero-length write is reported as an end-of-stream error and produces no frame.
#[derive(Debug, Clone)]
pub struct TunnelSink {
    id: TunnelId,
    outbound: OutboundSink,
}

impl TunnelSink {
    pub fn new(id: TunnelId, outbound: OutboundSink) -> Self {
        Self { id, outbound }
    }
}

impl AsyncWrite for TunnelSink {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "zero-length write on tunnel sink",
            )));
        }

        let result = self
            .outbound
            .send_data(self.id, Bytes::copy_from_slice(buf))
            .map(|()| buf.len());

        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
