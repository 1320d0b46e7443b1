use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::TcpStream;
use tracing::{Instrument as _, Span};
use tunmux_proto::{Envelope, MessageType, Payload as _, PortFwdReq, TunnelId, TunnelOpenResponse};

use crate::connection::{Connection, LocalCloseGuard};
use crate::registry::{Tunnel, TunnelKind, TunnelReader, TunnelWriter};
use crate::sink::TunnelSink;
use crate::{ChildTask, DataWriterTask, is_really_an_error};

/// Opens a TCP port-forward tunnel.
///
/// Returns right away: the destination is dialed by a spawned task, which answers the request.
pub fn handle_portfwd_request(envelope: Envelope, conn: &Connection) {
    let correlation_id = envelope.id;

    let req = match PortFwdReq::decode(envelope.data) {
        Ok(req) => req,
        Err(error) => {
            debug!(%error, "Malformed port forward request");
            return;
        }
    };

    let id = TunnelId::from(req.tunnel_id);
    let span = conn.tunnel_span(id, TunnelKind::PortForward);
    let _enter = span.enter();

    if let Err(error) = conn.config().filtering.validate_destination(&req.host, req.port) {
        warn!(error = format!("{error:#}"), "Port forward rejected");
        respond(conn, correlation_id, TunnelOpenResponse::failure(format!("{error:#}")));
        return;
    }

    PortForwardTask {
        conn: conn.clone(),
        id,
        correlation_id,
        host: req.host,
        port: req.port,
    }
    .spawn(span.clone())
    .detach();
}

fn respond(conn: &Connection, correlation_id: Option<u64>, response: TunnelOpenResponse) {
    if let Err(error) = conn
        .outbound()
        .send_response(MessageType::PortFwdResp, correlation_id, &response)
    {
        debug!(%error, "Couldn't send port forward response");
    }
}

struct PortForwardTask {
    conn: Connection,
    id: TunnelId,
    correlation_id: Option<u64>,
    host: String,
    port: u16,
}

impl PortForwardTask {
    fn spawn(self, span: Span) -> ChildTask<()> {
        ChildTask::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        let Self {
            conn,
            id,
            correlation_id,
            host,
            port,
        } = self;

        let stream = match connect(&host, port, conn.config().connect_timeout).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(error = format!("{error:#}"), "Port forward failed");
                respond(&conn, correlation_id, TunnelOpenResponse::failure(format!("{error:#}")));
                return;
            }
        };

        let (reader, mut close_signal) = TunnelReader::new();
        let (writer, data_rx) = TunnelWriter::new();
        let tunnel = Arc::new(Tunnel::new(id, TunnelKind::PortForward, reader, writer));

        if let Err(error) = conn.add_tunnel(Arc::clone(&tunnel)) {
            warn!(error = format!("{error:#}"), "Port forward rejected");
            respond(&conn, correlation_id, TunnelOpenResponse::failure(format!("{error:#}")));
            return;
        }

        let peer_addr = stream.peer_addr().ok();
        let (mut read_half, write_half) = stream.into_split();

        DataWriterTask::new(write_half, data_rx).spawn(Span::current()).detach();

        respond(&conn, correlation_id, TunnelOpenResponse::success());

        info!(%host, port, ?peer_addr, "Port forward started");

        let mut guard = LocalCloseGuard::new(conn.clone(), tunnel);
        let mut sink = TunnelSink::new(id, conn.outbound().clone());

        tokio::select! {
            () = close_signal.closed() => {
                debug!("Port forward tunnel closed");
            }
            res = tokio::io::copy(&mut read_half, &mut sink) => match res {
                Ok(copied) => {
                    debug!(copied, "Destination closed the connection");
                    guard.set_reason("EOF");
                }
                Err(error) => {
                    if is_really_an_error(&error) {
                        warn!(%error, "Couldn't read from destination");
                    } else {
                        debug!(%error, "Destination connection ended abruptly");
                    }
                    guard.set_reason(error.to_string());
                }
            },
        }

        drop(read_half);
    }
}

async fn connect(host: &str, port: u16, timeout: Duration) -> anyhow::Result<TcpStream> {
    tokio::time::timeout(timeout, dial(host, port))
        .await
        .with_context(|| format!("timed out connecting to {host}:{port}"))?
}

async fn dial(host: &str, port: u16) -> anyhow::Result<TcpStream> {
    let socket_addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("couldn't resolve {host}:{port}"))?;

    let mut last_error = None;

    for socket_addr in socket_addrs {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                debug!(?error, ?socket_addr, "TcpStream::connect failed");
                last_error = Some(error);
            }
        }
    }

    match last_error {
        Some(error) => Err(anyhow::Error::new(error).context(format!("couldn't connect to {host}:{port}"))),
        None => anyhow::bail!("no addresses resolved for {host}:{port}"),
    }
}
