use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{Instrument as _, Span};
use tunmux_proto::{Envelope, MessageType, Payload as _, ShellReq, TunnelId, TunnelOpenResponse};

use crate::config::ShellConfig;
use crate::connection::{Connection, LocalCloseGuard};
use crate::pty::{PtyChild, PtyInput, PtyOutput, PtyShell};
use crate::registry::{CloseSignal, DataReceiver, Tunnel, TunnelKind, TunnelReader, TunnelWriter};
use crate::{ChildTask, DataWriterTask};

#[cfg(windows)]
const SHELL_ENV_VAR: &str = "COMSPEC";
#[cfg(not(windows))]
const SHELL_ENV_VAR: &str = "SHELL";

#[cfg(windows)]
const FALLBACK_SHELLS: &[&str] = &["cmd.exe"];
#[cfg(not(windows))]
const FALLBACK_SHELLS: &[&str] = &["/bin/bash", "/bin/sh"];

/// Picks the shell executable for a request.
///
/// An override is only honored if it exists on disk. Otherwise the configured default is used,
/// then the user's shell from the environment, then the platform fallbacks.
pub fn resolve_shell_path(path_override: Option<&str>, cfg: &ShellConfig) -> PathBuf {
    if let Some(path) = path_override {
        let path = Path::new(path);

        if path.exists() {
            return path.to_owned();
        }

        debug!(path = %path.display(), "Requested shell does not exist, using the default one");
    }

    if let Some(path) = &cfg.default_path {
        return path.clone();
    }

    if let Some(path) = std::env::var_os(SHELL_ENV_VAR).filter(|path| !path.is_empty()) {
        return PathBuf::from(path);
    }

    FALLBACK_SHELLS
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .unwrap_or(Path::new(FALLBACK_SHELLS[0]))
        .to_owned()
}

/// Opens a shell tunnel.
///
/// The shell is started right away; its output is forwarded by a spawned task.
pub fn handle_shell_request(envelope: Envelope, conn: &Connection) {
    let correlation_id = envelope.id;

    let req = match ShellReq::decode(envelope.data) {
        Ok(req) => req,
        Err(error) => {
            debug!(%error, "Malformed shell request");
            return;
        }
    };

    let id = TunnelId::from(req.tunnel_id);
    let span = conn.tunnel_span(id, TunnelKind::Shell);
    let _enter = span.enter();

    let cfg = conn.config();
    let path = resolve_shell_path(req.path_override(), &cfg.shell);
    // An empty buffer would read as EOF right away.
    let read_buffer_size = cfg.read_buffer_size.max(1);

    let shell = match ShellProcess::spawn(&path, req.enable_pty, &cfg.shell, read_buffer_size) {
        Ok(shell) => shell,
        Err(error) => {
            warn!(error = format!("{error:#}"), path = %path.display(), "Couldn't start shell");
            respond(conn, correlation_id, TunnelOpenResponse::failure(format!("{error:#}")));
            return;
        }
    };

    let (reader, close_signal) = TunnelReader::new();
    let (writer, data_rx) = TunnelWriter::new();
    let tunnel = Arc::new(Tunnel::new(id, TunnelKind::Shell, reader, writer));

    if let Err(error) = conn.add_tunnel(Arc::clone(&tunnel)) {
        warn!(error = format!("{error:#}"), "Shell request rejected");
        respond(conn, correlation_id, TunnelOpenResponse::failure(format!("{error:#}")));
        // Dropping the process kills it.
        return;
    }

    let ShellProcess { output, input, child } = shell;

    if let Err(error) = input.spawn_writer(data_rx, span.clone()) {
        warn!(error = format!("{error:#}"), "Couldn't start shell input forwarding");
        conn.discard_tunnel(&tunnel);
        respond(conn, correlation_id, TunnelOpenResponse::failure(format!("{error:#}")));
        return;
    }

    respond(conn, correlation_id, TunnelOpenResponse::success());

    info!(path = %path.display(), pty = req.enable_pty, "Shell started");

    ShellForwardTask {
        conn: conn.clone(),
        tunnel,
        close_signal,
        output,
        child,
        read_buffer_size,
        exit_timeout: cfg.shell.exit_timeout,
    }
    .spawn(span.clone())
    .detach();
}

fn respond(conn: &Connection, correlation_id: Option<u64>, response: TunnelOpenResponse) {
    if let Err(error) = conn
        .outbound()
        .send_response(MessageType::ShellResp, correlation_id, &response)
    {
        debug!(%error, "Couldn't send shell response");
    }
}

// === shell process === //

struct ShellProcess {
    output: ShellOutput,
    input: ShellInput,
    child: ShellChild,
}

impl ShellProcess {
    fn spawn(path: &Path, enable_pty: bool, cfg: &ShellConfig, read_buffer_size: usize) -> anyhow::Result<Self> {
        if enable_pty {
            let PtyShell { output, input, child } = PtyShell::spawn(path, cfg, read_buffer_size)?;

            return Ok(Self {
                output: ShellOutput::Pty(output),
                input: ShellInput::Pty(input),
                child: ShellChild::Pty(child),
            });
        }

        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", path.display()))?;

        let stdin = child.stdin.take().context("shell stdin is missing")?;
        let stdout = child.stdout.take().context("shell stdout is missing")?;
        let stderr = child.stderr.take().context("shell stderr is missing")?;

        Ok(Self {
            output: ShellOutput::Pipe {
                stdout,
                stderr: Some(stderr),
                stderr_buf: vec![0; read_buffer_size],
            },
            input: ShellInput::Pipe(stdin),
            child: ShellChild::Pipe(child),
        })
    }
}

enum ShellInput {
    Pipe(ChildStdin),
    Pty(PtyInput),
}

impl ShellInput {
    fn spawn_writer(self, data_rx: DataReceiver, span: Span) -> anyhow::Result<()> {
        match self {
            ShellInput::Pipe(stdin) => {
                DataWriterTask::new(stdin, data_rx).spawn(span).detach();
                Ok(())
            }
            ShellInput::Pty(input) => input.spawn_writer(data_rx),
        }
    }
}

enum ShellOutput {
    /// stderr is merged into the tunnel until it ends; stdout ending ends the tunnel.
    Pipe {
        stdout: ChildStdout,
        stderr: Option<ChildStderr>,
        stderr_buf: Vec<u8>,
    },
    Pty(PtyOutput),
}

enum PipeEvent {
    Stdout(io::Result<usize>),
    Stderr(io::Result<usize>),
}

impl ShellOutput {
    /// Returns `None` once the output ended.
    ///
    /// Cancel safe.
    async fn next_chunk(&mut self, buf: &mut [u8]) -> io::Result<Option<Bytes>> {
        let (stdout, stderr, stderr_buf) = match self {
            ShellOutput::Pty(output) => return output.next_chunk().await,
            ShellOutput::Pipe {
                stdout,
                stderr,
                stderr_buf,
            } => (stdout, stderr, stderr_buf),
        };

        loop {
            let event = tokio::select! {
                res = stdout.read(buf) => PipeEvent::Stdout(res),
                res = read_optional(stderr.as_mut(), &mut stderr_buf[..]) => PipeEvent::Stderr(res),
            };

            match event {
                PipeEvent::Stdout(res) => {
                    let n = res?;
                    return Ok((n > 0).then(|| Bytes::copy_from_slice(&buf[..n])));
                }
                PipeEvent::Stderr(Ok(0)) => *stderr = None,
                PipeEvent::Stderr(Ok(n)) => return Ok(Some(Bytes::copy_from_slice(&stderr_buf[..n]))),
                PipeEvent::Stderr(Err(error)) => {
                    debug!(%error, "Couldn't read shell stderr");
                    *stderr = None;
                }
            }
        }
    }
}

async fn read_optional<R>(reader: Option<&mut R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

enum ShellChild {
    Pipe(Child),
    Pty(PtyChild),
}

impl ShellChild {
    async fn terminate(self, timeout: Duration) {
        match self {
            ShellChild::Pipe(mut child) => {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(?status, "Shell exited");
                        return;
                    }
                    Ok(None) => {}
                    Err(error) => debug!(%error, "Couldn't query shell status"),
                }

                if let Err(error) = child.start_kill() {
                    debug!(%error, "Couldn't kill shell");
                }

                match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(Ok(status)) => debug!(?status, "Shell terminated"),
                    Ok(Err(error)) => debug!(%error, "Couldn't wait for shell"),
                    Err(_) => warn!("Shell did not exit in time"),
                }
            }
            ShellChild::Pty(child) => child.terminate(timeout).await,
        }
    }
}

// === forwarding === //

struct ShellForwardTask {
    conn: Connection,
    tunnel: Arc<Tunnel>,
    close_signal: CloseSignal,
    output: ShellOutput,
    child: ShellChild,
    read_buffer_size: usize,
    exit_timeout: Duration,
}

impl ShellForwardTask {
    fn spawn(self, span: Span) -> ChildTask<()> {
        ChildTask::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        let Self {
            conn,
            tunnel,
            mut close_signal,
            mut output,
            child,
            read_buffer_size,
            exit_timeout,
        } = self;

        let mut guard = LocalCloseGuard::new(conn.clone(), Arc::clone(&tunnel));
        let mut buf = vec![0; read_buffer_size];

        loop {
            let chunk = tokio::select! {
                () = close_signal.closed() => {
                    debug!("Shell tunnel closed");
                    break;
                }
                chunk = output.next_chunk(&mut buf) => chunk,
            };

            match chunk {
                Ok(Some(data)) => {
                    trace!(len = data.len(), "Shell output");

                    if let Err(error) = conn.outbound().send_data(tunnel.id(), data) {
                        debug!(%error, "Couldn't forward shell output");
                        guard.set_reason(error.to_string());
                        break;
                    }
                }
                Ok(None) => {
                    guard.set_reason("EOF");
                    break;
                }
                Err(error) => {
                    debug!(%error, "Couldn't read shell output");
                    guard.set_reason(read_error_reason(&error));
                    break;
                }
            }
        }

        drop(output);
        drop(guard);

        child.terminate(exit_timeout).await;
    }
}

fn read_error_reason(error: &io::Error) -> String {
    let reason = error.to_string();

    if reason.is_empty() { "read error".to_owned() } else { reason }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn existing_override_is_used() {
        let exe = std::env::current_exe().unwrap();
        let cfg = ShellConfig {
            default_path: Some(PathBuf::from("/configured/shell")),
            ..ShellConfig::default()
        };

        assert_eq!(exe, resolve_shell_path(exe.to_str(), &cfg));
    }

    #[test]
    fn missing_override_falls_back_to_configured_default() {
        let cfg = ShellConfig {
            default_path: Some(PathBuf::from("/configured/shell")),
            ..ShellConfig::default()
        };

        assert_eq!(
            PathBuf::from("/configured/shell"),
            resolve_shell_path(Some("/definitely/not/a/shell"), &cfg)
        );
        assert_eq!(PathBuf::from("/configured/shell"), resolve_shell_path(None, &cfg));
    }

    #[test]
    fn resolution_without_configuration_yields_a_path() {
        let path = resolve_shell_path(None, &ShellConfig::default());
        assert!(!path.as_os_str().is_empty());
    }

    #[test]
    fn empty_error_text_becomes_read_error() {
        let error = io::Error::other("");
        assert_eq!("read error", read_error_reason(&error));

        let error = io::Error::other("device gone");
        assert_eq!("device gone", read_error_reason(&error));
    }
}
