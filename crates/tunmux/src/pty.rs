//! Pseudo-terminal backed shells.
//!
//! portable-pty only exposes blocking readers and writers, so each direction is served by a
//! dedicated thread bridged to the async side with channels.

use std::io::{self, Read as _, Write as _};
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;

use crate::config::ShellConfig;
use crate::registry::DataReceiver;

const OUTPUT_CHANNEL_SIZE: usize = 16;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) struct PtyShell {
    pub(crate) output: PtyOutput,
    pub(crate) input: PtyInput,
    pub(crate) child: PtyChild,
}

impl PtyShell {
    pub(crate) fn spawn(path: &Path, cfg: &ShellConfig, read_buffer_size: usize) -> anyhow::Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: cfg.pty_rows,
                cols: cfg.pty_cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY")?;

        let mut cmd = CommandBuilder::new(path);
        cmd.env("TERM", &cfg.term);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {} in a PTY", path.display()))?;

        // The master only sees EOF once every slave handle is gone.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().context("failed to clone PTY reader")?;
        let writer = pair.master.take_writer().context("failed to take PTY writer")?;

        let child = PtyChild {
            child,
            _master: pair.master,
        };

        let output = PtyOutput::spawn(reader, read_buffer_size)?;

        Ok(Self {
            output,
            input: PtyInput { writer },
            child,
        })
    }
}

/// Output of the PTY, read in chunks of at most the configured read buffer size.
pub(crate) struct PtyOutput {
    chunk_rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl PtyOutput {
    fn spawn(mut reader: Box<dyn io::Read + Send>, read_buffer_size: usize) -> anyhow::Result<Self> {
        let (chunk_tx, chunk_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);

        std::thread::Builder::new()
            .name("pty-reader".to_owned())
            .spawn(move || {
                let mut buf = vec![0; read_buffer_size];

                loop {
                    let chunk = match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                        Err(error) if is_slave_hangup(&error) => break,
                        Err(error) => Err(error),
                    };

                    let failed = chunk.is_err();

                    if chunk_tx.blocking_send(chunk).is_err() || failed {
                        break;
                    }
                }
            })
            .context("failed to spawn PTY reader thread")?;

        Ok(Self { chunk_rx })
    }

    /// Returns `None` once the output ended.
    ///
    /// Cancel safe.
    pub(crate) async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.chunk_rx.recv().await.transpose()
    }
}

/// Linux reports EIO on the master once the shell exited and the slave side is closed.
#[cfg(unix)]
fn is_slave_hangup(error: &io::Error) -> bool {
    const EIO: i32 = 5;
    error.raw_os_error() == Some(EIO)
}

#[cfg(not(unix))]
fn is_slave_hangup(_: &io::Error) -> bool {
    false
}

pub(crate) struct PtyInput {
    writer: Box<dyn io::Write + Send>,
}

impl PtyInput {
    /// Writes everything received on `data_rx` to the PTY, until the channel is closed.
    pub(crate) fn spawn_writer(self, mut data_rx: DataReceiver) -> anyhow::Result<()> {
        let Self { mut writer } = self;

        std::thread::Builder::new()
            .name("pty-writer".to_owned())
            .spawn(move || {
                while let Some(data) = data_rx.blocking_recv() {
                    if let Err(error) = writer.write_all(&data).and_then(|()| writer.flush()) {
                        debug!(%error, "PTY writer failed");
                        break;
                    }
                }
            })
            .context("failed to spawn PTY writer thread")?;

        Ok(())
    }
}

/// The shell process. Killed when dropped.
pub(crate) struct PtyChild {
    child: Box<dyn Child + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
}

impl PtyChild {
    pub(crate) async fn terminate(mut self, timeout: Duration) {
        if let Err(error) = self.kill_if_running() {
            debug!(%error, "Couldn't kill PTY shell");
            return;
        }

        let wait = async {
            loop {
                match self.child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(?status, "PTY shell exited");
                        break;
                    }
                    Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                    Err(error) => {
                        debug!(%error, "Couldn't wait for PTY shell");
                        break;
                    }
                }
            }
        };

        if tokio::time::timeout(timeout, wait).await.is_err() {
            warn!("PTY shell did not exit in time");
        }
    }

    fn kill_if_running(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill()?;
        }
        Ok(())
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        let _ = self.kill_if_running();
    }
}
