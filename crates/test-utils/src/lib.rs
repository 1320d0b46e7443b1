use std::net::SocketAddr;

use anyhow::Context as _;
use proptest::collection::size_range;
use proptest::prelude::*;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// For sane Debug display
#[derive(PartialEq, Eq, PartialOrd, Ord)]
pub struct Payload(pub Vec<u8>);

impl core::fmt::Debug for Payload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x")?;
        for v in self.0.iter().take(15) {
            write!(f, "{v:X?}")?;
        }
        write!(f, "..")
    }
}

const PAYLOAD_MINIMUM_SIZE: usize = 1;
const PAYLOAD_MAXIMUM_SIZE: usize = 64 * 1024;

prop_compose! {
    pub fn payload()(data in any_with::<Vec<u8>>(size_range(PAYLOAD_MINIMUM_SIZE..PAYLOAD_MAXIMUM_SIZE).lift())) -> Payload {
        Payload(data)
    }
}

/// Installs a test-friendly tracing subscriber, honoring `RUST_LOG`.
///
/// Safe to call from every test: only the first call installs the subscriber.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Returns a local port nothing listens on, so that connecting to it is refused.
pub fn find_refused_port() -> anyhow::Result<u16> {
    portpicker::pick_unused_port().context("no free port available")
}

/// Spawns a TCP server echoing back everything it receives, one connection at a time.
pub async fn spawn_echo_server() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    Ok(addr)
}

/// Spawns a TCP server that sends `greeting` to the first client, then closes the connection.
pub async fn spawn_greeting_server(greeting: &'static [u8]) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(greeting).await;
            let _ = stream.shutdown().await;
        }
    });

    Ok(addr)
}

/// A TCP server that accepts a single client and never sends anything.
///
/// The receiver completes once the client side of the connection is closed.
pub async fn spawn_silent_server() -> anyhow::Result<(SocketAddr, oneshot::Receiver<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = closed_tx.send(());
        }
    });

    Ok((addr, closed_rx))
}
