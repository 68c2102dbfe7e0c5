use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Decides whether a server accepts clients yet
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, addr: SocketAddr) -> Result<()>;
}

/// Connects as a NATS client and completes a `PING`/`PONG` round trip.
///
/// A bare TCP connect is not enough: the listener is bound before the
/// server is willing to process client traffic.
#[derive(Debug, Clone)]
pub struct NatsHandshakeProbe {
    io_timeout: Duration,
}

impl Default for NatsHandshakeProbe {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(1),
        }
    }
}

impl NatsHandshakeProbe {
    pub fn with_io_timeout(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    async fn handshake(addr: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(64 * 1024));

        let info = lines
            .next()
            .await
            .context("connection closed before INFO")??;
        if !info.starts_with("INFO") {
            bail!("expected INFO, got {info:?}");
        }

        writer
            .write_all(b"CONNECT {\"verbose\":false,\"pedantic\":false}\r\nPING\r\n")
            .await?;
        writer.flush().await?;

        while let Some(line) = lines.next().await {
            let line = line?;
            match line.as_str() {
                "PONG" => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
                "PING" => writer.write_all(b"PONG\r\n").await?,
                err if err.starts_with("-ERR") => bail!("server rejected client: {err}"),
                // INFO updates and +OK
                _ => {}
            }
        }
        bail!("connection closed before PONG")
    }
}

#[async_trait]
impl ReadinessProbe for NatsHandshakeProbe {
    async fn probe(&self, addr: SocketAddr) -> Result<()> {
        tokio::time::timeout(self.io_timeout, Self::handshake(addr))
            .await
            .with_context(|| format!("handshake with {addr} timed out"))?
    }
}
