use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

/// Writer receiving the server's captured output
pub struct OutputSink(Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>);

impl Clone for OutputSink {
    fn clone(&self) -> Self {
        OutputSink(self.0.clone())
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputSink")
    }
}

impl OutputSink {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> OutputSink {
        OutputSink(Arc::new(Mutex::new(t)))
    }

    pub fn stdout() -> OutputSink {
        Self::new(Box::new(tokio::io::stdout()))
    }

    pub fn stderr() -> OutputSink {
        Self::new(Box::new(tokio::io::stderr()))
    }

    pub fn inner(&self) -> Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>> {
        self.0.clone()
    }

    pub async fn write(&self, text: &str) -> std::io::Result<()> {
        let mut lock = self.0.lock().await;
        lock.write_all(text.as_bytes()).await?;
        lock.flush().await
    }
}

/// Which pipe a chunk of output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Collects everything the server writes to stdout and stderr.
///
/// Output is kept in memory for diagnostics, forwarded to the optional
/// sink, and logged at debug level under the `nats_server` target.
#[derive(Clone)]
pub struct OutputCapture {
    buffer: Arc<std::sync::Mutex<String>>,
    sink: Option<OutputSink>,
    pumps: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl OutputCapture {
    pub fn new(sink: Option<OutputSink>) -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(String::new())),
            sink,
            pumps: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Start pumping `reader` into this capture on a background task
    pub fn attach<R>(&self, reader: R, stream: OutputStream)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capture = self.clone();
        let pump = tokio::spawn(async move {
            if let Err(e) = capture.pump(reader, stream).await {
                warn!(%stream, "Stopped capturing server output: {e}");
            }
        });
        self.pumps.lock().unwrap().push(pump);
    }

    /// Wait until every attached pipe reached end of file, bounded by `bound`.
    ///
    /// Returns false if some pump was still running when the bound elapsed.
    pub async fn flush(&self, bound: Duration) -> bool {
        let pumps: Vec<_> = self.pumps.lock().unwrap().drain(..).collect();
        let drained = tokio::time::timeout(bound, async move {
            for pump in pumps {
                let _ = pump.await;
            }
        })
        .await
        .is_ok();

        if let Some(sink) = &self.sink {
            let _ = sink.inner().lock().await.flush().await;
        }
        drained
    }

    /// Stop all pumps without waiting for them
    pub fn abort(&self) {
        for pump in self.pumps.lock().unwrap().drain(..) {
            pump.abort();
        }
    }

    /// Everything captured so far
    pub fn contents(&self) -> String {
        self.buffer.lock().unwrap().clone()
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    async fn pump<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        stream: OutputStream,
    ) -> tokio::io::Result<()> {
        let mut frames = FramedRead::with_capacity(reader, Utf8Codec, 1024);
        while let Some(frame) = frames.next().await {
            let text = frame
                .map_err(|e| tokio::io::Error::new(tokio::io::ErrorKind::InvalidData, e))?;
            self.record(stream, &text).await;
        }
        Ok(())
    }

    async fn record(&self, stream: OutputStream, text: &str) {
        self.buffer.lock().unwrap().push_str(text);

        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            debug!(target: "nats_server", %stream, "{line}");
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.write(text).await {
                warn!(%stream, "Failed to forward server output to sink: {e}");
            }
        }
    }
}

struct Utf8Codec;

impl Decoder for Utf8Codec {
    type Item = String;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match std::str::from_utf8(src) {
            Ok(s) => {
                let out = s.to_owned();
                src.clear();
                Ok(Some(out))
            }
            // Incomplete multi-byte sequence at the end: emit the valid prefix and wait
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();

                if valid == 0 {
                    return Ok(None);
                }

                let out = std::str::from_utf8(&src[..valid])?.to_owned();
                src.advance(valid);
                Ok(Some(out))
            }
            Err(_) => {
                let out = String::from_utf8_lossy(src).into_owned();
                src.clear();
                Ok(Some(out))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(out) => Ok(Some(out)),
            None if src.is_empty() => Ok(None),
            None => {
                let out = String::from_utf8_lossy(src).into_owned();
                src.clear();
                Ok(Some(out))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl AsyncWrite for SharedBuffer {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_codec_holds_back_split_sequence() {
        let mut codec = Utf8Codec;
        // "hé" with the second byte of 'é' missing
        let mut buf = BytesMut::from(&b"h\xc3"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("h".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"\xa9!");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("é!".to_string()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_replaces_invalid_bytes() {
        let mut codec = Utf8Codec;
        let mut buf = BytesMut::from(&b"ok\xff"[..]);
        let out = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert!(out.starts_with("ok"));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_capture_collects_and_forwards() {
        let shared = SharedBuffer::default();
        let capture = OutputCapture::new(Some(OutputSink::new(Box::new(shared.clone()))));

        let (mut writer, reader) = tokio::io::duplex(64);
        capture.attach(reader, OutputStream::Stderr);

        writer.write_all(b"[INF] Starting nats-server\n").await.unwrap();
        drop(writer);

        assert!(capture.flush(Duration::from_secs(2)).await);
        assert_eq!(capture.contents(), "[INF] Starting nats-server\n");

        let forwarded = String::from_utf8(shared.0.lock().unwrap().clone()).unwrap();
        assert_eq!(forwarded, "[INF] Starting nats-server\n");
    }

    #[tokio::test]
    async fn test_flush_is_bounded() {
        let capture = OutputCapture::new(None);
        let (_writer, reader) = tokio::io::duplex(64);
        capture.attach(reader, OutputStream::Stdout);

        assert!(!capture.flush(Duration::from_millis(50)).await);
        assert!(!capture.has_sink());
    }
}
