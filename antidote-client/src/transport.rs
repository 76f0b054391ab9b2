//! Transport session: TCP setup and frame-level reads and writes.

use crate::error::ClientError;
use antidote_protocol::{Decoder, Frame};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

/// Opens a TCP connection to `host:port`.
///
/// Refusal, resolver failure and connect timeout all surface as
/// [`ClientError::Connect`].
pub async fn open(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ClientError> {
    let addr = format!("{}:{}", host, port);
    tracing::debug!("Connecting to {}...", addr);

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            tracing::debug!("Connection to {} failed: {}", addr, source);
            return Err(ClientError::Connect { addr, source });
        }
        Err(_) => {
            tracing::debug!("Connection to {} timed out", addr);
            let source = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
            return Err(ClientError::Connect { addr, source });
        }
    };

    // Requests are small and latency bound.
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Splits a stream into its frame reader and frame writer halves.
pub fn split<S>(stream: S, max_frame_size: u32) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FrameReader::new(read_half, max_frame_size),
        FrameWriter::new(write_half),
    )
}

/// Size of each socket read fed to the decoder.
const READ_CHUNK_SIZE: usize = 8192;

/// Reads whole frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: Decoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: u32) -> Self {
        Self {
            inner,
            decoder: Decoder::with_max_frame_size(max_frame_size),
            chunk: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Waits for the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closes the stream between frames; a
    /// close inside a frame is an `UnexpectedEof` I/O error.
    pub async fn receive(&mut self) -> Result<Option<Frame>, ClientError> {
        loop {
            if let Some(frame) = self.decoder.decode_frame()? {
                return Ok(Some(frame));
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered() == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a frame",
                )
                .into());
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

/// Writes encoded frames to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one encoded frame in full.
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await
    }

    /// Shuts down the write direction, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
