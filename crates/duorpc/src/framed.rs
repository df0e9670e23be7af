//! # Length-Delimited Framing
//!
//! Emulates message boundaries over a byte stream that has none (Unix
//! sockets, pipes, `tokio::io::duplex`).
//!
//! Frames are length-prefixed: `[4 bytes big-endian u32][payload]`.

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;

use crate::transport::Acceptor;
use crate::transport::Connector;
use crate::transport::FrameRead;
use crate::transport::FrameWrite;
use crate::transport::Result;
use crate::transport::Transport;
use crate::transport::TransportError;

/// A byte stream carrying length-prefixed frames.
pub struct LengthDelimited<T> {
    io: T,
    max_frame_size: usize,
}

impl<T> LengthDelimited<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T, max_frame_size: usize) -> Self {
        Self { io, max_frame_size }
    }
}

impl<T> Transport for LengthDelimited<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameRead>, Box<dyn FrameWrite>) {
        let (reader, writer) = tokio::io::split(self.io);
        let max = self.max_frame_size;
        (
            Box::new(FramedReader { inner: reader, max }),
            Box::new(FramedWriter { inner: writer, max }),
        )
    }
}

/// An already connected byte stream needs no dialing.
#[async_trait::async_trait]
impl<T> Connector for LengthDelimited<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn connect(self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self))
    }
}

#[async_trait::async_trait]
impl<T> Acceptor for LengthDelimited<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn accept(self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self))
    }
}

struct FramedReader<T> {
    inner: ReadHalf<T>,
    max: usize,
}

#[async_trait::async_trait]
impl<T> FrameRead for FramedReader<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        let mut len_buf = [0u8; 4];

        // A clean end of stream is only legal before the first header byte.
        if self.inner.read(&mut len_buf[..1]).await? == 0 {
            return Ok(None);
        }
        self.inner
            .read_exact(&mut len_buf[1..])
            .await
            .map_err(|e| eof_inside("frame header", e))?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max {
            return Err(TransportError::FrameTooLarge { size: len, max: self.max });
        }

        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| eof_inside("frame payload", e))?;

        Ok(Some(Bytes::from(buf)))
    }
}

struct FramedWriter<T> {
    inner: WriteHalf<T>,
    max: usize,
}

#[async_trait::async_trait]
impl<T> FrameWrite for FramedWriter<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        if frame.len() > self.max {
            return Err(TransportError::FrameTooLarge { size: frame.len(), max: self.max });
        }
        let len = (frame.len() as u32).to_be_bytes();
        self.inner.write_all(&len).await?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

fn eof_inside(part: &str, e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Io(format!("stream ended inside {}", part))
    } else {
        e.into()
    }
}
