//! Newline-delimited frame transport.
//!
//! A [`Transport`] is one duplex connection split into a reader half and a
//! writer half, so the link's reader and writer tasks can each own theirs.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::{LinkError, LinkResult};

/// Longest frame a reader accepts, newline included.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[async_trait]
pub trait FrameReader: Send {
    /// Read the next frame, `None` once the peer has closed the connection.
    async fn read_frame(&mut self) -> LinkResult<Option<String>>;
}

#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &str) -> LinkResult<()>;

    /// Flush and shut down the write side.
    async fn close(&mut self) -> LinkResult<()>;
}

/// Both halves of a connection plus a label for logging.
pub struct Transport {
    pub peer: String,
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

impl Transport {
    /// Frame any byte stream as one JSON document per line.
    pub fn lines<T>(peer: impl Into<String>, io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::lines_with_limit(peer, io, MAX_FRAME_LEN)
    }

    /// Like [`Transport::lines`], failing the reader on frames over `max_frame` bytes.
    pub fn lines_with_limit<T>(peer: impl Into<String>, io: T, max_frame: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(io);
        Self {
            peer: peer.into(),
            reader: Box::new(LineReader {
                inner: BufReader::new(read),
                buf: String::new(),
                max_frame,
            }),
            writer: Box::new(LineWriter { inner: write }),
        }
    }

    pub async fn connect_tcp(addr: &str) -> LinkResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| LinkError::Dial(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Self::lines(addr, stream))
    }
}

struct LineReader<R> {
    inner: BufReader<R>,
    buf: String,
    max_frame: usize,
}

#[async_trait]
impl<R> FrameReader for LineReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn read_frame(&mut self) -> LinkResult<Option<String>> {
        loop {
            self.buf.clear();
            let limit = self.max_frame as u64;
            let read = (&mut self.inner).take(limit).read_line(&mut self.buf).await?;
            if read == 0 {
                return Ok(None);
            }
            if read as u64 >= limit && !self.buf.ends_with('\n') {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame exceeds {} bytes", self.max_frame),
                )
                .into());
            }
            let frame = self.buf.trim_end_matches(['\r', '\n']);
            if !frame.is_empty() {
                return Ok(Some(frame.to_string()));
            }
        }
    }
}

struct LineWriter<W> {
    inner: W,
}

#[async_trait]
impl<W> FrameWriter for LineWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write_frame(&mut self, frame: &str) -> LinkResult<()> {
        let mut line = Vec::with_capacity(frame.len() + 1);
        line.extend_from_slice(frame.as_bytes());
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> LinkResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
