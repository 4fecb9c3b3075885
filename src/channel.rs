//! The framed pipe channel (component A of the spec): length-prefixed
//! message framing shared by both sides, with an async implementation for
//! the host and a blocking one for the worker.
//!
//! Framing is identical in both directions: a 4-byte big-endian length, or
//! `-1` followed by an 8-byte big-endian extended length for payloads over
//! `i32::MAX` bytes.

use std::io::{Read, Write};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BrokenWorker;

/// Payloads at or under this size get their header and body concatenated
/// into one write, to avoid a small-write round trip on buffered
/// transports. Larger payloads are written header-then-body.
const SMALL_WRITE_THRESHOLD: usize = 16384;

const EXTENDED_LENGTH_MARKER: i32 = -1;
const MAX_SMALL_LEN: u64 = i32::MAX as u64;

fn build_header(payload_len: u64) -> Vec<u8> {
    if payload_len <= MAX_SMALL_LEN {
        (payload_len as i32).to_be_bytes().to_vec()
    } else {
        let mut header = EXTENDED_LENGTH_MARKER.to_be_bytes().to_vec();
        header.extend_from_slice(&payload_len.to_be_bytes());
        header
    }
}

fn is_eof(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::UnexpectedEof
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ---------------------------------------------------------------- async ---

/// Host-side framed channel over any async duplex stream (in practice a
/// `tokio::net::UnixStream` wrapping one end of a socketpair).
pub struct AsyncFramed<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncFramed<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), BrokenWorker> {
        let header = build_header(payload.len() as u64);
        if payload.len() <= SMALL_WRITE_THRESHOLD {
            let mut buf = header;
            buf.extend_from_slice(payload);
            self.stream.write_all(&buf).await?;
        } else {
            self.stream.write_all(&header).await?;
            self.stream.write_all(payload).await?;
        }
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>, BrokenWorker> {
        let mut header = [0u8; 4];
        self.read_exact_or_eof(&mut header).await?;
        let len = self.decode_len(header).await?;
        let mut payload = vec![0u8; len as usize];
        if len > 0 {
            self.read_exact_or_eof(&mut payload).await?;
        }
        Ok(payload)
    }

    async fn decode_len(&mut self, header: [u8; 4]) -> Result<u64, BrokenWorker> {
        let n = i32::from_be_bytes(header);
        if n == EXTENDED_LENGTH_MARKER {
            let mut ext = [0u8; 8];
            self.read_exact_or_eof(&mut ext).await?;
            Ok(u64::from_be_bytes(ext))
        } else {
            Ok(n as u64)
        }
    }

    async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<(), BrokenWorker> {
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if is_eof(&e) => Err(BrokenWorker::FramingEof),
            Err(e) => Err(BrokenWorker::Io(e)),
        }
    }

    /// Gives back the wrapped stream, e.g. to shut it down explicitly on
    /// kill.
    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

// -------------------------------------------------------------- blocking --

/// Outcome of polling for the next job inside the worker: either a message
/// arrived, or nothing did before `idle_timeout` elapsed.
pub enum PollOutcome {
    Message(Vec<u8>),
    Idle,
}

/// Streams that can have their read timeout toggled. Implemented for
/// `std::os::unix::net::UnixStream`; a Windows named-pipe handle would
/// implement it too (see `WorkerTransport` in `context.rs`'s design notes).
pub trait SetReadTimeout {
    fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()>;
}

impl SetReadTimeout for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, dur)
    }
}

/// Worker-side framed channel: blocking reads/writes on the raw socket, no
/// async runtime involved.
pub struct BlockingFramed<S> {
    stream: S,
}

impl<S: Read + Write + SetReadTimeout> BlockingFramed<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<(), BrokenWorker> {
        let header = build_header(payload.len() as u64);
        if payload.len() <= SMALL_WRITE_THRESHOLD {
            let mut buf = header;
            buf.extend_from_slice(payload);
            self.stream.write_all(&buf)?;
        } else {
            self.stream.write_all(&header)?;
            self.stream.write_all(payload)?;
        }
        Ok(())
    }

    /// Block for the next job, but give up and report idle if nothing
    /// arrives within `idle_timeout`. The timeout only applies to the first
    /// byte of the next frame's header -- once a frame has started arriving,
    /// the rest is read without a deadline.
    pub fn poll(&mut self, idle_timeout: Duration) -> Result<PollOutcome, BrokenWorker> {
        self.stream.set_read_timeout(Some(idle_timeout))?;
        let mut header = [0u8; 4];
        match self.stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if is_timeout(&e) => return Ok(PollOutcome::Idle),
            Err(e) if is_eof(&e) => return Err(BrokenWorker::FramingEof),
            Err(e) => return Err(BrokenWorker::Io(e)),
        }
        self.stream.set_read_timeout(None)?;
        let len = self.decode_len(header)?;
        let mut payload = vec![0u8; len as usize];
        if len > 0 {
            self.read_exact_or_eof(&mut payload)?;
        }
        Ok(PollOutcome::Message(payload))
    }

    fn decode_len(&mut self, header: [u8; 4]) -> Result<u64, BrokenWorker> {
        let n = i32::from_be_bytes(header);
        if n == EXTENDED_LENGTH_MARKER {
            let mut ext = [0u8; 8];
            self.read_exact_or_eof(&mut ext)?;
            Ok(u64::from_be_bytes(ext))
        } else {
            Ok(n as u64)
        }
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<(), BrokenWorker> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if is_eof(&e) => Err(BrokenWorker::FramingEof),
            Err(e) => Err(BrokenWorker::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_four_bytes_for_small_payloads() {
        assert_eq!(build_header(0), vec![0, 0, 0, 0]);
        assert_eq!(build_header(16384), (16384i32).to_be_bytes().to_vec());
    }

    #[test]
    fn header_uses_extended_marker_past_i32_max() {
        let n = MAX_SMALL_LEN + 1;
        let header = build_header(n);
        assert_eq!(&header[0..4], &EXTENDED_LENGTH_MARKER.to_be_bytes());
        assert_eq!(&header[4..12], &n.to_be_bytes());
    }

    #[tokio::test]
    async fn async_roundtrip_small_and_empty_payloads() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let mut a = AsyncFramed::new(a);
        let mut b = AsyncFramed::new(b);

        a.send(b"hello").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"hello");

        a.send(b"").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn async_recv_reports_framing_eof_on_half_sent_header() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        {
            use tokio::io::AsyncWriteExt;
            let mut a = a;
            a.write_all(&[0, 0]).await.unwrap();
            drop(a);
        }
        let mut b = AsyncFramed::new(b);
        match b.recv().await {
            Err(BrokenWorker::FramingEof) => {}
            other => panic!("expected FramingEof, got {other:?}"),
        }
    }
}
