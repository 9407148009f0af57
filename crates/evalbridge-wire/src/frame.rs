//! Framed bencode I/O over async byte streams.
//!
//! Bencode values are self-delimiting, so a frame is simply one top-level
//! value. [`FrameReader`] buffers incoming bytes and peels complete values
//! off the front; [`write_frame`] encodes and flushes one value.

use crate::bencode::{decode, encode, FrameScanner, WireValue};
use bytes::BytesMut;
use evalbridge_types::error::BridgeError;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Frame too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl From<WireError> for BridgeError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(e) => BridgeError::Connection(e.to_string()),
            WireError::MalformedFrame(msg) => BridgeError::MalformedFrame(msg),
            WireError::ConnectionClosed => BridgeError::Connection("connection closed".into()),
            WireError::Timeout(d) => BridgeError::Timeout {
                what: "terminal status".into(),
                elapsed_ms: d.as_millis() as u64,
            },
            WireError::MessageTooLarge { size, max } => {
                BridgeError::MalformedFrame(format!("frame of {size} bytes exceeds {max}"))
            }
        }
    }
}

/// Maximum buffered frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// What one bounded poll of the stream produced.
#[derive(Debug, PartialEq)]
pub enum FramePoll {
    /// A complete frame.
    Frame(WireValue),
    /// Bytes arrived within the wait but no frame completed yet.
    Partial,
    /// Nothing arrived within the wait.
    Idle,
    /// The peer closed the stream.
    Closed,
}

/// Buffers a byte stream and yields whole bencode frames.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    scanner: FrameScanner,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_SIZE)
    }

    /// Reader that rejects any frame longer than `max_frame` bytes, including
    /// one that merely declares a string that long.
    pub fn with_limit(inner: R, max_frame: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            scanner: FrameScanner::new(max_frame),
            max_frame,
        }
    }

    /// Take one complete frame from the buffer, if present.
    ///
    /// A frame that fails full decoding is still removed, so the stream stays
    /// aligned on the next frame.
    fn take_buffered(&mut self) -> Result<Option<WireValue>, WireError> {
        match self.scanner.scan(&self.buf)? {
            Some(end) if end > self.max_frame => Err(WireError::MessageTooLarge {
                size: end,
                max: self.max_frame,
            }),
            Some(end) => {
                let frame = self.buf.split_to(end);
                self.scanner.reset();
                decode(&frame).map(Some)
            }
            None if self.buf.len() > self.max_frame => Err(WireError::MessageTooLarge {
                size: self.buf.len(),
                max: self.max_frame,
            }),
            None => Ok(None),
        }
    }

    /// Read bytes until one frame is complete.
    ///
    /// A clean EOF between frames is [`WireError::ConnectionClosed`]; EOF in
    /// the middle of a frame is a malformed frame.
    pub async fn read_frame(&mut self) -> Result<WireValue, WireError> {
        loop {
            if let Some(value) = self.take_buffered()? {
                return Ok(value);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(self.eof_error());
            }
        }
    }

    /// Wait at most `wait` for one frame.
    ///
    /// Distinguishes "nothing arrived" from "a frame is still arriving" and
    /// from "peer closed" so a polling caller can decide whether to go on.
    pub async fn poll_frame(&mut self, wait: Duration) -> Result<FramePoll, WireError> {
        if let Some(value) = self.take_buffered()? {
            return Ok(FramePoll::Frame(value));
        }
        let deadline = tokio::time::Instant::now() + wait;
        let mut received = false;
        loop {
            let read = tokio::time::timeout_at(deadline, self.inner.read_buf(&mut self.buf)).await;
            match read {
                Err(_) if received => return Ok(FramePoll::Partial),
                Err(_) => return Ok(FramePoll::Idle),
                Ok(Ok(0)) if self.buf.is_empty() => return Ok(FramePoll::Closed),
                Ok(Ok(0)) => return Err(self.eof_error()),
                Ok(Ok(_)) => {
                    received = true;
                    if let Some(value) = self.take_buffered()? {
                        return Ok(FramePoll::Frame(value));
                    }
                }
                Ok(Err(e)) => return Err(WireError::Io(e)),
            }
        }
    }

    fn eof_error(&self) -> WireError {
        if self.buf.is_empty() {
            WireError::ConnectionClosed
        } else {
            WireError::MalformedFrame(format!(
                "stream ended with {} bytes of an incomplete frame",
                self.buf.len()
            ))
        }
    }
}

/// Encode one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &WireValue,
) -> Result<(), WireError> {
    let bytes = encode(value);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(op: &str) -> WireValue {
        WireValue::dict([("op", WireValue::from(op))])
    }

    #[tokio::test]
    async fn test_reads_frames_split_across_writes() {
        let bytes = encode(&frame("describe"));
        let (head, tail) = bytes.split_at(5);
        let peer = tokio_test::io::Builder::new()
            .read(head)
            .wait(Duration::from_millis(20))
            .read(tail)
            .build();
        let mut reader = FrameReader::new(peer);
        assert_eq!(reader.read_frame().await.unwrap(), frame("describe"));
    }

    #[tokio::test]
    async fn test_poll_reports_partial_progress() {
        let peer = tokio_test::io::Builder::new()
            .read(b"d2:op")
            .wait(Duration::from_millis(60))
            .read(b"4:evale")
            .build();
        let mut reader = FrameReader::new(peer);
        assert_eq!(
            reader.poll_frame(Duration::from_millis(20)).await.unwrap(),
            FramePoll::Partial
        );
        assert_eq!(
            reader.poll_frame(Duration::from_secs(2)).await.unwrap(),
            FramePoll::Frame(frame("eval"))
        );
    }

    #[tokio::test]
    async fn test_large_frame_in_small_chunks() {
        let items = 20_000;
        let bytes = encode(&WireValue::List(vec![WireValue::Int(1); items]));
        let (mut client, server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
            client
        });
        let mut reader = FrameReader::new(server);
        match reader.read_frame().await.unwrap() {
            WireValue::List(list) => assert_eq!(list.len(), items),
            other => panic!("expected a list, got {other}"),
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_and_stream_continues() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(server);
        let mut bytes = b"di1ei2ee".to_vec();
        bytes.extend(encode(&frame("next")));
        client.write_all(&bytes).await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(WireError::MalformedFrame(_))
        ));
        assert_eq!(reader.read_frame().await.unwrap(), frame("next"));
    }

    #[tokio::test]
    async fn test_two_frames_in_one_write() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(server);
        let mut bytes = encode(&frame("a"));
        bytes.extend(encode(&frame("b")));
        client.write_all(&bytes).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), frame("a"));
        assert_eq!(reader.read_frame().await.unwrap(), frame("b"));
    }

    #[tokio::test]
    async fn test_poll_distinguishes_idle_and_closed() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        assert_eq!(
            reader.poll_frame(Duration::from_millis(10)).await.unwrap(),
            FramePoll::Idle
        );
        drop(client);
        assert_eq!(
            reader.poll_frame(Duration::from_millis(10)).await.unwrap(),
            FramePoll::Closed
        );
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_malformed() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client.write_all(b"d2:op").await.unwrap();
        drop(client);
        assert!(matches!(
            reader.read_frame().await,
            Err(WireError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_size_limit() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FrameReader::with_limit(server, 16);
        client.write_all(b"li1ei2ei3ei4ei5ei6e").await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(WireError::MessageTooLarge { max: 16, .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_declared_length_fails_without_waiting() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FrameReader::with_limit(server, 16);
        client.write_all(b"100000000:ab").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), reader.read_frame())
            .await
            .expect("reader should fail before more bytes arrive");
        assert!(matches!(
            result,
            Err(WireError::MessageTooLarge { max: 16, .. })
        ));
        drop(client);
    }

    #[tokio::test]
    async fn test_write_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        write_frame(&mut client, &WireValue::Int(12)).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), WireValue::Int(12));
    }

    #[test]
    fn test_error_conversion() {
        let err: BridgeError = WireError::MalformedFrame("bad".into()).into();
        assert!(matches!(err, BridgeError::MalformedFrame(_)));
        let err: BridgeError = WireError::ConnectionClosed.into();
        assert!(matches!(err, BridgeError::Connection(_)));
    }
}
