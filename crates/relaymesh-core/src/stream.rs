//! Chunked duplex streams.
//!
//! A [`Stream`] is an ordered source of byte chunks plus a sink accepting
//! byte chunks. Relay legs, direct sockets and direct channels are all
//! expressed through it, so components can be stacked on top of each other.
//!
//! Byte-oriented channels (TCP sockets, direct channels) carry no chunk
//! boundaries of their own; [`Stream::framed`] adds 4-byte big-endian length
//! prefixes.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Receiving half of a stream
pub type ChunkSource = mpsc::Receiver<Bytes>;

/// Sending half of a stream
pub type ChunkSink = mpsc::Sender<Bytes>;

/// Default number of chunks buffered per direction
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Largest frame accepted by the length-prefix codec (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Size of the length prefix
const LENGTH_PREFIX_SIZE: usize = 4;

/// Bidirectional chunk stream
#[derive(Debug)]
pub struct Stream {
    /// Chunks received from the remote end
    pub source: ChunkSource,
    /// Chunks to send to the remote end
    pub sink: ChunkSink,
}

impl Stream {
    /// Assemble a stream from its halves
    #[must_use]
    pub fn new(source: ChunkSource, sink: ChunkSink) -> Self {
        Self { source, sink }
    }

    /// Two connected in-memory streams: what one end sends the other receives
    #[must_use]
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_STREAM_CAPACITY)
    }

    /// Like [`Stream::pair`] with a custom per-direction buffer size
    #[must_use]
    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (Self::new(b_rx, a_tx), Self::new(a_rx, b_tx))
    }

    /// Split into source and sink
    #[must_use]
    pub fn into_parts(self) -> (ChunkSource, ChunkSink) {
        (self.source, self.sink)
    }

    /// Send one chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosed`] if the remote end is gone.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<()> {
        self.sink
            .send(chunk.into())
            .await
            .map_err(|_| Error::StreamClosed)
    }

    /// Receive the next chunk, `None` once the remote end finished
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.source.recv().await
    }

    /// Wrap a byte-oriented I/O object into a chunk stream using
    /// length-prefixed framing.
    ///
    /// Two tasks are spawned, one per direction. The returned [`StreamTask`]
    /// can abort both.
    pub fn framed<T>(io: T) -> (Self, StreamTask)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(io);
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(DEFAULT_STREAM_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(DEFAULT_STREAM_CAPACITY);

        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("framed stream read ended: {}", e);
                        break;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(chunk) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &chunk).await {
                    tracing::debug!("framed stream write failed: {}", e);
                    return;
                }
            }
            if let Err(e) = writer.shutdown().await {
                tracing::trace!("framed stream shutdown failed: {}", e);
            }
        });

        (Self::new(in_rx, out_tx), StreamTask { reader, writer })
    }
}

/// Background tasks driving a framed stream
#[derive(Debug)]
pub struct StreamTask {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl StreamTask {
    /// Stop both directions immediately
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Whether both directions have finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }
}

/// Prefix `payload` with its length as a 4-byte big-endian integer
#[must_use]
pub fn encode_with_length_prefix(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental decoder for length-prefixed frames.
///
/// Accepts arbitrary byte slices and yields complete frames, no matter how
/// the input was chunked.
#[derive(Debug, Default)]
pub struct LengthPrefixDecoder {
    buf: BytesMut,
}

impl LengthPrefixDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete frame, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] if the announced length exceeds
    /// [`MAX_FRAME_SIZE`].
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(len));
        }

        if self.buf.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes buffered but not yet returned
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
///
/// # Errors
///
/// Returns an error on I/O failure, on truncation inside a frame, or if the
/// frame exceeds [`MAX_FRAME_SIZE`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(len));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(Bytes::from(frame)))
}

/// Write one length-prefixed frame and flush.
///
/// # Errors
///
/// Returns an error on I/O failure or if the payload exceeds
/// [`MAX_FRAME_SIZE`].
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(payload.len()));
    }
    writer.write_all(&encode_with_length_prefix(payload)).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_crossed() {
        let (mut a, mut b) = Stream::pair();

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        b.send(Bytes::from_static(b"pong")).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"ping"));
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_send_after_drop_fails() {
        let (a, b) = Stream::pair();
        drop(b);
        assert!(matches!(
            a.send(Bytes::from_static(b"x")).await,
            Err(Error::StreamClosed)
        ));
    }

    #[test]
    fn test_decoder_split_input() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_with_length_prefix(b"hello"));
        wire.extend_from_slice(&encode_with_length_prefix(b""));
        wire.extend_from_slice(&encode_with_length_prefix(b"world!"));

        let mut decoder = LengthPrefixDecoder::new();
        let mut frames = Vec::new();
        for byte in wire {
            decoder.extend(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"hello"),
                Bytes::new(),
                Bytes::from_static(b"world!")
            ]
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_rejects_oversized() {
        let mut decoder = LengthPrefixDecoder::new();
        decoder.extend(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        assert!(matches!(decoder.next_frame(), Err(Error::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        let (left, right) = tokio::io::duplex(1024);
        let (mut a, task_a) = Stream::framed(left);
        let (mut b, task_b) = Stream::framed(right);

        a.send(Bytes::from_static(b"first")).await.unwrap();
        a.send(Bytes::from_static(b"second")).await.unwrap();
        b.send(Bytes::from_static(b"reply")).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"reply"));

        task_a.abort();
        task_b.abort();
    }

    #[tokio::test]
    async fn test_framed_end_of_stream() {
        let (left, right) = tokio::io::duplex(1024);
        let (a, _task_a) = Stream::framed(left);
        let (mut b, _task_b) = Stream::framed(right);

        a.send(Bytes::from_static(b"last")).await.unwrap();
        drop(a);

        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"last"));
        assert!(b.recv().await.is_none());
    }
}
