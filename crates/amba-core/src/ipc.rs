//! # IPC Wire Protocol
//!
//! Messages exchanged between the engine plugin and the external amba
//! process over a byte stream (a Unix socket in practice).
//!
//! Format: every frame is a 4-byte little-endian payload length followed by
//! a postcard-encoded [`IpcMessage`].
//!
//! ## Security
//!
//! The length prefix is checked against `MAX_FRAME_SIZE` before any payload
//! is buffered, so a corrupt or hostile peer cannot force large allocations.
//!
//! ## Delivery
//!
//! Best-effort. The receiving side treats timeouts, EOF and undecodable
//! frames as "no message"; nothing is retried or acknowledged. After an
//! oversized frame header the stream has lost its framing, and the
//! receiver reports [`IpcError::Desynchronized`] from then on instead of
//! reading payload bytes as headers.

use crate::bridge::DirectiveChannel;
use crate::graph::GraphSnapshot;
use crate::primitives::{FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use crate::EngineStateId;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

#[cfg(unix)]
use std::{os::unix::net::UnixStream, path::Path, time::Duration};

/// Bytes requested from the reader per poll.
const READ_CHUNK: usize = 4096;

// =============================================================================
// MESSAGES
// =============================================================================

/// One message on the amba IPC channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpcMessage {
    /// Engine → amba: full copy of one tracked graph.
    GraphSnapshot { name: String, graph: GraphSnapshot },
    /// amba → engine: engine states the scheduler should favor.
    PrioritizeStates(Vec<EngineStateId>),
}

impl IpcMessage {
    /// Short name of the message kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GraphSnapshot { .. } => "graph_snapshot",
            Self::PrioritizeStates(_) => "prioritize_states",
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors of the IPC channel.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream.
    #[error("End of file")]
    EndOfFile,

    /// A frame announced a payload above `MAX_FRAME_SIZE`.
    #[error("Frame of {0} bytes exceeds maximum of {max} bytes", max = MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    /// A payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(postcard::Error),

    /// A message could not be encoded.
    #[error("Encode error: {0}")]
    Encode(postcard::Error),

    /// An earlier oversized frame left the stream without usable framing.
    #[error("Stream desynchronized by an oversized frame")]
    Desynchronized,
}

impl IpcError {
    /// Whether the peer is gone: orderly EOF, or a reset/broken pipe when
    /// it closed with data still unread on either side.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::EndOfFile => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

// =============================================================================
// SENDING HALF
// =============================================================================

/// Sending half of an IPC channel.
#[derive(Debug)]
pub struct IpcTx<W: Write> {
    writer: W,
}

impl<W: Write> IpcTx<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode and write one frame, blocking until it is flushed.
    pub fn blocking_send(&mut self, message: &IpcMessage) -> Result<(), IpcError> {
        let payload = postcard::to_stdvec(message).map_err(IpcError::Encode)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(IpcError::FrameTooLarge(payload.len()));
        }
        let len =
            u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge(payload.len()))?;

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Unwrap the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

// =============================================================================
// RECEIVING HALF
// =============================================================================

/// Receiving half of an IPC channel.
///
/// Buffers partial frames across polls, so a reader with a read timeout
/// never loses framing when a timeout hits mid-frame.
#[derive(Debug)]
pub struct IpcRx<R: Read> {
    reader: R,
    /// Bytes read but not yet consumed as a frame.
    buffer: Vec<u8>,
    /// Whether EOF was already logged.
    closed: bool,
    /// Set once an oversized header was seen; no further reads happen.
    desynchronized: bool,
}

impl<R: Read> IpcRx<R> {
    /// Wrap a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            closed: false,
            desynchronized: false,
        }
    }

    /// Return the next message if one is buffered or arrives within one
    /// read call.
    ///
    /// `Ok(None)` means nothing complete is available yet (including read
    /// timeouts and `WouldBlock`).
    pub fn poll_receive(&mut self) -> Result<Option<IpcMessage>, IpcError> {
        if self.desynchronized {
            return Err(IpcError::Desynchronized);
        }
        if let Some(message) = self.take_frame()? {
            return Ok(Some(message));
        }

        let mut chunk = [0u8; READ_CHUNK];
        match self.reader.read(&mut chunk) {
            Ok(0) => Err(IpcError::EndOfFile),
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                self.take_frame()
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(IpcError::Io(e)),
        }
    }

    /// Block until a full message arrives.
    pub fn blocking_receive(&mut self) -> Result<IpcMessage, IpcError> {
        loop {
            if let Some(message) = self.poll_receive()? {
                return Ok(message);
            }
        }
    }

    /// Decode one complete frame from the buffer, if present.
    fn take_frame(&mut self) -> Result<Option<IpcMessage>, IpcError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            // Nothing after this header is trustworthy.
            self.buffer.clear();
            self.desynchronized = true;
            tracing::warn!(len, "oversized IPC frame, abandoning stream");
            return Err(IpcError::FrameTooLarge(len));
        }

        let end = FRAME_HEADER_LEN + len;
        if self.buffer.len() < end {
            return Ok(None);
        }

        let decoded = postcard::from_bytes::<IpcMessage>(&self.buffer[FRAME_HEADER_LEN..end]);
        self.buffer.drain(..end);
        decoded.map(Some).map_err(IpcError::Decode)
    }
}

impl<R: Read + Send> DirectiveChannel for IpcRx<R> {
    fn try_receive(&mut self, out: &mut Vec<EngineStateId>) -> bool {
        match self.poll_receive() {
            Ok(Some(IpcMessage::PrioritizeStates(states))) => {
                out.extend(states);
                true
            }
            Ok(Some(other)) => {
                tracing::debug!(kind = other.kind(), "ignoring non-directive IPC message");
                false
            }
            Ok(None) => false,
            Err(IpcError::Desynchronized) => false,
            Err(e) if e.is_disconnect() => {
                if !self.closed {
                    self.closed = true;
                    tracing::info!("directive channel closed by peer");
                }
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping unreadable directive");
                false
            }
        }
    }
}

// =============================================================================
// UNIX SOCKETS
// =============================================================================

/// Split a connected stream into a sender and a receiver whose reads time
/// out after `receive_timeout`.
#[cfg(unix)]
pub fn split(
    stream: UnixStream,
    receive_timeout: Duration,
) -> Result<(IpcTx<UnixStream>, IpcRx<UnixStream>), IpcError> {
    let reader = stream.try_clone()?;
    // A zero timeout is rejected by the OS.
    reader.set_read_timeout(Some(receive_timeout.max(Duration::from_millis(1))))?;
    Ok((IpcTx::new(stream), IpcRx::new(reader)))
}

/// Connect to the amba socket at `path`.
#[cfg(unix)]
pub fn connect(
    path: impl AsRef<Path>,
    receive_timeout: Duration,
) -> Result<(IpcTx<UnixStream>, IpcRx<UnixStream>), IpcError> {
    let path = path.as_ref();
    tracing::debug!(?path, "connecting to IPC socket");
    split(UnixStream::connect(path)?, receive_timeout)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, GraphSink};
    use std::io::Cursor;

    fn frame(message: &IpcMessage) -> Vec<u8> {
        let mut tx = IpcTx::new(Vec::new());
        tx.blocking_send(message).expect("send");
        tx.into_inner()
    }

    /// Hands out its bytes one at a time, then reports `WouldBlock`.
    struct Trickle {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.bytes.get(self.pos) {
                Some(&b) => {
                    buf[0] = b;
                    self.pos += 1;
                    Ok(1)
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn frame_has_length_prefix() {
        let bytes = frame(&IpcMessage::PrioritizeStates(vec![EngineStateId(3)]));
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - FRAME_HEADER_LEN);
    }

    #[test]
    fn receives_back_to_back_frames() {
        let mut graph = Graph::new();
        graph.insert_edge(0, 1);
        let first = IpcMessage::GraphSnapshot {
            name: "basic blocks".to_string(),
            graph: graph.snapshot(),
        };
        let second = IpcMessage::PrioritizeStates(vec![EngineStateId(3), EngineStateId(42)]);

        let mut bytes = frame(&first);
        bytes.extend(frame(&second));
        let mut rx = IpcRx::new(Cursor::new(bytes));

        assert_eq!(rx.blocking_receive().expect("first"), first);
        assert_eq!(rx.blocking_receive().expect("second"), second);
        assert!(matches!(rx.poll_receive(), Err(IpcError::EndOfFile)));
    }

    #[test]
    fn partial_frames_survive_would_block() {
        let message = IpcMessage::PrioritizeStates(vec![EngineStateId(9)]);
        let bytes = frame(&message);
        let total = bytes.len();
        let mut rx = IpcRx::new(Trickle { bytes, pos: 0 });

        let mut received = None;
        for _ in 0..=total {
            if let Some(m) = rx.poll_receive().expect("poll") {
                received = Some(m);
                break;
            }
        }
        assert_eq!(received, Some(message));
        assert_eq!(rx.poll_receive().expect("poll"), None);
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocation() {
        let len = u32::try_from(MAX_FRAME_SIZE + 1).expect("fits");
        let mut rx = IpcRx::new(Cursor::new(len.to_le_bytes().to_vec()));
        assert!(matches!(rx.poll_receive(), Err(IpcError::FrameTooLarge(_))));
    }

    #[test]
    fn oversized_frame_abandons_the_stream() {
        let len = u32::try_from(MAX_FRAME_SIZE + 1).expect("fits");
        let mut bytes = len.to_le_bytes().to_vec();
        bytes.extend([0u8; 8]);
        bytes.extend(frame(&IpcMessage::PrioritizeStates(vec![EngineStateId(3)])));
        let mut rx = IpcRx::new(Cursor::new(bytes));

        assert!(matches!(rx.poll_receive(), Err(IpcError::FrameTooLarge(_))));
        assert!(matches!(rx.poll_receive(), Err(IpcError::Desynchronized)));

        // The trailing directive sits behind unframed bytes and is never
        // surfaced, nor are the payload bytes decoded as frames.
        let mut buffer = Vec::new();
        for _ in 0..10 {
            assert!(!rx.try_receive(&mut buffer));
        }
        assert!(buffer.is_empty());
        assert!(matches!(rx.poll_receive(), Err(IpcError::Desynchronized)));
    }

    #[test]
    fn reset_and_broken_pipe_count_as_disconnect() {
        assert!(IpcError::EndOfFile.is_disconnect());
        assert!(IpcError::Io(io::ErrorKind::ConnectionReset.into()).is_disconnect());
        assert!(IpcError::Io(io::ErrorKind::BrokenPipe.into()).is_disconnect());
        assert!(!IpcError::Io(io::ErrorKind::PermissionDenied.into()).is_disconnect());
        assert!(!IpcError::Desynchronized.is_disconnect());
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend([0xff, 0xff]);
        let mut rx = IpcRx::new(Cursor::new(bytes));
        assert!(matches!(rx.poll_receive(), Err(IpcError::Decode(_))));
    }

    #[test]
    fn directive_channel_fills_buffer_only_for_directives() {
        let mut bytes = frame(&IpcMessage::GraphSnapshot {
            name: "symbolic states".to_string(),
            graph: GraphSnapshot::default(),
        });
        bytes.extend(frame(&IpcMessage::PrioritizeStates(vec![
            EngineStateId(1),
            EngineStateId(2),
        ])));
        let mut rx = IpcRx::new(Cursor::new(bytes));
        let mut buffer = Vec::new();

        assert!(!rx.try_receive(&mut buffer));
        assert!(buffer.is_empty());
        assert!(rx.try_receive(&mut buffer));
        assert_eq!(buffer, vec![EngineStateId(1), EngineStateId(2)]);
        // EOF is "no message", not an error
        assert!(!rx.try_receive(&mut buffer));
    }

    #[cfg(unix)]
    #[test]
    fn socket_pair_round_trip_and_timeout() {
        let (a, b) = UnixStream::pair().expect("pair");
        let (mut tx, _) = split(a, Duration::from_millis(10)).expect("split a");
        let (_, mut rx) = split(b, Duration::from_millis(10)).expect("split b");

        // Nothing sent yet: the read times out.
        assert_eq!(rx.poll_receive().expect("poll"), None);

        let message = IpcMessage::PrioritizeStates(vec![EngineStateId(5)]);
        tx.blocking_send(&message).expect("send");
        assert_eq!(rx.blocking_receive().expect("receive"), message);
    }
}
