// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for bridge fragments.
//!
//! A serialized bridge message is cut into one or more fragments:
//! - 4 bytes: message id (big-endian, random per message)
//! - 2 bytes: total fragment count
//! - 2 bytes: index of this fragment
//! - N bytes: slice of the serialized message
//!
//! On a stream transport every fragment is additionally prefixed with its
//! own 4-byte big-endian length.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

/// Fragment header size (4 bytes message id + 2 bytes count + 2 bytes index)
pub const FRAGMENT_HEADER_SIZE: usize = 8;

/// Default payload bytes carried by a single fragment (32 KiB)
pub const DEFAULT_FRAGMENT_PAYLOAD: usize = 32 * 1024;

/// Maximum encoded fragment accepted from a stream (1 MiB)
pub const MAX_WIRE_FRAGMENT_SIZE: usize = 1024 * 1024;

/// Default idle bound after which an incomplete window is discarded
pub const DEFAULT_WINDOW_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur during fragment encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("fragment too large: {0} bytes (max: {MAX_WIRE_FRAGMENT_SIZE})")]
    FragmentTooLarge(usize),

    #[error("message needs {0} fragments (max: {max})", max = u16::MAX)]
    TooManyFragments(usize),

    #[error("invalid fragment {index} of {count} for message {message_id}")]
    InvalidIndex {
        message_id: u32,
        index: u16,
        count: u16,
    },

    #[error("fragment count changed for message {message_id}: {expected} then {actual}")]
    CountMismatch {
        message_id: u32,
        expected: u16,
        actual: u16,
    },

    #[error("incomplete fragment header")]
    IncompleteHeader,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// One size-bounded piece of a serialized message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: u32,
    pub count: u16,
    pub index: u16,
    pub payload: Bytes,
}

impl Fragment {
    /// Encode the fragment to bytes (header + payload, no length prefix)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.message_id);
        buf.put_u16(self.count);
        buf.put_u16(self.index);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a fragment from bytes produced by [`Fragment::encode`]
    pub fn decode(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(FrameError::IncompleteHeader);
        }

        let message_id = bytes.get_u32();
        let count = bytes.get_u16();
        let index = bytes.get_u16();

        if count == 0 || index >= count {
            return Err(FrameError::InvalidIndex {
                message_id,
                index,
                count,
            });
        }

        Ok(Self {
            message_id,
            count,
            index,
            payload: bytes,
        })
    }

    pub fn is_single(&self) -> bool {
        self.count == 1
    }
}

/// Split serialized bytes into fragments of at most `max_payload` bytes.
///
/// An empty input still yields one (empty) fragment.
pub fn split(message_id: u32, data: Bytes, max_payload: usize) -> Result<Vec<Fragment>, FrameError> {
    let max_payload = max_payload.max(1);
    let needed = data.len().div_ceil(max_payload).max(1);
    if needed > u16::MAX as usize {
        return Err(FrameError::TooManyFragments(needed));
    }
    let count = needed as u16;

    let mut fragments = Vec::with_capacity(needed);
    let mut rest = data;
    for index in 0..count {
        let take = rest.len().min(max_payload);
        fragments.push(Fragment {
            message_id,
            count,
            index,
            payload: rest.split_to(take),
        });
    }
    Ok(fragments)
}

struct Window {
    parts: Vec<Option<Bytes>>,
    received: usize,
    last_seen: Instant,
}

/// Reassembly buffers keyed by message id.
///
/// A message is only emitted once every index `0..count` is present. Its
/// window is dropped on emission, or once it has been idle longer than the
/// configured timeout.
pub struct Reassembler {
    windows: HashMap<u32, Window>,
    idle_timeout: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_TIMEOUT)
    }
}

impl Reassembler {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            windows: HashMap::new(),
            idle_timeout,
        }
    }

    /// Accept a fragment, returning the joined message once complete.
    pub fn push(&mut self, fragment: Fragment) -> Result<Option<Bytes>, FrameError> {
        self.push_at(fragment, Instant::now())
    }

    /// Like [`Reassembler::push`] with an explicit clock reading.
    pub fn push_at(&mut self, fragment: Fragment, now: Instant) -> Result<Option<Bytes>, FrameError> {
        self.evict_stale(now);

        if fragment.count == 0 || fragment.index >= fragment.count {
            return Err(FrameError::InvalidIndex {
                message_id: fragment.message_id,
                index: fragment.index,
                count: fragment.count,
            });
        }

        if fragment.is_single() {
            return Ok(Some(fragment.payload));
        }

        let window = self
            .windows
            .entry(fragment.message_id)
            .or_insert_with(|| Window {
                parts: vec![None; fragment.count as usize],
                received: 0,
                last_seen: now,
            });

        if window.parts.len() != fragment.count as usize {
            let expected = window.parts.len() as u16;
            self.windows.remove(&fragment.message_id);
            return Err(FrameError::CountMismatch {
                message_id: fragment.message_id,
                expected,
                actual: fragment.count,
            });
        }

        let slot = &mut window.parts[fragment.index as usize];
        if slot.is_none() {
            window.received += 1;
        }
        *slot = Some(fragment.payload);
        window.last_seen = now;

        if window.received < window.parts.len() {
            return Ok(None);
        }

        let Some(window) = self.windows.remove(&fragment.message_id) else {
            return Ok(None);
        };
        let total = window.parts.iter().flatten().map(Bytes::len).sum();
        let mut joined = BytesMut::with_capacity(total);
        for part in window.parts.into_iter().flatten() {
            joined.put(part);
        }
        Ok(Some(joined.freeze()))
    }

    /// Drop windows idle for longer than the timeout. Returns how many were dropped.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.windows.len();
        let timeout = self.idle_timeout;
        self.windows.retain(|message_id, window| {
            let keep = now.saturating_duration_since(window.last_seen) <= timeout;
            if !keep {
                debug!(
                    message_id,
                    received = window.received,
                    expected = window.parts.len(),
                    "discarding stale fragment window"
                );
            }
            keep
        });
        before - self.windows.len()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Number of incomplete windows currently buffered
    pub fn pending(&self) -> usize {
        self.windows.len()
    }
}

/// Write a length-prefixed fragment to an async writer
pub async fn write_fragment<W: AsyncWrite + Unpin>(
    writer: &mut W,
    fragment: &Fragment,
) -> Result<(), FrameError> {
    let encoded = fragment.encode();
    if encoded.len() > MAX_WIRE_FRAGMENT_SIZE {
        return Err(FrameError::FragmentTooLarge(encoded.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + encoded.len());
    buf.put_u32(encoded.len() as u32);
    buf.put(encoded);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read a length-prefixed fragment from an async reader
pub async fn read_fragment<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Fragment, FrameError> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(prefix) as usize;
    if length > MAX_WIRE_FRAGMENT_SIZE {
        return Err(FrameError::FragmentTooLarge(length));
    }
    if length < FRAGMENT_HEADER_SIZE {
        return Err(FrameError::IncompleteHeader);
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Fragment::decode(Bytes::from(body))
}

/// Framed codec for reading and writing fragments on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next fragment from the stream
    pub async fn read_fragment(&mut self) -> Result<Fragment, FrameError> {
        read_fragment(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a fragment to the stream
    pub async fn write_fragment(&mut self, fragment: &Fragment) -> Result<(), FrameError> {
        write_fragment(&mut self.stream, fragment).await
    }

    /// Write every fragment of one message, in order
    pub async fn write_all(&mut self, fragments: &[Fragment]) -> Result<(), FrameError> {
        for fragment in fragments {
            write_fragment(&mut self.stream, fragment).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments_of(len: usize, max: usize) -> Vec<Fragment> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        split(7, Bytes::from(data), max).unwrap()
    }

    #[test]
    fn test_header_size_constant() {
        assert_eq!(FRAGMENT_HEADER_SIZE, 8);
    }

    #[test]
    fn test_fragment_encode_layout() {
        let fragment = Fragment {
            message_id: 0x0102_0304,
            count: 3,
            index: 1,
            payload: Bytes::from_static(b"abc"),
        };
        let encoded = fragment.encode();
        assert_eq!(&encoded[..], &[1, 2, 3, 4, 0, 3, 0, 1, b'a', b'b', b'c']);
        assert_eq!(Fragment::decode(encoded).unwrap(), fragment);
    }

    #[test]
    fn test_decode_rejects_short_header() {
        let result = Fragment::decode(Bytes::from_static(&[0, 0, 0, 1, 0]));
        assert!(matches!(result, Err(FrameError::IncompleteHeader)));
    }

    #[test]
    fn test_decode_rejects_index_out_of_range() {
        let result = Fragment::decode(Bytes::from_static(&[0, 0, 0, 1, 0, 2, 0, 2]));
        assert!(matches!(
            result,
            Err(FrameError::InvalidIndex { index: 2, count: 2, .. })
        ));
    }

    #[test]
    fn test_split_empty_yields_single_fragment() {
        let fragments = split(1, Bytes::new(), 16).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].count, 1);
        assert!(fragments[0].payload.is_empty());
    }

    #[test]
    fn test_split_exact_multiple() {
        let fragments = fragments_of(64, 16);
        assert_eq!(fragments.len(), 4);
        assert!(fragments.iter().all(|f| f.payload.len() == 16 && f.count == 4));
    }

    #[test]
    fn test_split_remainder() {
        let fragments = fragments_of(70, 16);
        assert_eq!(fragments.len(), 5);
        assert_eq!(fragments[4].payload.len(), 6);
    }

    #[test]
    fn test_split_too_many_fragments() {
        let data = Bytes::from(vec![0u8; u16::MAX as usize + 1]);
        assert!(matches!(
            split(1, data, 1),
            Err(FrameError::TooManyFragments(_))
        ));
    }

    #[test]
    fn test_reassemble_in_order() {
        let fragments = fragments_of(100, 30);
        let mut reassembler = Reassembler::default();
        let mut out = None;
        for fragment in fragments {
            out = reassembler.push(fragment).unwrap();
        }
        let joined = out.unwrap();
        assert_eq!(joined.len(), 100);
        assert_eq!(joined[99], (99 % 251) as u8);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let mut fragments = fragments_of(100, 30);
        fragments.reverse();
        fragments.swap(1, 2);
        let mut reassembler = Reassembler::default();
        let results: Vec<_> = fragments
            .into_iter()
            .map(|f| reassembler.push(f).unwrap())
            .collect();
        assert!(results[..3].iter().all(Option::is_none));
        let joined = results[3].clone().unwrap();
        let expected: Vec<u8> = (0..100).map(|i| (i % 251) as u8).collect();
        assert_eq!(&joined[..], &expected[..]);
    }

    #[test]
    fn test_duplicate_fragment_does_not_complete_window() {
        let fragments = fragments_of(40, 20);
        let mut reassembler = Reassembler::default();
        assert!(reassembler.push(fragments[0].clone()).unwrap().is_none());
        assert!(reassembler.push(fragments[0].clone()).unwrap().is_none());
        assert_eq!(reassembler.pending(), 1);
        assert!(reassembler.push(fragments[1].clone()).unwrap().is_some());
    }

    #[test]
    fn test_interleaved_messages() {
        let a = split(1, Bytes::from_static(b"aaaabbbb"), 4).unwrap();
        let b = split(2, Bytes::from_static(b"ccccdddd"), 4).unwrap();
        let mut reassembler = Reassembler::default();
        assert!(reassembler.push(a[0].clone()).unwrap().is_none());
        assert!(reassembler.push(b[1].clone()).unwrap().is_none());
        assert_eq!(reassembler.pending(), 2);
        assert_eq!(
            reassembler.push(b[0].clone()).unwrap().unwrap(),
            Bytes::from_static(b"ccccdddd")
        );
        assert_eq!(
            reassembler.push(a[1].clone()).unwrap().unwrap(),
            Bytes::from_static(b"aaaabbbb")
        );
    }

    #[test]
    fn test_count_mismatch_discards_window() {
        let mut reassembler = Reassembler::default();
        let first = Fragment {
            message_id: 9,
            count: 3,
            index: 0,
            payload: Bytes::from_static(b"x"),
        };
        let conflicting = Fragment {
            count: 2,
            index: 1,
            ..first.clone()
        };
        reassembler.push(first).unwrap();
        assert!(matches!(
            reassembler.push(conflicting),
            Err(FrameError::CountMismatch { expected: 3, actual: 2, .. })
        ));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_stale_window_evicted() {
        let fragments = fragments_of(40, 20);
        let mut reassembler = Reassembler::new(Duration::from_secs(10));
        let start = Instant::now();
        reassembler.push_at(fragments[0].clone(), start).unwrap();
        assert_eq!(reassembler.pending(), 1);

        assert_eq!(reassembler.evict_stale(start + Duration::from_secs(5)), 0);
        assert_eq!(reassembler.evict_stale(start + Duration::from_secs(11)), 1);
        assert_eq!(reassembler.pending(), 0);

        // The late fragment opens a fresh window instead of completing the old one.
        let late = reassembler
            .push_at(fragments[1].clone(), start + Duration::from_secs(12))
            .unwrap();
        assert!(late.is_none());
        assert_eq!(reassembler.pending(), 1);
    }

    #[tokio::test]
    async fn test_write_read_fragment_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let fragment = Fragment {
            message_id: 42,
            count: 2,
            index: 1,
            payload: Bytes::from_static(b"hello"),
        };
        write_fragment(&mut client, &fragment).await.unwrap();
        let read = read_fragment(&mut server).await.unwrap();
        assert_eq!(read, fragment);
    }

    #[tokio::test]
    async fn test_read_fragment_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let result = read_fragment(&mut server).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_fragment_rejects_oversized_prefix() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_WIRE_FRAGMENT_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let result = read_fragment(&mut server).await;
        assert!(matches!(result, Err(FrameError::FragmentTooLarge(_))));
    }

    #[tokio::test]
    async fn test_framed_stream_write_all() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedStream::new(client);
        let mut reader = FramedStream::new(server);
        let fragments = fragments_of(50, 20);
        writer.write_all(&fragments).await.unwrap();

        let mut reassembler = Reassembler::default();
        let mut joined = None;
        for _ in 0..fragments.len() {
            joined = reassembler.push(reader.read_fragment().await.unwrap()).unwrap();
        }
        assert_eq!(joined.unwrap().len(), 50);
    }
}
