//! Delimiter framing for inbound byte streams.
//!
//! The framer drains a readable socket in `chunk_size` reads until it
//! would block, turning the accumulated bytes into text messages as
//! delimiters show up. Two policies exist:
//!
//! - [`FramingMode::Coalesce`]: once a read brings a delimiter into the
//!   buffer, the whole buffer is one message with delimiter characters
//!   trimmed from both ends. Several lines arriving together stay together.
//! - [`FramingMode::Split`]: every delimiter-terminated segment is its own
//!   message and an unterminated tail waits for the next read.
//!
//! Unterminated data is bounded by `max_frame_bytes`. One call reads at most
//! `max_frame_bytes` bytes or [`MAX_MESSAGES_PER_READ`] messages, so a peer
//! streaming short lines cannot monopolize the loop; the caller comes back
//! for the rest when [`ReadResult::more`] is set.

use crate::config::FramingMode;
use crate::error::{DisconnectReason, Error, Result};
use bytes::{Buf, BytesMut};
use std::io::{self, Read};

/// Message cap for a single [`Framer::read_from`] call.
pub const MAX_MESSAGES_PER_READ: usize = 1024;

/// Outcome of draining one readable socket.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadResult {
    /// Complete messages in arrival order. May contain empty strings.
    pub messages: Vec<String>,
    /// Bytes pulled off the socket.
    pub bytes_read: usize,
    /// Set when the connection must be dropped after `messages` are handled.
    pub disconnect: Option<DisconnectReason>,
    /// The read budget ran out before the socket would block.
    pub more: bool,
}

/// Splits inbound bytes into delimiter-bounded messages.
#[derive(Debug)]
pub struct Framer {
    delimiter: Vec<u8>,
    mode: FramingMode,
    max_frame_bytes: usize,
    chunk: Vec<u8>,
}

impl Framer {
    /// Fails on an empty delimiter, a zero chunk size, or a frame ceiling
    /// smaller than one chunk.
    pub fn new(
        delimiter: &str,
        mode: FramingMode,
        chunk_size: usize,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        if delimiter.is_empty() {
            return Err(Error::InvalidConfig("delimiter must not be empty".into()));
        }
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".into()));
        }
        if max_frame_bytes < chunk_size {
            return Err(Error::InvalidConfig(format!(
                "max_frame_bytes ({max_frame_bytes}) must be at least chunk_size ({chunk_size})"
            )));
        }

        Ok(Self {
            delimiter: delimiter.as_bytes().to_vec(),
            mode,
            max_frame_bytes,
            chunk: vec![0u8; chunk_size],
        })
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Read from `src` until it would block or the budget is spent, framing
    /// into `buf`.
    ///
    /// A zero-length read reports `PeerClosed`; bytes that never saw a
    /// delimiter are dropped with the connection.
    pub fn read_from<R: Read>(&mut self, src: &mut R, buf: &mut BytesMut) -> ReadResult {
        let mut result = ReadResult::default();

        loop {
            let n = match src.read(&mut self.chunk) {
                Ok(0) => {
                    result.disconnect = Some(DisconnectReason::PeerClosed);
                    return result;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return result,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) => {
                    result.disconnect = Some(DisconnectReason::from(e));
                    return result;
                }
            };

            // A delimiter may straddle the previous chunk boundary
            let scan_from = buf.len().saturating_sub(self.delimiter.len() - 1);
            result.bytes_read += n;
            buf.extend_from_slice(&self.chunk[..n]);

            if let Err(reason) = self.extract_from(buf, scan_from, &mut result.messages) {
                result.disconnect = Some(reason);
                return result;
            }

            if buf.len() > self.max_frame_bytes {
                result.disconnect = Some(DisconnectReason::FrameTooLarge);
                return result;
            }

            if result.bytes_read >= self.max_frame_bytes
                || result.messages.len() >= MAX_MESSAGES_PER_READ
            {
                result.more = true;
                return result;
            }
        }
    }

    /// Move every complete message out of `buf`.
    pub fn extract(
        &self,
        buf: &mut BytesMut,
        messages: &mut Vec<String>,
    ) -> std::result::Result<(), DisconnectReason> {
        self.extract_from(buf, 0, messages)
    }

    /// Like [`extract`](Self::extract), but `buf[..scan_from]` is known to
    /// hold no delimiter.
    fn extract_from(
        &self,
        buf: &mut BytesMut,
        mut scan_from: usize,
        messages: &mut Vec<String>,
    ) -> std::result::Result<(), DisconnectReason> {
        match self.mode {
            FramingMode::Coalesce => {
                if find(buf, &self.delimiter, scan_from).is_some() {
                    let frame = buf.split();
                    messages.push(decode(self.trim(&frame))?);
                }
            }
            FramingMode::Split => {
                while let Some(pos) = find(buf, &self.delimiter, scan_from) {
                    let frame = buf.split_to(pos);
                    buf.advance(self.delimiter.len());
                    messages.push(decode(&frame)?);
                    scan_from = 0;
                }
            }
        }
        Ok(())
    }

    /// Trim delimiter characters off both ends.
    fn trim<'a>(&self, mut frame: &'a [u8]) -> &'a [u8] {
        while let Some((first, rest)) = frame.split_first() {
            if !self.delimiter.contains(first) {
                break;
            }
            frame = rest;
        }
        while let Some((last, rest)) = frame.split_last() {
            if !self.delimiter.contains(last) {
                break;
            }
            frame = rest;
        }
        frame
    }
}

fn decode(frame: &[u8]) -> std::result::Result<String, DisconnectReason> {
    String::from_utf8(frame.to_vec()).map_err(|_| DisconnectReason::InvalidUtf8)
}

/// Position of the first occurrence of `needle` in `haystack` at or after
/// `from`.
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
