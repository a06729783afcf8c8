//! Receive side of the frame codec.
//!
//! Bytes read from the K-line are staged in a [`ReceiveBuffer`] and consumed
//! from the front as frames are recognised. A frame that cannot be parsed at
//! the front of the buffer is resolved by the caller dropping a single byte
//! and scanning again.

use tracing::{debug, warn};

use super::constants::*;
use super::message::{Message, checksum};

/// Frames the receive buffer can hold before new bytes are dropped
pub const RECEIVE_BUFFER_FRAMES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("{needed} more bytes are needed to complete the frame")]
    NotEnoughData { needed: usize },
    #[error("given checksum does not match frame contents")]
    InvalidChecksum,
    #[error("frame is longer than the maximum frame size")]
    RequestedTooMuchData,
    #[error("frame contains no data bytes")]
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequirements {
    /// Format byte, optional address bytes and optional length byte
    pub header_len: usize,
    pub mode: AddressMode,
    /// Service id and data bytes
    pub data_len: usize,
    pub checksum_len: usize,
}

impl FrameRequirements {
    pub fn total(&self) -> usize {
        self.header_len + self.data_len + self.checksum_len
    }
}

/// Works out the shape of the frame starting at `offset`.
///
/// When the length lives in a separate length byte that has not arrived yet
/// the data length is reported as zero.
pub fn requirements(buffer: &[u8], offset: usize) -> Option<FrameRequirements> {
    let format = *buffer.get(offset)?;
    let mode = AddressMode::from_format(format);
    let mut header_len = if mode.has_addresses() { 3 } else { 1 };
    let mut data_len = (format & SHORT_DATA_LENGTH as u8) as usize;

    if data_len == 0 {
        data_len = buffer.get(offset + header_len).copied().unwrap_or(0) as usize;
        header_len += 1;
    }

    Some(FrameRequirements {
        header_len,
        mode,
        data_len,
        checksum_len: 1,
    })
}

/// Parses the frame at `offset`, returning it with the number of bytes from
/// the start of `buffer` it ends at.
///
/// Frames without address bytes are taken to be from `ecu_address` to the tester.
pub fn parse_frame(
    buffer: &[u8],
    offset: usize,
    ecu_address: u8,
) -> Result<(Message, usize), FrameError> {
    let available = buffer.len().saturating_sub(offset);
    let requirements =
        requirements(buffer, offset).ok_or(FrameError::NotEnoughData { needed: 1 })?;

    if available < requirements.header_len {
        return Err(FrameError::NotEnoughData {
            needed: requirements.header_len - available,
        });
    }

    if requirements.data_len == 0 {
        return Err(FrameError::NoData);
    }

    let total = requirements.total();
    if total > MAX_FRAME_LENGTH {
        return Err(FrameError::RequestedTooMuchData);
    }

    if available < total {
        return Err(FrameError::NotEnoughData {
            needed: total - available,
        });
    }

    let frame = &buffer[offset..offset + total];
    let (body, given) = frame.split_at(total - 1);
    if checksum(body) != given[0] {
        return Err(FrameError::InvalidChecksum);
    }

    let (target, source) = if requirements.mode.has_addresses() {
        (frame[1], frame[2])
    } else {
        (TESTER_ADDRESS, ecu_address)
    };

    let data = &body[requirements.header_len..];
    let message = Message::new(requirements.mode, source, target, data[0], data[1..].to_vec())?;

    Ok((message, offset + total))
}

#[derive(Debug)]
pub struct ReceiveBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    dirty: bool,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::with_capacity(RECEIVE_BUFFER_FRAMES * MAX_FRAME_LENGTH)
    }
}

impl ReceiveBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn free_space(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    /// True when there are unconsumed bytes worth scanning again
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Appends as many bytes as fit, returning how many were dropped.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let fit = bytes.len().min(self.free_space());
        if fit > 0 {
            self.bytes.extend_from_slice(&bytes[..fit]);
            self.dirty = true;
        }

        let dropped = bytes.len() - fit;
        if dropped > 0 {
            warn!(dropped, "receive buffer full, dropping bytes");
        }
        dropped
    }

    pub fn remove_front(&mut self, count: usize, mark_dirty: bool) {
        let count = count.min(self.bytes.len());
        self.bytes.drain(..count);
        if mark_dirty && !self.bytes.is_empty() {
            self.dirty = true;
        }
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.dirty = false;
    }

    /// Parses the frame at `offset`, removing it and everything before it on success.
    pub fn take_frame(&mut self, offset: usize, ecu_address: u8) -> Result<Message, FrameError> {
        let (message, consumed) = parse_frame(&self.bytes, offset, ecu_address)?;
        self.remove_front(consumed, true);
        Ok(message)
    }
}

/// Tracks the reflection of transmitted bytes on the single wire bus.
#[derive(Debug, Default)]
pub struct EchoTracker {
    /// Garbage bytes from the handshake that arrive before the echo
    ignore: usize,
    outstanding: Option<Vec<u8>>,
}

impl EchoTracker {
    /// No new message may be transmitted while this is true
    pub fn is_outstanding(&self) -> bool {
        self.ignore > 0 || self.outstanding.is_some()
    }

    pub fn expect(&mut self, preceding: usize, sent: &[u8]) {
        self.ignore = preceding;
        self.outstanding = (!sent.is_empty()).then(|| sent.to_vec());
    }

    pub fn clear(&mut self) {
        self.ignore = 0;
        self.outstanding = None;
    }

    /// Removes as much of the expected echo from the front of `buffer` as has
    /// arrived.
    ///
    /// Returns false when a received byte did not match, in which case echo
    /// tracking is given up until the next transmit. Always true when
    /// consumption is disabled.
    pub fn consume(&mut self, buffer: &mut ReceiveBuffer, enabled: bool) -> bool {
        let mut found = !enabled;

        if buffer.is_empty() || !self.is_outstanding() || !enabled {
            return found;
        }

        let outstanding = self.outstanding.as_deref().unwrap_or_default();
        let expected_total = self.ignore + outstanding.len();
        let available = buffer.len().min(expected_total);
        let mut matched = available;
        found = true;

        for x in self.ignore..available {
            if buffer.as_slice()[x] != outstanding[x - self.ignore] {
                matched = x;
                found = false;
                break;
            }
        }

        if !found {
            debug!(
                expected = ?outstanding,
                read = ?&buffer.as_slice()[..available],
                ignored = self.ignore,
                "echo did not match sent bytes"
            );
            self.clear();
        }

        buffer.remove_front(matched, false);

        if found {
            if matched > self.ignore {
                let echoed = matched - self.ignore;
                self.ignore = 0;
                self.outstanding = self
                    .outstanding
                    .take()
                    .map(|bytes| bytes[echoed..].to_vec())
                    .filter(|rest| !rest.is_empty());
            } else {
                self.ignore -= matched;
            }
        }

        found
    }
}
