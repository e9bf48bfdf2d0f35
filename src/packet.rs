//! Fixed-capacity packet buffer.
//!
//! All over-the-air frames are built in and parsed from a [`Packet`]: a byte
//! array of the maximum frame size with a write cursor (`size`) and a read
//! cursor (`start`). `put`/`get` are range checked; a failed check means a
//! protocol element was sized wrong and the current phase must be aborted.

use crate::radio::{Radio, RecvError, RecvInfo};
use crate::time::LocalTime;
use crc_0x8810::CRC_16_LORA;
use thiserror::Error;

/// Maximum frame payload carried by the radio, excluding the trailing 2-byte
/// CRC handled at the physical layer.
pub const MAX_PACKET_SIZE: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet overflow: {left} bytes left, {need} needed")]
    Overflow { left: usize, need: usize },
    #[error("packet underflow: {available} bytes available, {need} needed")]
    Underflow { available: usize, need: usize },
}

#[derive(Debug, Clone)]
pub struct Packet {
    data: [u8; MAX_PACKET_SIZE],
    size: usize,
    start: usize,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    pub const fn new() -> Self {
        Packet {
            data: [0; MAX_PACKET_SIZE],
            size: 0,
            start: 0,
        }
    }

    pub fn clear(&mut self) {
        self.size = 0;
        self.start = 0;
    }

    /// Bytes written and not yet consumed.
    pub fn size(&self) -> usize {
        self.size - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub const fn max_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    /// Space left for `put`.
    pub fn available(&self) -> usize {
        MAX_PACKET_SIZE - self.size
    }

    pub fn put(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        let left = self.available();
        if bytes.len() > left {
            return Err(PacketError::Overflow {
                left,
                need: bytes.len(),
            });
        }
        self.data[self.size..self.size + bytes.len()].copy_from_slice(bytes);
        self.size += bytes.len();
        Ok(())
    }

    pub fn get(&mut self, out: &mut [u8]) -> Result<(), PacketError> {
        let available = self.size();
        if out.len() > available {
            return Err(PacketError::Underflow {
                available,
                need: out.len(),
            });
        }
        out.copy_from_slice(&self.data[self.start..self.start + out.len()]);
        self.start += out.len();
        Ok(())
    }

    /// Consume and return exactly `N` bytes.
    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        self.get(&mut out)?;
        Ok(out)
    }

    /// Read a byte at an absolute position without consuming it.
    ///
    /// Panics if `index` is past the written area; out-of-range access is a
    /// serialization bug, not a runtime condition.
    pub fn at(&self, index: usize) -> u8 {
        assert!(index < self.size, "Packet::at: index {index} >= size {}", self.size);
        self.data[index]
    }

    pub fn set_at(&mut self, index: usize, value: u8) {
        assert!(index < self.size, "Packet::set_at: index {index} >= size {}", self.size);
        self.data[index] = value;
    }

    /// The written bytes, including any already consumed by `get`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// CCITT checksum of the written bytes, for software CRC verification
    /// when the transceiver's hardware check is disabled.
    pub fn checksum(&self) -> u16 {
        CRC_16_LORA.checksum(self.as_bytes())
    }

    /// Transmit the written bytes at the absolute local time `when`.
    pub fn send(&self, radio: &mut dyn Radio, when: LocalTime) {
        radio.send_at(self.as_bytes(), when);
    }

    /// Fill this packet from the radio. On success the read cursor is at the
    /// beginning of the frame.
    pub fn recv(
        &mut self,
        radio: &mut dyn Radio,
        deadline: LocalTime,
    ) -> Result<RecvInfo, RecvError> {
        self.clear();
        let info = radio.recv(&mut self.data, deadline)?;
        self.size = info.size;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trip() {
        let mut p = Packet::new();
        p.put(&[1, 2, 3, 4]).unwrap();
        assert_eq!(p.size(), 4);
        let mut out = [0u8; 2];
        p.get(&mut out).unwrap();
        assert_eq!(out, [1, 2]);
        assert_eq!(p.size(), 2);
        assert_eq!(p.get_array::<2>().unwrap(), [3, 4]);
        assert_eq!(p.size(), 0);
    }

    #[test]
    fn overflow_reports_sizes() {
        let mut p = Packet::new();
        p.put(&[0u8; MAX_PACKET_SIZE]).unwrap();
        assert_eq!(
            p.put(&[0u8; 2]),
            Err(PacketError::Overflow { left: 0, need: 2 })
        );
    }

    #[test]
    fn underflow_reports_sizes() {
        let mut p = Packet::new();
        p.put(&[9]).unwrap();
        let mut out = [0u8; 3];
        assert_eq!(
            p.get(&mut out),
            Err(PacketError::Underflow {
                available: 1,
                need: 3
            })
        );
    }

    #[test]
    fn clear_resets_cursors() {
        let mut p = Packet::new();
        p.put(&[1, 2, 3]).unwrap();
        p.clear();
        assert_eq!(p.size(), 0);
        assert_eq!(p.available(), MAX_PACKET_SIZE);
    }
}
