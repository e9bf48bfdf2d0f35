//! Radio abstraction.
//!
//! The physical transceiver is an external collaborator; the MAC drives it
//! through this trait. Timestamps are in the node's local clock domain, the
//! protocol code converts them to network time where needed.

use crate::time::LocalTime;
use thiserror::Error;

/// Transceiver configuration applied before each send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioConfiguration {
    pub frequency_khz: u32,
    pub tx_power_dbm: i8,
    /// Hardware CRC check of received frames.
    pub crc: bool,
    /// With `strict_timeout` false the receive window is extended to finish
    /// receiving a frame whose preamble has already arrived at the deadline.
    pub strict_timeout: bool,
}

impl RadioConfiguration {
    pub const fn with_timeout(self, strict_timeout: bool) -> Self {
        Self {
            strict_timeout,
            ..self
        }
    }
}

/// Metadata of a successfully received frame.
#[derive(Debug, Clone, Copy)]
pub struct RecvInfo {
    /// Local time at which the start-of-frame delimiter was detected.
    pub timestamp: LocalTime,
    pub rssi: i8,
    /// Number of payload bytes written into the caller's buffer.
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("receive deadline reached")]
    Timeout,
    #[error("frame longer than receive buffer")]
    TooLong,
    #[error("hardware CRC check failed")]
    CrcFail,
    #[error("transceiver not initialized")]
    Uninitialized,
}

/// The transceiver operations the MAC relies on.
pub trait Radio: Send {
    fn configure(&mut self, cfg: RadioConfiguration);

    fn turn_on(&mut self);

    fn turn_off(&mut self);

    /// Low-power state that keeps the configuration loaded.
    fn idle(&mut self);

    /// Transmit `frame` so that the start-of-frame delimiter goes on air
    /// exactly at the absolute local time `when`.
    fn send_at(&mut self, frame: &[u8], when: LocalTime);

    /// Listen until a frame arrives or the absolute local `deadline` passes.
    /// `LocalTime::FAR_FUTURE` waits forever.
    fn recv(&mut self, buf: &mut [u8], deadline: LocalTime) -> Result<RecvInfo, RecvError>;
}
