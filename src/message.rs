//! Short-message packing.
//!
//! A short message travels as one 32-bit word:
//!
//! | byte | input                | output                          |
//! |------|----------------------|---------------------------------|
//! | 0    | status               | status, or command \| channel   |
//! | 1    | data byte 1          | data byte 1                     |
//! | 2    | data byte 2          | data byte 2                     |
//! | 3    | unused               | unused                          |
//!
//! Packing and unpacking are pure and exact inverses.

use std::fmt;

use crate::error::{MidiError, Result};

/// Bit shift between consecutive bytes of a packed short message.
pub const SHORT_MSG_SHIFT: u32 = 8;

/// Mask selecting the channel nibble of a status byte.
pub const SHORT_MSG_MASK: u8 = 0x0F;

/// A packed short message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShortMessage(u32);

impl ShortMessage {
    /// Pack a status byte and two data bytes.
    pub fn pack(status: u8, data1: u8, data2: u8) -> Self {
        Self(
            u32::from(status)
                | u32::from(data1) << SHORT_MSG_SHIFT
                | u32::from(data2) << (SHORT_MSG_SHIFT * 2),
        )
    }

    /// Pack a channel message from its command nibble and channel.
    ///
    /// `command` must have a zero low nibble (e.g. `0x90` for note-on) and
    /// `channel` must be in `0..16`.
    pub fn pack_channel(command: u8, channel: u8, data1: u8, data2: u8) -> Result<Self> {
        if command & SHORT_MSG_MASK != 0 {
            return Err(MidiError::InvalidMessage(format!(
                "command byte {command:#04x} overlaps the channel nibble"
            )));
        }
        if channel > SHORT_MSG_MASK {
            return Err(MidiError::InvalidMessage(format!(
                "channel {channel} out of range 0-15"
            )));
        }
        Ok(Self::pack(command | channel, data1, data2))
    }

    /// Wrap a raw packed word as delivered by the driver.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw packed word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Status byte (byte 0).
    pub fn status(self) -> u8 {
        self.0 as u8
    }

    /// Command nibble of the status byte.
    pub fn command(self) -> u8 {
        self.status() & !SHORT_MSG_MASK
    }

    /// Channel nibble of the status byte.
    pub fn channel(self) -> u8 {
        self.status() & SHORT_MSG_MASK
    }

    /// First data byte.
    pub fn data1(self) -> u8 {
        (self.0 >> SHORT_MSG_SHIFT) as u8
    }

    /// Second data byte.
    pub fn data2(self) -> u8 {
        (self.0 >> (SHORT_MSG_SHIFT * 2)) as u8
    }

    /// Unpack into `(status, data1, data2)`.
    pub fn unpack(self) -> (u8, u8, u8) {
        (self.status(), self.data1(), self.data2())
    }

    /// Unpack into `(command, channel, data1, data2)`.
    pub fn unpack_channel(self) -> (u8, u8, u8, u8) {
        (self.command(), self.channel(), self.data1(), self.data2())
    }
}

impl From<ShortMessage> for u32 {
    fn from(message: ShortMessage) -> Self {
        message.0
    }
}

impl fmt::Display for ShortMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X} {:02X} {:02X}",
            self.status(),
            self.data1(),
            self.data2()
        )
    }
}
