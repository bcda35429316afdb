use shared::error::{Error, Result};

use crate::proto::channum::ChannelNumber;

/// Size of the CHANNEL-DATA header: channel number and length, both u16.
pub const CHANNEL_DATA_HEADER_SIZE: usize = 4;
/// Largest application payload a CHANNEL-DATA message can carry.
pub const MAX_CHANNEL_DATA_LENGTH: usize = u16::MAX as usize;

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// A CHANNEL-DATA message (RFC 5766 §11.5):
///
/// ```text
/// [u16 channel number][u16 length][payload][0..3 pad on stream transports]
/// ```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub number: ChannelNumber,
    pub data: Vec<u8>,
    pub raw: Vec<u8>,
}

impl ChannelData {
    /// Encodes into `raw`. Stream transports pad the message to a 4-byte
    /// boundary; datagram transports send it unpadded.
    pub fn encode(&mut self, stream: bool) -> Result<()> {
        if self.data.len() > MAX_CHANNEL_DATA_LENGTH {
            return Err(Error::ErrPacketTooBig);
        }
        if !self.number.is_valid() {
            return Err(Error::ErrInvalidChannelNumber);
        }

        let total = if stream {
            CHANNEL_DATA_HEADER_SIZE + padded(self.data.len())
        } else {
            CHANNEL_DATA_HEADER_SIZE + self.data.len()
        };

        self.raw.clear();
        self.raw.reserve(total);
        self.raw.extend_from_slice(&self.number.0.to_be_bytes());
        self.raw
            .extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        self.raw.extend_from_slice(&self.data);
        self.raw.resize(total, 0);
        Ok(())
    }

    /// Decodes from `raw`, tolerating trailing stream padding. The declared
    /// length must be covered by the buffer.
    pub fn decode(&mut self) -> Result<()> {
        if self.raw.len() < CHANNEL_DATA_HEADER_SIZE {
            return Err(Error::ErrShortBuffer);
        }

        self.number = ChannelNumber(u16::from_be_bytes([self.raw[0], self.raw[1]]));
        if !self.number.is_valid() {
            return Err(Error::ErrInvalidChannelNumber);
        }

        let length = u16::from_be_bytes([self.raw[2], self.raw[3]]) as usize;
        if self.raw.len() < CHANNEL_DATA_HEADER_SIZE + length {
            return Err(Error::ErrBadChannelDataLength);
        }

        self.data = self.raw[CHANNEL_DATA_HEADER_SIZE..CHANNEL_DATA_HEADER_SIZE + length].to_vec();
        Ok(())
    }

    /// Cheap first-bytes test: channel numbers occupy 0x4000..=0x7FFF, which
    /// is disjoint from both the STUN leading bits and common media ranges.
    pub fn is_channel_data(buf: &[u8]) -> bool {
        if buf.len() < CHANNEL_DATA_HEADER_SIZE {
            return false;
        }
        let number = ChannelNumber(u16::from_be_bytes([buf[0], buf[1]]));
        if !number.is_valid() {
            return false;
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        buf.len() >= CHANNEL_DATA_HEADER_SIZE + length
    }

    /// Total size of a framed message with the given payload length on a
    /// stream transport.
    pub fn stream_frame_size(payload_len: usize) -> usize {
        CHANNEL_DATA_HEADER_SIZE + padded(payload_len)
    }
}
