use stun::message::MAGIC_COOKIE;

use crate::proto::chandata::CHANNEL_DATA_HEADER_SIZE;

const STUN_HEADER_SIZE: usize = 20;

/// Outcome of the stream look-ahead.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FramePeek {
    /// More bytes are needed before the frame can be classified.
    Insufficient,
    /// A complete STUN message of `total` bytes starts the buffer.
    Stun { total: usize },
    /// A complete CHANNEL-DATA frame of `total` bytes (padding included)
    /// starts the buffer; the unpadded message is `message` bytes long.
    ChannelData { total: usize, message: usize },
    /// The stream carries neither STUN nor channel data; it is poisoned.
    Bogus,
}

/// Classifies the head of a TCP read buffer: STUN first (leading two bits
/// zero and the magic cookie in place), then CHANNEL-DATA by the leading
/// u16, anything else poisons the connection.
pub(crate) fn peek_frame(buf: &[u8], channel_range: (u16, u16)) -> FramePeek {
    if buf.len() < CHANNEL_DATA_HEADER_SIZE {
        return FramePeek::Insufficient;
    }

    if buf[0] & 0xC0 == 0 {
        // candidate STUN header; the magic cookie decides
        if buf.len() < 8 {
            return FramePeek::Insufficient;
        }
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie == MAGIC_COOKIE {
            let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            let total = STUN_HEADER_SIZE + length;
            if buf.len() < total {
                return FramePeek::Insufficient;
            }
            return FramePeek::Stun { total };
        }
    }

    let leading = u16::from_be_bytes([buf[0], buf[1]]);
    if leading >= channel_range.0 && leading <= channel_range.1 {
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let message = CHANNEL_DATA_HEADER_SIZE + length;
        // stream frames are padded to a 4-byte boundary
        let total = CHANNEL_DATA_HEADER_SIZE + ((length + 3) & !3);
        if buf.len() < total {
            return FramePeek::Insufficient;
        }
        return FramePeek::ChannelData { total, message };
    }

    FramePeek::Bogus
}

#[cfg(test)]
mod framing_test {
    use super::*;

    const RANGE: (u16, u16) = (0x4000, 0x7FFF);

    #[test]
    fn test_peek_insufficient() {
        assert_eq!(peek_frame(&[0x40], RANGE), FramePeek::Insufficient);
        assert_eq!(peek_frame(&[0x00, 0x01, 0x00], RANGE), FramePeek::Insufficient);
    }

    #[test]
    fn test_peek_channel_data_padded() {
        // channel 0x4000, length 2, padded to 4
        let frame = [0x40, 0x00, 0x00, 0x02, b'h', b'i', 0, 0];
        assert_eq!(
            peek_frame(&frame, RANGE),
            FramePeek::ChannelData { total: 8, message: 6 }
        );
        assert_eq!(peek_frame(&frame[..6], RANGE), FramePeek::Insufficient);
    }

    #[test]
    fn test_peek_wrong_cookie_goes_to_channel_path() {
        // first two bits zero but no magic cookie: not STUN, and the
        // leading u16 is outside the channel range, so the stream is bogus
        let frame = [0x00, 0x01, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef];
        assert_eq!(peek_frame(&frame, RANGE), FramePeek::Bogus);
    }

    #[test]
    fn test_peek_bogus() {
        let frame = [0xff, 0x00, 0x00, 0x00, 0, 0, 0, 0];
        assert_eq!(peek_frame(&frame, RANGE), FramePeek::Bogus);
    }
}
