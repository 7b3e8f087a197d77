//! Link handshake frame.
//!
//! Layout (97 bytes, big-endian):
//!
//! | bytes   | field          |
//! |---------|----------------|
//! | 0..8    | version        |
//! | 8       | message type   |
//! | 9..13   | sender rank    |
//! | 13..17  | message length |
//! | 17..81  | body (padded)  |
//! | 81..97  | tag            |
//!
//! The tag is a keyed blake3 hash of bytes `0..81` truncated to 16 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use subtle::ConstantTimeEq;

use crate::{
    error::{ProtocolError, ProtocolResult},
    tag::TAG_SIZE,
};

/// Date-coded protocol version, `YYYYMMDDnn`.
pub const PROTOCOL_VERSION: u64 = 2025_06_17_01;

pub const MAX_HANDSHAKE_BODY: usize = 64;
pub const LINK_SECRET_SIZE: usize = 32;
pub const HANDSHAKE_FRAME_SIZE: usize = 8 + 1 + 4 + 4 + MAX_HANDSHAKE_BODY + TAG_SIZE;

const AUTHENTICATED_LEN: usize = HANDSHAKE_FRAME_SIZE - TAG_SIZE;
const BODY_START: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandshakeType {
    Hello = 1,
    HelloAck = 2,
}

impl TryFrom<u8> for HandshakeType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HandshakeType::Hello),
            2 => Ok(HandshakeType::HelloAck),
            other => Err(ProtocolError::UnknownHandshakeType(other)),
        }
    }
}

/// What the receiving side requires of a peer's handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeExpectation {
    pub version: u64,
    pub message_type: HandshakeType,
    pub sender_rank: u32,
    pub body_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame {
    pub version: u64,
    pub message_type: HandshakeType,
    pub sender_rank: u32,
    body: Bytes,
}

impl HandshakeFrame {
    pub fn new(
        message_type: HandshakeType,
        sender_rank: u32,
        body: impl Into<Bytes>,
    ) -> ProtocolResult<Self> {
        let body = body.into();
        if body.len() > MAX_HANDSHAKE_BODY {
            return Err(ProtocolError::BodyTooLong {
                len: body.len(),
                max: MAX_HANDSHAKE_BODY,
            });
        }
        Ok(Self {
            version: PROTOCOL_VERSION,
            message_type,
            sender_rank,
            body,
        })
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encode into a fixed-size frame sealed with `secret`.
    pub fn encode(&self, secret: &[u8; LINK_SECRET_SIZE]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_FRAME_SIZE);
        buf.put_u64(self.version);
        buf.put_u8(self.message_type as u8);
        buf.put_u32(self.sender_rank);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.put_bytes(0, MAX_HANDSHAKE_BODY - self.body.len());
        let tag = frame_tag(secret, &buf[..AUTHENTICATED_LEN]);
        buf.put_slice(&tag);
        buf.freeze()
    }

    /// Decode a frame and verify its tag.
    pub fn decode(frame: &[u8], secret: &[u8; LINK_SECRET_SIZE]) -> ProtocolResult<Self> {
        if frame.len() != HANDSHAKE_FRAME_SIZE {
            return Err(ProtocolError::Truncated {
                expected: HANDSHAKE_FRAME_SIZE,
                actual: frame.len(),
            });
        }

        let expected_tag = frame_tag(secret, &frame[..AUTHENTICATED_LEN]);
        let tag_ok: bool = expected_tag[..].ct_eq(&frame[AUTHENTICATED_LEN..]).into();
        if !tag_ok {
            return Err(ProtocolError::BadTag);
        }

        let mut cursor = &frame[..BODY_START];
        let version = cursor.get_u64();
        let message_type = HandshakeType::try_from(cursor.get_u8())?;
        let sender_rank = cursor.get_u32();
        let body_len = cursor.get_u32() as usize;
        if body_len > MAX_HANDSHAKE_BODY {
            return Err(ProtocolError::BodyTooLong {
                len: body_len,
                max: MAX_HANDSHAKE_BODY,
            });
        }

        Ok(Self {
            version,
            message_type,
            sender_rank,
            body: Bytes::copy_from_slice(&frame[BODY_START..BODY_START + body_len]),
        })
    }

    /// Accept the peer's handshake only if every header field matches.
    pub fn accept(&self, expected: &HandshakeExpectation) -> ProtocolResult<()> {
        let checks = [
            ("version", expected.version, self.version),
            (
                "message_type",
                expected.message_type as u64,
                self.message_type as u64,
            ),
            (
                "sender_rank",
                expected.sender_rank as u64,
                self.sender_rank as u64,
            ),
            (
                "message_length",
                expected.body_len as u64,
                self.body.len() as u64,
            ),
        ];
        for (field, expected, actual) in checks {
            if expected != actual {
                return Err(ProtocolError::Mismatch {
                    field,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }
}

fn frame_tag(secret: &[u8; LINK_SECRET_SIZE], authenticated: &[u8]) -> [u8; TAG_SIZE] {
    let hash = blake3::keyed_hash(secret, authenticated);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&hash.as_bytes()[..TAG_SIZE]);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; LINK_SECRET_SIZE] = [0x5a; LINK_SECRET_SIZE];

    fn expectation(rank: u32, body_len: usize) -> HandshakeExpectation {
        HandshakeExpectation {
            version: PROTOCOL_VERSION,
            message_type: HandshakeType::Hello,
            sender_rank: rank,
            body_len,
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = HandshakeFrame::new(HandshakeType::Hello, 3, &b"chassis-7"[..]).unwrap();
        let wire = frame.encode(&SECRET);

        assert_eq!(wire.len(), HANDSHAKE_FRAME_SIZE);
        assert_eq!(&wire[0..8], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(wire[8], HandshakeType::Hello as u8);
        assert_eq!(&wire[9..13], &3u32.to_be_bytes());
        assert_eq!(&wire[13..17], &9u32.to_be_bytes());
        assert_eq!(&wire[17..26], b"chassis-7");
        assert!(wire[26..81].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_and_accept() {
        let frame = HandshakeFrame::new(HandshakeType::Hello, 1, &b"abc"[..]).unwrap();
        let decoded = HandshakeFrame::decode(&frame.encode(&SECRET), &SECRET).unwrap();

        assert_eq!(decoded.body(), b"abc");
        decoded.accept(&expectation(1, 3)).unwrap();
    }

    #[test]
    fn test_accept_rejects_wrong_rank() {
        let frame = HandshakeFrame::new(HandshakeType::Hello, 1, &b"abc"[..]).unwrap();
        let err = frame.accept(&expectation(2, 3)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Mismatch {
                field: "sender_rank",
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_accept_rejects_wrong_length() {
        let frame = HandshakeFrame::new(HandshakeType::Hello, 1, &b"abcd"[..]).unwrap();
        let err = frame.accept(&expectation(1, 3)).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Mismatch {
                field: "message_length",
                ..
            }
        ));
    }

    #[test]
    fn test_accept_rejects_old_version() {
        let mut frame = HandshakeFrame::new(HandshakeType::HelloAck, 0, Bytes::new()).unwrap();
        frame.version = 2024_01_01_00;
        let mut expected = expectation(0, 0);
        expected.message_type = HandshakeType::HelloAck;
        assert!(matches!(
            frame.accept(&expected),
            Err(ProtocolError::Mismatch {
                field: "version",
                ..
            })
        ));
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let frame = HandshakeFrame::new(HandshakeType::Hello, 4, &b"x"[..]).unwrap();
        let mut wire = frame.encode(&SECRET).to_vec();
        wire[12] ^= 0x01;
        assert_eq!(
            HandshakeFrame::decode(&wire, &SECRET).unwrap_err(),
            ProtocolError::BadTag
        );

        let other_secret = [0x11; LINK_SECRET_SIZE];
        assert_eq!(
            HandshakeFrame::decode(&frame.encode(&SECRET), &other_secret).unwrap_err(),
            ProtocolError::BadTag
        );
    }

    #[test]
    fn test_body_too_long() {
        let err = HandshakeFrame::new(HandshakeType::Hello, 0, vec![0u8; 65]).unwrap_err();
        assert_eq!(err, ProtocolError::BodyTooLong { len: 65, max: 64 });
    }

    #[test]
    fn test_short_frame() {
        let err = HandshakeFrame::decode(&[0u8; 10], &SECRET).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { actual: 10, .. }));
    }
}
