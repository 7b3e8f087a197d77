//! Wire encodings shared by the mesh data plane and the link layers around it.
//!
//! - Handshake frames exchanged when a link between two nodes comes up
//! - Fixed-size control command slots and the 4 KiB control message buffer
//! - The 16-byte authentication tag carried alongside every chunk
//!
//! All integers are big-endian.

pub mod control;
pub mod error;
pub mod handshake;
pub mod tag;

pub use control::{
    ControlCommand, ControlCommandType, ControlMessage, CONTROL_BODY_SIZE, CONTROL_MESSAGE_SIZE,
    CONTROL_SLOTS, CONTROL_SLOT_SIZE, MAX_COMMANDS_PER_MESSAGE,
};
pub use error::{ProtocolError, ProtocolResult};
pub use handshake::{
    HandshakeExpectation, HandshakeFrame, HandshakeType, HANDSHAKE_FRAME_SIZE, LINK_SECRET_SIZE,
    MAX_HANDSHAKE_BODY, PROTOCOL_VERSION,
};
pub use tag::{AuthTag, TAG_SIZE};
