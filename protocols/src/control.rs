//! Control command slots and the control message buffer.
//!
//! Every command occupies a fixed 128-byte slot: a 4-byte command type tag
//! followed by a 124-byte, zero-padded, type-specific body. A control message
//! is a 4096-byte buffer of 32 slots whose first slot is always a
//! [`ControlCommand::ControlMessageHeader`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

pub const CONTROL_SLOT_SIZE: usize = 128;
pub const CONTROL_BODY_SIZE: usize = CONTROL_SLOT_SIZE - 4;
pub const CONTROL_MESSAGE_SIZE: usize = 4096;
pub const CONTROL_SLOTS: usize = CONTROL_MESSAGE_SIZE / CONTROL_SLOT_SIZE;
/// One slot is reserved for the header.
pub const MAX_COMMANDS_PER_MESSAGE: usize = CONTROL_SLOTS - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ControlCommandType {
    NodeIdentification = 1,
    LinkIdentification = 2,
    ChannelReady = 3,
    TxAssignment = 4,
    TxForward = 5,
    ControlMessageHeader = 6,
    StartGeneration = 7,
}

impl TryFrom<u32> for ControlCommandType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ControlCommandType::NodeIdentification,
            2 => ControlCommandType::LinkIdentification,
            3 => ControlCommandType::ChannelReady,
            4 => ControlCommandType::TxAssignment,
            5 => ControlCommandType::TxForward,
            6 => ControlCommandType::ControlMessageHeader,
            7 => ControlCommandType::StartGeneration,
            other => return Err(ProtocolError::UnknownCommandType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    NodeIdentification {
        rank: u8,
        section: u16,
        chassis_id: u64,
    },
    LinkIdentification {
        local_rank: u8,
        remote_rank: u8,
        link_index: u8,
    },
    ChannelReady {
        rank: u8,
        channel: u8,
    },
    /// The sender created outbound assignments covering `[offset, offset + size)`
    /// of its own block towards every node in `dest_mask`.
    TxAssignment {
        buffer_id: u64,
        origin: u8,
        offset: u64,
        size: u64,
        dest_mask: u32,
    },
    /// The sender (`via`) relays `origin`'s range `[offset, offset + size)` to `dest_mask`.
    TxForward {
        buffer_id: u64,
        origin: u8,
        via: u8,
        offset: u64,
        size: u64,
        dest_mask: u32,
    },
    ControlMessageHeader {
        sender: u8,
        command_count: u32,
        sequence: u64,
    },
    StartGeneration {
        rank: u8,
        generation: u64,
    },
}

impl ControlCommand {
    pub fn command_type(&self) -> ControlCommandType {
        match self {
            ControlCommand::NodeIdentification { .. } => ControlCommandType::NodeIdentification,
            ControlCommand::LinkIdentification { .. } => ControlCommandType::LinkIdentification,
            ControlCommand::ChannelReady { .. } => ControlCommandType::ChannelReady,
            ControlCommand::TxAssignment { .. } => ControlCommandType::TxAssignment,
            ControlCommand::TxForward { .. } => ControlCommandType::TxForward,
            ControlCommand::ControlMessageHeader { .. } => {
                ControlCommandType::ControlMessageHeader
            }
            ControlCommand::StartGeneration { .. } => ControlCommandType::StartGeneration,
        }
    }

    /// Append exactly one 128-byte slot to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        let start = out.len();
        out.put_u32(self.command_type() as u32);
        match *self {
            ControlCommand::NodeIdentification {
                rank,
                section,
                chassis_id,
            } => {
                out.put_u8(rank);
                out.put_u16(section);
                out.put_u64(chassis_id);
            }
            ControlCommand::LinkIdentification {
                local_rank,
                remote_rank,
                link_index,
            } => {
                out.put_u8(local_rank);
                out.put_u8(remote_rank);
                out.put_u8(link_index);
            }
            ControlCommand::ChannelReady { rank, channel } => {
                out.put_u8(rank);
                out.put_u8(channel);
            }
            ControlCommand::TxAssignment {
                buffer_id,
                origin,
                offset,
                size,
                dest_mask,
            } => {
                out.put_u64(buffer_id);
                out.put_u8(origin);
                out.put_u64(offset);
                out.put_u64(size);
                out.put_u32(dest_mask);
            }
            ControlCommand::TxForward {
                buffer_id,
                origin,
                via,
                offset,
                size,
                dest_mask,
            } => {
                out.put_u64(buffer_id);
                out.put_u8(origin);
                out.put_u8(via);
                out.put_u64(offset);
                out.put_u64(size);
                out.put_u32(dest_mask);
            }
            ControlCommand::ControlMessageHeader {
                sender,
                command_count,
                sequence,
            } => {
                out.put_u8(sender);
                out.put_u32(command_count);
                out.put_u64(sequence);
            }
            ControlCommand::StartGeneration { rank, generation } => {
                out.put_u8(rank);
                out.put_u64(generation);
            }
        }
        let written = out.len() - start;
        out.put_bytes(0, CONTROL_SLOT_SIZE - written);
    }

    /// Decode one 128-byte slot.
    pub fn decode(slot: &[u8]) -> ProtocolResult<Self> {
        if slot.len() < CONTROL_SLOT_SIZE {
            return Err(ProtocolError::Truncated {
                expected: CONTROL_SLOT_SIZE,
                actual: slot.len(),
            });
        }
        let mut buf = &slot[..CONTROL_SLOT_SIZE];
        let command_type = ControlCommandType::try_from(buf.get_u32())?;
        let command = match command_type {
            ControlCommandType::NodeIdentification => ControlCommand::NodeIdentification {
                rank: buf.get_u8(),
                section: buf.get_u16(),
                chassis_id: buf.get_u64(),
            },
            ControlCommandType::LinkIdentification => ControlCommand::LinkIdentification {
                local_rank: buf.get_u8(),
                remote_rank: buf.get_u8(),
                link_index: buf.get_u8(),
            },
            ControlCommandType::ChannelReady => ControlCommand::ChannelReady {
                rank: buf.get_u8(),
                channel: buf.get_u8(),
            },
            ControlCommandType::TxAssignment => ControlCommand::TxAssignment {
                buffer_id: buf.get_u64(),
                origin: buf.get_u8(),
                offset: buf.get_u64(),
                size: buf.get_u64(),
                dest_mask: buf.get_u32(),
            },
            ControlCommandType::TxForward => ControlCommand::TxForward {
                buffer_id: buf.get_u64(),
                origin: buf.get_u8(),
                via: buf.get_u8(),
                offset: buf.get_u64(),
                size: buf.get_u64(),
                dest_mask: buf.get_u32(),
            },
            ControlCommandType::ControlMessageHeader => ControlCommand::ControlMessageHeader {
                sender: buf.get_u8(),
                command_count: buf.get_u32(),
                sequence: buf.get_u64(),
            },
            ControlCommandType::StartGeneration => ControlCommand::StartGeneration {
                rank: buf.get_u8(),
                generation: buf.get_u64(),
            },
        };
        Ok(command)
    }
}

/// A batch of control commands from one sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub sender: u8,
    pub sequence: u64,
    pub commands: Vec<ControlCommand>,
}

impl ControlMessage {
    pub fn new(sender: u8, sequence: u64, commands: Vec<ControlCommand>) -> ProtocolResult<Self> {
        if commands.len() > MAX_COMMANDS_PER_MESSAGE {
            return Err(ProtocolError::TooManyCommands {
                count: commands.len(),
                max: MAX_COMMANDS_PER_MESSAGE,
            });
        }
        Ok(Self {
            sender,
            sequence,
            commands,
        })
    }

    /// Encode into a 4096-byte buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_MESSAGE_SIZE);
        ControlCommand::ControlMessageHeader {
            sender: self.sender,
            command_count: self.commands.len() as u32,
            sequence: self.sequence,
        }
        .encode_into(&mut buf);
        for command in &self.commands {
            command.encode_into(&mut buf);
        }
        let used = buf.len();
        buf.put_bytes(0, CONTROL_MESSAGE_SIZE - used);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() != CONTROL_MESSAGE_SIZE {
            return Err(ProtocolError::Truncated {
                expected: CONTROL_MESSAGE_SIZE,
                actual: buf.len(),
            });
        }
        let mut slots = buf.chunks_exact(CONTROL_SLOT_SIZE);
        let header = slots
            .next()
            .ok_or(ProtocolError::MissingHeader)
            .and_then(ControlCommand::decode)?;
        let ControlCommand::ControlMessageHeader {
            sender,
            command_count,
            sequence,
        } = header
        else {
            return Err(ProtocolError::MissingHeader);
        };

        let count = command_count as usize;
        if count > MAX_COMMANDS_PER_MESSAGE {
            return Err(ProtocolError::TooManyCommands {
                count,
                max: MAX_COMMANDS_PER_MESSAGE,
            });
        }

        let commands = slots
            .take(count)
            .map(ControlCommand::decode)
            .collect::<ProtocolResult<Vec<_>>>()?;

        Ok(Self {
            sender,
            sequence,
            commands,
        })
    }
}
