use std::collections::HashMap;

use tracing::{debug, trace};

use crate::epos_frame::{self, CommandType, FrameError, Request};
use crate::*;

/// Error code answered when reading an object missing from the dictionary
pub const ERROR_OBJECT_NOT_EXIST: u32 = 0x0602_0000;

/// Misbehaviour the emulated device can be told to show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Answers `'F'` to every request opcode
    RejectOpcode,
    /// Answers `'F'` to every request payload
    RejectPayload,
    /// Starts responses with an opcode other than 0x00
    BadResponseOpcode,
    /// Flips a bit of the response CRC
    CorruptResponseCrc,
    /// Never answers
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Opcode,
    Length,
    Payload,
    ResponseBeginAck,
    ResponseEndAck,
}

/// Device side of the EPOS serial link, fed one byte at a time
pub struct Node {
    state: NodeState,
    frame: [u8; MAX_FRAME_SIZE],
    received: usize,
    expected: usize,
    response: [u8; MAX_FRAME_SIZE],
    response_len: usize,
    dictionary: HashMap<(u16, u8), u32>,
    fault: Fault,
    last_request: Option<Request>,
    last_ack: Option<u8>,
    completed: usize,
}

impl Default for Node {
    fn default() -> Self {
        create_node()
    }
}

impl Node {
    pub fn set_fault(&mut self, fault: Fault) {
        self.fault = fault;
    }

    pub fn set_value(&mut self, index: u16, subindex: u8, value: u32) {
        self.dictionary.insert((index, subindex), value);
    }

    pub fn value(&self, index: u16, subindex: u8) -> Option<u32> {
        self.dictionary.get(&(index, subindex)).copied()
    }

    /// Last request that passed its CRC check
    pub fn last_request(&self) -> Option<Request> {
        self.last_request
    }

    /// Last end ack the host sent for a response
    pub fn last_ack(&self) -> Option<u8> {
        self.last_ack
    }

    /// Number of responses the host acknowledged with `'O'`
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Consumes one byte sent by the host and returns the bytes the device
    /// sends back.
    pub fn receive(&mut self, byte: u8) -> Vec<u8> {
        if self.fault == Fault::Silent {
            return Vec::new();
        }

        match self.state {
            NodeState::Opcode => match byte {
                OPCODE_READ_OBJECT | OPCODE_WRITE_OBJECT if self.fault != Fault::RejectOpcode => {
                    self.frame[0] = byte;
                    self.received = 1;
                    self.state = NodeState::Length;
                    vec![ACK_OK]
                }
                _ => vec![ACK_FAIL],
            },

            NodeState::Length => {
                self.frame[1] = byte;
                self.received = 2;
                self.expected = epos_frame::request_len(byte as usize + 1);
                if self.expected > MAX_FRAME_SIZE {
                    self.state = NodeState::Opcode;
                    return vec![ACK_FAIL];
                }
                self.state = NodeState::Payload;
                Vec::new()
            }

            NodeState::Payload => {
                self.frame[self.received] = byte;
                self.received += 1;
                if self.received < self.expected {
                    return Vec::new();
                }

                self.state = NodeState::Opcode;
                let request = match epos_frame::decode_request(&self.frame[..self.expected]) {
                    Ok(request) if self.fault != Fault::RejectPayload => request,
                    Ok(_) => return vec![ACK_FAIL],
                    Err(e) => {
                        debug!("node rejects request: {}", e);
                        return vec![ACK_FAIL];
                    }
                };

                if let Err(e) = self.execute(request) {
                    debug!("node cannot answer request: {}", e);
                    return vec![ACK_FAIL];
                }
                self.state = NodeState::ResponseBeginAck;

                let opcode = if self.fault == Fault::BadResponseOpcode {
                    0x55
                } else {
                    OPCODE_RESPONSE
                };
                vec![ACK_OK, opcode]
            }

            NodeState::ResponseBeginAck => {
                if byte != ACK_OK {
                    self.state = NodeState::Opcode;
                    return Vec::new();
                }
                self.state = NodeState::ResponseEndAck;

                let mut payload = self.response[..self.response_len].to_vec();
                if self.fault == Fault::CorruptResponseCrc {
                    if let Some(crc_hi) = payload.last_mut() {
                        *crc_hi ^= 0x01;
                    }
                }
                payload
            }

            NodeState::ResponseEndAck => {
                self.last_ack = Some(byte);
                if byte == ACK_OK {
                    self.completed += 1;
                }
                self.state = NodeState::Opcode;
                Vec::new()
            }
        }
    }

    /// Feeds a whole buffer, collecting every byte sent back
    pub fn receive_all(&mut self, bytes: &[u8]) -> Vec<u8> {
        bytes.iter().flat_map(|&byte| self.receive(byte)).collect()
    }

    fn execute(&mut self, request: Request) -> Result<(), FrameError> {
        let address = request.address;
        let mut data = [0u8; READ_RESPONSE_WORDS * 2];

        let words = match request.command {
            CommandType::Read => {
                let (error, value) = match self.value(address.index, address.subindex) {
                    Some(value) => (0, value),
                    None => (ERROR_OBJECT_NOT_EXIST, 0),
                };
                data[0..4].copy_from_slice(&error.to_le_bytes());
                data[4..8].copy_from_slice(&value.to_le_bytes());
                READ_RESPONSE_WORDS
            }
            CommandType::Write(value) => {
                self.set_value(address.index, address.subindex, value);
                WRITE_RESPONSE_WORDS
            }
        };

        trace!("node executes {:?}", request);
        self.last_request = Some(request);
        self.response_len = epos_frame::encode_response(&mut self.response, &data[..words * 2])?;
        Ok(())
    }
}

pub fn create_node() -> Node {
    Node {
        state: NodeState::Opcode,
        frame: [0u8; MAX_FRAME_SIZE],
        received: 0,
        expected: 0,
        response: [0u8; MAX_FRAME_SIZE],
        response_len: 0,
        dictionary: HashMap::new(),
        fault: Fault::None,
        last_request: None,
        last_ack: None,
        completed: 0,
    }
}
