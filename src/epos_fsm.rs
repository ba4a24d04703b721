use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::epos_frame::{self, FrameError};
use crate::*;

/// Transaction states, in transmission order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    SendingOpcode,
    WaitingBeginAck,
    SendingPayload,
    WaitingEndAck,
    WaitingResponseOpcode,
    SendingResponseBeginAck,
    WaitingResponsePayload,
    SendingResponseEndAck,
}

/// Why a transaction ended in error. Callers only ever see
/// [`ResponseStatus::Error`]; the reason is kept for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    Timeout,
    /// Device answered a handshake with something other than `'O'`
    Rejected(u8),
    /// Device response did not start with the response opcode
    BadOpcode(u8),
    Checksum(FrameError),
    Transport(IntfError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error(Abort),
}

/// The single in-flight exchange with the device
pub struct Transaction {
    state: State,
    outbound: [u8; MAX_FRAME_SIZE],
    outbound_len: usize,
    inbound: [u8; MAX_FRAME_SIZE],
    inbound_len: usize,
    response_words: usize,
    response_ack: u8,
    deadline: Option<Instant>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

fn read_byte<INTF: SerialInterface>(interface: &INTF) -> Result<u8, IntfError> {
    let mut byte = [0u8; 1];
    match interface.read(&mut byte)? {
        1 => Ok(byte[0]),
        _ => Err(IntfError::Interface),
    }
}

fn send<INTF: SerialInterface>(interface: &INTF, bytes: &[u8]) -> Result<(), IntfError> {
    trace!("tx {:02X?}", bytes);
    if interface.write(bytes)? != bytes.len() {
        return Err(IntfError::BufferFull);
    }
    Ok(())
}

impl Transaction {
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            outbound: [0u8; MAX_FRAME_SIZE],
            outbound_len: 0,
            inbound: [0u8; MAX_FRAME_SIZE],
            inbound_len: 0,
            response_words: 0,
            response_ack: ACK_FAIL,
            deadline: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Loads a write object request
    pub fn prepare_write(&mut self, address: &ObjectAddress, data: u32) {
        self.outbound_len = epos_frame::encode_write(&mut self.outbound, address, data);
        self.expect_response(WRITE_RESPONSE_WORDS);
    }

    /// Loads a read object request
    pub fn prepare_read(&mut self, address: &ObjectAddress) {
        self.outbound_len = epos_frame::encode_read(&mut self.outbound, address);
        self.expect_response(READ_RESPONSE_WORDS);
    }

    /// Number of response data words to wait for after the end ack.
    /// Zero finishes the transaction on the end ack.
    pub fn expect_response(&mut self, words: usize) {
        self.response_words = words;
        self.inbound_len = if words == 0 {
            0
        } else {
            epos_frame::response_len(words)
        };
    }

    /// Request frame currently loaded
    pub fn outbound(&self) -> &[u8] {
        &self.outbound[..self.outbound_len]
    }

    pub fn response_words(&self) -> usize {
        self.response_words
    }

    /// Response data words of the last transaction, length and CRC excluded
    pub fn response_data(&self) -> &[u8] {
        &self.inbound[1..1 + self.response_words * 2]
    }

    /// Sends the opcode byte and leaves `Idle`. On error nothing changes.
    pub fn start<INTF: SerialInterface>(
        &mut self,
        interface: &INTF,
        timeout: Duration,
    ) -> Result<(), IntfError> {
        send(interface, &self.outbound[..1])?;
        self.inbound[..].fill(0);
        self.enter(State::SendingOpcode, interface.now(), timeout);
        Ok(())
    }

    fn enter(&mut self, next: State, now: Instant, timeout: Duration) {
        debug!("epos {:?} -> {:?}", self.state, next);
        self.state = next;
        self.deadline = Some(now + timeout);
    }

    fn finish(&mut self, outcome: Outcome) -> Outcome {
        match outcome {
            Outcome::Success => debug!("epos {:?} -> Idle, success", self.state),
            Outcome::Error(reason) => warn!("epos transaction aborted in {:?}: {:?}", self.state, reason),
        }
        self.state = State::Idle;
        self.deadline = None;
        outcome
    }

    /// Forces the machine back to `Idle` once the deadline has passed
    pub fn expire(&mut self, now: Instant) -> Option<Outcome> {
        match self.deadline {
            Some(deadline) if !self.is_idle() && now >= deadline => {
                Some(self.finish(Outcome::Error(Abort::Timeout)))
            }
            _ => None,
        }
    }

    /// Runs the machine as far as the transport allows. Returns the outcome
    /// when the transaction reaches `Idle`. A transaction past its deadline
    /// is aborted before any pending byte is looked at.
    pub fn advance<INTF: SerialInterface>(
        &mut self,
        interface: &INTF,
        timeout: Duration,
    ) -> Option<Outcome> {
        if let Some(outcome) = self.expire(interface.now()) {
            return Some(outcome);
        }

        match self.run(interface, timeout) {
            Ok(outcome) => outcome,
            Err(e) if self.is_idle() => {
                trace!("serial error while idle: {:?}", e);
                None
            }
            Err(e) => Some(self.finish(Outcome::Error(Abort::Transport(e)))),
        }
    }

    // A single notification may report both a completed send and freshly
    // received bytes, so every transition loops to re-evaluate the new state.
    fn run<INTF: SerialInterface>(
        &mut self,
        interface: &INTF,
        timeout: Duration,
    ) -> Result<Option<Outcome>, IntfError> {
        let now = interface.now();

        loop {
            match self.state {
                State::Idle => return Ok(None),

                State::SendingOpcode => {
                    if !interface.tx_done() {
                        return Ok(None);
                    }
                    self.enter(State::WaitingBeginAck, now, timeout);
                }

                State::WaitingBeginAck => {
                    if interface.rx_available() < 1 {
                        return Ok(None);
                    }
                    let ack = read_byte(interface)?;
                    if ack != ACK_OK {
                        return Ok(Some(self.finish(Outcome::Error(Abort::Rejected(ack)))));
                    }
                    send(interface, &self.outbound[1..self.outbound_len])?;
                    self.enter(State::SendingPayload, now, timeout);
                }

                State::SendingPayload => {
                    if !interface.tx_done() {
                        return Ok(None);
                    }
                    self.enter(State::WaitingEndAck, now, timeout);
                }

                State::WaitingEndAck => {
                    if interface.rx_available() < 1 {
                        return Ok(None);
                    }
                    let ack = read_byte(interface)?;
                    if ack != ACK_OK {
                        return Ok(Some(self.finish(Outcome::Error(Abort::Rejected(ack)))));
                    }
                    if self.inbound_len == 0 {
                        return Ok(Some(self.finish(Outcome::Success)));
                    }
                    self.enter(State::WaitingResponseOpcode, now, timeout);
                }

                State::WaitingResponseOpcode => {
                    if interface.rx_available() < 1 {
                        return Ok(None);
                    }
                    let opcode = read_byte(interface)?;
                    self.response_ack = if opcode == OPCODE_RESPONSE {
                        ACK_OK
                    } else {
                        warn!("unexpected response opcode 0x{:02X}", opcode);
                        self.inbound[0] = opcode;
                        ACK_FAIL
                    };
                    send(interface, &[self.response_ack])?;
                    self.enter(State::SendingResponseBeginAck, now, timeout);
                }

                State::SendingResponseBeginAck => {
                    if !interface.tx_done() {
                        return Ok(None);
                    }
                    if self.response_ack != ACK_OK {
                        let opcode = self.inbound[0];
                        return Ok(Some(self.finish(Outcome::Error(Abort::BadOpcode(opcode)))));
                    }
                    self.enter(State::WaitingResponsePayload, now, timeout);
                }

                State::WaitingResponsePayload => {
                    if interface.rx_available() < self.inbound_len {
                        return Ok(None);
                    }

                    let mut received = 0;
                    while received < self.inbound_len {
                        match interface.read(&mut self.inbound[received..self.inbound_len])? {
                            0 => return Err(IntfError::Interface),
                            n => received += n,
                        }
                    }
                    trace!("rx {:02X?}", &self.inbound[..self.inbound_len]);

                    self.response_ack = match epos_frame::check_response(
                        &self.inbound[..self.inbound_len],
                        self.response_words,
                    ) {
                        Ok(()) => ACK_OK,
                        Err(e) => {
                            warn!("bad response payload: {}", e);
                            ACK_FAIL
                        }
                    };
                    send(interface, &[self.response_ack])?;
                    self.enter(State::SendingResponseEndAck, now, timeout);
                }

                State::SendingResponseEndAck => {
                    if !interface.tx_done() {
                        return Ok(None);
                    }
                    let outcome = if self.response_ack == ACK_OK {
                        Outcome::Success
                    } else {
                        let payload = &self.inbound[..self.inbound_len];
                        let reason = epos_frame::check_response(payload, self.response_words)
                            .err()
                            .unwrap_or(FrameError::Truncated(self.inbound_len));
                        Outcome::Error(Abort::Checksum(reason))
                    };
                    return Ok(Some(self.finish(outcome)));
                }
            }
        }
    }
}
