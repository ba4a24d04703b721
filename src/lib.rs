#![crate_type = "lib"]
#![crate_name = "epos"]

//! # epos-rs
//!
//! `epos-rs` implements the serial command/response protocol of the
//! Maxon EPOS motor controllers:
//!   * [EPOS Communication Guide](https://www.maxongroup.com/medias/sys_master/root/8834324922398/EPOS-Communication-Guide-En.pdf)
//!
//! Every access to the device object dictionary (read or write of an
//! `index`/`subindex` pair on a given node id) becomes a framed, CRC-checked,
//! half-duplex exchange. The exchange is driven entirely by transport
//! notifications, so no call in this crate ever blocks: requests are
//! admitted, and the caller polls for completion.
//!
//! The library does not open serial ports by itself. It requires a struct
//! implementing the [`SerialInterface`] trait, and the transport must call
//! [`epos_main::Epos::on_serial_event`] whenever bytes arrive or transmit
//! buffer space frees up.
//!
//! # Examples
//!
//! ```
//! use epos::epos_main::create_epos;
//! use epos::{Config, IntfError, ResponseStatus, SerialInterface};
//!
//! struct NewInterface;
//!
//! impl SerialInterface for NewInterface {
//!     fn write(&self, bytes: &[u8]) -> Result<usize, IntfError> {
//!         // your implementation
//!         Ok(bytes.len())
//!     }
//!
//!     fn read(&self, _buf: &mut [u8]) -> Result<usize, IntfError> {
//!         // your implementation
//!         Ok(0)
//!     }
//!
//!     fn rx_available(&self) -> usize {
//!         0
//!     }
//!
//!     fn tx_free(&self) -> usize {
//!         0
//!     }
//!
//!     fn tx_capacity(&self) -> usize {
//!         64
//!     }
//! }
//!
//! let epos = create_epos(NewInterface, Config::default());
//! assert_eq!(epos.poll_status(), ResponseStatus::None);
//!
//! epos.enable_operation(0).unwrap();
//! assert_eq!(epos.poll_status(), ResponseStatus::Waiting);
//! ```
//!
//! This crate contains the modules
//!  * Main: the host side engine and its public request API
//!  * Node: a device side emulator, useful to test hosts without hardware
//!  * Frame: CRC-16 and frame encoding shared by both sides
//!  * Fsm: the transaction state machine run by the host
//!  * Cmd: object indices and controlword helpers
//!

use std::time::{Duration, Instant};

use thiserror::Error;

/// Object indices, controlword commands and modes of operation
pub mod epos_cmd;
/// CRC-16 engine and frame codec
pub mod epos_frame;
/// Transaction state machine
pub mod epos_fsm;
/// Module implementing the host (main) side
pub mod epos_main;
/// Module implementing a device (node) emulator
pub mod epos_node;

/// Maximum size of a single frame
pub const MAX_FRAME_SIZE: usize = 40;

/// Request opcode: read object
pub const OPCODE_READ_OBJECT: u8 = 0x10;
/// Request opcode: write object
pub const OPCODE_WRITE_OBJECT: u8 = 0x11;
/// Opcode every device response starts with
pub const OPCODE_RESPONSE: u8 = 0x00;

/// Handshake byte: accepted / matched
pub const ACK_OK: u8 = b'O';
/// Handshake byte: rejected / mismatch
pub const ACK_FAIL: u8 = b'F';

/// Data words in a read object response: error code, value
pub const READ_RESPONSE_WORDS: usize = 4;
/// Data words in a write object response: error code
pub const WRITE_RESPONSE_WORDS: usize = 2;

/// Line speed the controller uses out of reset
pub const DEFAULT_BAUD_RATE: u32 = 38400;
/// Time a transaction may go without progress before it is aborted
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
/// Data bits per character, no parity
pub const DATA_BITS: u8 = 8;
/// Stop bits per character
pub const STOP_BITS: u8 = 1;

/// Address of a register in the device object dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectAddress {
    pub index: u16,
    pub subindex: u8,
    pub node_id: u8,
}

impl ObjectAddress {
    pub const fn new(index: u16, subindex: u8, node_id: u8) -> Self {
        Self {
            index,
            subindex,
            node_id,
        }
    }
}

/// Status of the last admitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0,
    /// No transaction was ever issued
    None = 1,
    Waiting = 2,
    /// Timeout, checksum mismatch or rejected handshake
    Error = 3,
}

impl ResponseStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::None,
            2 => Self::Waiting,
            _ => Self::Error,
        }
    }
}

/// Error results of a serial transport access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntfError {
    #[error("serial interface error")]
    Interface,
    #[error("serial buffer full")]
    BufferFull,
    #[error("serial port not available")]
    NoDevice,
}

/// Error results of an EPOS request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EposError {
    /// Another transaction is being admitted or is still in flight
    #[error("driver busy with another transaction")]
    Busy,
    /// The transport did not accept the opcode byte
    #[error("serial transmit buffer full")]
    SerialBufferFull,
    #[error("serial interface: {0}")]
    Interface(IntfError),
    /// Response data requested without a successful transaction
    #[error("no successful response available")]
    NoResponse,
    #[error("response offset {offset} out of range ({words} words available)")]
    OutOfRange { offset: usize, words: usize },
}

/// Runtime parameters of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub baud_rate: u32,
    /// Longest time a transaction may go without progress
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Config {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// This trait contains the implementation required to access the serial line.
///
/// Every method must return immediately. Implementors are expected to call
/// [`epos_main::Epos::on_serial_event`] when bytes arrive or when transmit
/// buffer space is released.
pub trait SerialInterface {
    /// Queues bytes for transmission, returning how many were accepted
    fn write(&self, bytes: &[u8]) -> Result<usize, IntfError>;

    /// Copies received bytes into `buf`, returning how many were copied
    fn read(&self, buf: &mut [u8]) -> Result<usize, IntfError>;

    /// Number of bytes waiting in the receive buffer
    fn rx_available(&self) -> usize;

    /// Free space in the transmit buffer
    fn tx_free(&self) -> usize;

    /// Total size of the transmit buffer
    fn tx_capacity(&self) -> usize;

    /// Everything queued so far has left the line. If not needed, use
    /// the default implementation
    fn tx_done(&self) -> bool {
        self.tx_free() >= self.tx_capacity()
    }

    /// Discards any received byte still buffered
    fn clear_rx(&self) -> Result<(), IntfError> {
        Ok(())
    }

    /// Discards any byte still waiting to be sent
    fn clear_tx(&self) -> Result<(), IntfError> {
        Ok(())
    }

    /// This trait offers the option to drive the timeout timer from a board
    /// clock. Otherwise, the default implementation is available
    fn now(&self) -> Instant {
        Instant::now()
    }
}
