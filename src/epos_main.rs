use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use spin::Mutex;
use tracing::{debug, warn};

use crate::epos_frame;
use crate::epos_fsm::{Outcome, State, Transaction};
use crate::*;

/// Host side of the EPOS serial link.
///
/// Requests are admitted one at a time. The admitting task and the transport
/// notification path share the transaction through a lock that is only ever
/// tried, never waited on.
pub struct Epos<INTERFACE: SerialInterface> {
    interface: INTERFACE,
    config: Config,
    transaction: Mutex<Transaction>,
    status: AtomicU8,
    pending: AtomicBool,
}

/// These functions may be used on any Epos struct
impl<INTF> Epos<INTF>
where
    INTF: SerialInterface,
{
    pub fn new(interface: INTF, config: Config) -> Self {
        Self {
            interface,
            config,
            transaction: Mutex::new(Transaction::new()),
            status: AtomicU8::new(ResponseStatus::None as u8),
            pending: AtomicBool::new(false),
        }
    }

    pub fn interface(&self) -> &INTF {
        &self.interface
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current machine state, `None` while another path holds the transaction
    pub fn state(&self) -> Option<State> {
        self.locked(|transaction| transaction.state())
    }

    // Every holder of the transaction goes through here, so a notification
    // refused while the lock was held is replayed on release.
    fn locked<T>(&self, access: impl FnOnce(&mut Transaction) -> T) -> Option<T> {
        let mut transaction = self.transaction.try_lock()?;
        let result = access(&mut transaction);
        drop(transaction);
        self.service();
        Some(result)
    }

    fn admit(&self, prepare: impl FnOnce(&mut Transaction)) -> Result<(), EposError> {
        self.locked(|transaction| self.admit_locked(transaction, prepare))
            .unwrap_or(Err(EposError::Busy))
    }

    // The request is staged aside and only replaces the previous transaction,
    // with its response data, once the opcode byte has been accepted.
    fn admit_locked(
        &self,
        transaction: &mut Transaction,
        prepare: impl FnOnce(&mut Transaction),
    ) -> Result<(), EposError> {
        if let Some(outcome) = transaction.expire(self.interface.now()) {
            self.publish(outcome);
        }
        if !transaction.is_idle() {
            return Err(EposError::Busy);
        }

        self.interface.clear_rx().map_err(EposError::Interface)?;
        self.interface.clear_tx().map_err(EposError::Interface)?;

        let mut staged = Transaction::new();
        prepare(&mut staged);
        match staged.start(&self.interface, self.config.timeout) {
            Ok(()) => (),
            Err(IntfError::BufferFull) => return Err(EposError::SerialBufferFull),
            Err(e) => return Err(EposError::Interface(e)),
        }
        debug!("epos request admitted: {:02X?}", staged.outbound());

        *transaction = staged;
        self.status.store(ResponseStatus::Waiting as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Requests a write to the device object dictionary. Non-blocking:
    /// completion is reported by [`Epos::poll_status`].
    pub fn write_object(
        &self,
        index: u16,
        subindex: u8,
        node_id: u8,
        data: u32,
    ) -> Result<(), EposError> {
        let address = ObjectAddress::new(index, subindex, node_id);
        self.admit(|transaction| transaction.prepare_write(&address, data))
    }

    /// Requests a read from the device object dictionary. Non-blocking:
    /// once [`Epos::poll_status`] reports success, the error code is
    /// response double word 0 and the value double word 1.
    pub fn read_object(&self, index: u16, subindex: u8, node_id: u8) -> Result<(), EposError> {
        let address = ObjectAddress::new(index, subindex, node_id);
        self.admit(|transaction| transaction.prepare_read(&address))
    }

    /// Transport notification: bytes arrived or transmit space was released.
    pub fn on_serial_event(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.service();
    }

    // Whoever holds the transaction when a notification lands replays it
    // after releasing the lock.
    fn service(&self) {
        while self.pending.load(Ordering::SeqCst) {
            let Some(mut transaction) = self.transaction.try_lock() else {
                return;
            };
            self.pending.store(false, Ordering::SeqCst);

            if let Some(outcome) = transaction.advance(&self.interface, self.config.timeout) {
                self.publish(outcome);
            }
        }
    }

    /// Fires the timeout timer if the transaction made no progress in time.
    /// Returns true when a transaction was aborted.
    pub fn check_timeout(&self) -> bool {
        let now = self.interface.now();
        let expired = self.locked(|transaction| transaction.expire(now));

        match expired.flatten() {
            Some(outcome) => {
                self.publish(outcome);
                true
            }
            None => false,
        }
    }

    fn publish(&self, outcome: Outcome) {
        let status = match outcome {
            Outcome::Success => ResponseStatus::Success,
            Outcome::Error(_) => ResponseStatus::Error,
        };
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Status of the last admitted request, without driving the timer
    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Non-blocking completion check. Drives the timeout timer, so callers
    /// that wait on a request only need to call this in a loop.
    pub fn poll_status(&self) -> ResponseStatus {
        self.check_timeout();
        self.status()
    }

    fn with_response<T>(&self, read: impl FnOnce(&Transaction) -> T) -> Result<T, EposError> {
        if self.status() != ResponseStatus::Success {
            return Err(EposError::NoResponse);
        }
        self.locked(|transaction| read(transaction)).ok_or(EposError::Busy)
    }

    /// Number of data words in the last successful response
    pub fn response_words(&self) -> Result<usize, EposError> {
        self.with_response(|transaction| transaction.response_words())
    }

    /// Reads response data word `windex`
    pub fn read_response_word(&self, windex: usize) -> Result<u16, EposError> {
        self.with_response(|transaction| {
            epos_frame::word_at(transaction.response_data(), windex).ok_or(
                EposError::OutOfRange {
                    offset: windex,
                    words: transaction.response_words(),
                },
            )
        })?
    }

    /// Reads response data double word `dindex`
    pub fn read_response_dword(&self, dindex: usize) -> Result<u32, EposError> {
        self.with_response(|transaction| {
            epos_frame::dword_at(transaction.response_data(), dindex).ok_or(
                EposError::OutOfRange {
                    offset: dindex,
                    words: transaction.response_words(),
                },
            )
        })?
    }

    /// Reads high and low bytes of response data word `windex`
    pub fn read_response_bytes(&self, windex: usize) -> Result<(u8, u8), EposError> {
        let [low, high] = self.read_response_word(windex)?.to_le_bytes();
        Ok((high, low))
    }

    /// Polls until the pending request leaves `Waiting`, calling `backoff`
    /// between polls. Only for callers allowed to wait.
    pub fn wait_for(&self, mut backoff: impl FnMut()) -> ResponseStatus {
        loop {
            match self.poll_status() {
                ResponseStatus::Waiting => backoff(),
                status => {
                    if status == ResponseStatus::Error {
                        warn!("epos request failed");
                    }
                    return status;
                }
            }
        }
    }
}

pub fn create_epos<INTF: SerialInterface>(interface: INTF, config: Config) -> Epos<INTF> {
    Epos::new(interface, config)
}
