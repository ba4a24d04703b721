use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use epos::epos_cmd::{Mode, MODES_OPERATION_INDEX, TARGET_VELOCITY_INDEX};
use epos::epos_main::{create_epos, Epos};
use epos::epos_node::{create_node, Fault, Node, ERROR_OBJECT_NOT_EXIST};
use epos::{Config, EposError, IntfError, ResponseStatus, SerialInterface, ACK_FAIL, ACK_OK};

const TX_CAPACITY: usize = 64;

/// Serial line between the host engine and an emulated node. Bytes written
/// by the host stay in `tx` until `pump` moves them to the node.
struct Wire {
    rx: RefCell<VecDeque<u8>>,
    tx: RefCell<Vec<u8>>,
    transmitted: RefCell<Vec<u8>>,
    clock: Cell<Instant>,
    refuse_writes: Cell<bool>,
}

impl Wire {
    fn new() -> Self {
        Wire {
            rx: RefCell::new(VecDeque::new()),
            tx: RefCell::new(Vec::new()),
            transmitted: RefCell::new(Vec::new()),
            clock: Cell::new(Instant::now()),
            refuse_writes: Cell::new(false),
        }
    }

    fn advance_clock(&self, by: Duration) {
        self.clock.set(self.clock.get() + by);
    }

    fn transmitted(&self) -> Vec<u8> {
        self.transmitted.borrow().clone()
    }
}

impl SerialInterface for Wire {
    fn write(&self, bytes: &[u8]) -> Result<usize, IntfError> {
        if self.refuse_writes.get() {
            return Ok(0);
        }
        let mut tx = self.tx.borrow_mut();
        let accepted = bytes.len().min(TX_CAPACITY - tx.len());
        tx.extend_from_slice(&bytes[..accepted]);
        Ok(accepted)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, IntfError> {
        let mut rx = self.rx.borrow_mut();
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn rx_available(&self) -> usize {
        self.rx.borrow().len()
    }

    fn tx_free(&self) -> usize {
        TX_CAPACITY - self.tx.borrow().len()
    }

    fn tx_capacity(&self) -> usize {
        TX_CAPACITY
    }

    fn clear_rx(&self) -> Result<(), IntfError> {
        self.rx.borrow_mut().clear();
        Ok(())
    }

    fn clear_tx(&self) -> Result<(), IntfError> {
        self.tx.borrow_mut().clear();
        Ok(())
    }

    fn now(&self) -> Instant {
        self.clock.get()
    }
}

fn create() -> (Epos<Wire>, Node) {
    (create_epos(Wire::new(), Config::default()), create_node())
}

/// Moves pending host bytes to the node, queues its answers and notifies
/// the host once, the way a serial interrupt would.
fn pump(epos: &Epos<Wire>, node: &mut Node) {
    let wire = epos.interface();
    let bytes: Vec<u8> = wire.tx.borrow_mut().drain(..).collect();
    wire.transmitted.borrow_mut().extend_from_slice(&bytes);

    let answer = node.receive_all(&bytes);
    wire.rx.borrow_mut().extend(answer);

    epos.on_serial_event();
}

fn run(epos: &Epos<Wire>, node: &mut Node) -> ResponseStatus {
    for _ in 0..16 {
        if epos.poll_status() != ResponseStatus::Waiting {
            break;
        }
        pump(epos, node);
    }
    epos.poll_status()
}

#[test]
fn test_initialization() {
    let (epos, _) = create();
    assert_eq!(epos.poll_status(), ResponseStatus::None);
    assert_eq!(epos.config().baud_rate, 38400);
    assert_eq!(epos.config().timeout, Duration::from_millis(500));
}

#[test]
fn enable_operation_on_the_wire() {
    let (epos, mut node) = create();

    epos.write_object(0x6040, 0, 0, 0x0F).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);

    let mut expected = vec![
        0x11, 0x03, 0x40, 0x60, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, 0xB3, 0x47,
    ];
    expected.extend_from_slice(&[ACK_OK, ACK_OK]);
    assert_eq!(epos.interface().transmitted(), expected);

    assert_eq!(node.value(0x6040, 0), Some(0x0F));
    assert_eq!(node.completed(), 1);
    assert_eq!(epos.response_words(), Ok(2));
    assert_eq!(epos.read_response_dword(0), Ok(0));
}

#[test]
fn test_read() {
    let (epos, mut node) = create();
    node.set_value(0x6040, 0, 0x27);

    epos.read_object(0x6040, 0, 0).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);

    assert_eq!(epos.read_response_dword(0), Ok(0));
    assert_eq!(epos.read_response_dword(1), Ok(0x27));
    assert_eq!(epos.read_response_word(2), Ok(0x27));
    assert_eq!(epos.read_response_word(3), Ok(0));
    assert_eq!(epos.read_response_bytes(2), Ok((0x00, 0x27)));
    assert_eq!(epos.response_words(), Ok(4));
    assert_eq!(
        epos.read_response_dword(2),
        Err(EposError::OutOfRange {
            offset: 2,
            words: 4
        })
    );
}

#[test]
fn read_missing_object_reports_device_error_code() {
    let (epos, mut node) = create();

    epos.read_object(0x2000, 1, 0).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);
    assert_eq!(epos.read_response_dword(0), Ok(ERROR_OBJECT_NOT_EXIST));
}

#[test]
fn begin_ack_reject_sends_no_payload() {
    let (epos, mut node) = create();
    node.set_fault(Fault::RejectOpcode);

    epos.write_object(0x6040, 0, 0, 0x0F).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Error);
    assert_eq!(epos.interface().transmitted(), vec![0x11]);
    assert_eq!(epos.read_response_word(0), Err(EposError::NoResponse));
}

#[test]
fn end_ack_reject_is_an_error() {
    let (epos, mut node) = create();
    node.set_fault(Fault::RejectPayload);

    epos.write_object(0x6040, 0, 0, 0x0F).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Error);
    assert_eq!(node.value(0x6040, 0), None);
}

#[test]
fn bad_response_opcode_is_an_error() {
    let (epos, mut node) = create();
    node.set_fault(Fault::BadResponseOpcode);

    epos.read_object(0x6040, 0, 0).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Error);
    assert_eq!(epos.interface().transmitted().last(), Some(&ACK_FAIL));
}

#[test]
fn corrupted_response_crc_is_an_error() {
    let (epos, mut node) = create();
    node.set_value(0x6040, 0, 0x27);
    node.set_fault(Fault::CorruptResponseCrc);

    epos.read_object(0x6040, 0, 0).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Error);
    assert_eq!(node.last_ack(), Some(ACK_FAIL));
    assert_eq!(node.completed(), 0);
}

#[test]
fn busy_while_waiting() {
    let (epos, _) = create();

    epos.write_object(0x6040, 0, 0, 0x06).unwrap();
    assert_eq!(epos.poll_status(), ResponseStatus::Waiting);

    let first = epos.write_object(0x6040, 0, 0, 0x07);
    let second = epos.read_object(0x6040, 0, 0);
    assert_eq!(first, Err(EposError::Busy));
    assert_eq!(first, second);
    assert_eq!(epos.poll_status(), ResponseStatus::Waiting);
    assert_eq!(epos.interface().tx.borrow().as_slice(), &[0x11]);
}

#[test]
fn timeout_without_notifications() {
    let (epos, _) = create();
    let wire = epos.interface();

    epos.read_object(0x6040, 0, 0).unwrap();
    wire.advance_clock(Duration::from_millis(499));
    assert_eq!(epos.poll_status(), ResponseStatus::Waiting);

    wire.advance_clock(Duration::from_millis(1));
    assert_eq!(epos.poll_status(), ResponseStatus::Error);
    assert_eq!(epos.poll_status(), ResponseStatus::Error);
}

#[test]
fn silent_node_times_out_then_driver_recovers() {
    let (epos, mut node) = create();
    node.set_fault(Fault::Silent);

    epos.write_object(0x6040, 0, 0, 0x0F).unwrap();
    pump(&epos, &mut node);
    assert_eq!(epos.poll_status(), ResponseStatus::Waiting);

    epos.interface().advance_clock(Duration::from_millis(500));
    assert_eq!(epos.poll_status(), ResponseStatus::Error);

    node.set_fault(Fault::None);
    node.set_value(0x6040, 0, 0x0F);
    epos.read_object(0x6040, 0, 0).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);
    assert_eq!(epos.read_response_dword(1), Ok(0x0F));
}

#[test]
fn progress_rearms_the_timer() {
    let (epos, mut node) = create();
    let wire = epos.interface();

    epos.read_object(0x6040, 0, 0).unwrap();
    for _ in 0..3 {
        wire.advance_clock(Duration::from_millis(400));
        pump(&epos, &mut node);
        assert_eq!(epos.poll_status(), ResponseStatus::Waiting);
    }
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);
}

#[test]
fn serial_buffer_full_leaves_no_trace() {
    let (epos, mut node) = create();
    epos.interface().refuse_writes.set(true);

    assert_eq!(
        epos.write_object(0x6040, 0, 0, 0x0F),
        Err(EposError::SerialBufferFull)
    );
    assert_eq!(epos.poll_status(), ResponseStatus::None);

    epos.interface().refuse_writes.set(false);
    epos.write_object(0x6040, 0, 0, 0x0F).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);
}

#[test]
fn serial_buffer_full_keeps_previous_response() {
    let (epos, mut node) = create();
    node.set_value(0x6040, 0, 0x27);

    epos.read_object(0x6040, 0, 0).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);

    epos.interface().refuse_writes.set(true);
    assert_eq!(
        epos.write_object(0x6040, 0, 0, 0x0F),
        Err(EposError::SerialBufferFull)
    );
    assert_eq!(epos.poll_status(), ResponseStatus::Success);
    assert_eq!(epos.response_words(), Ok(4));
    assert_eq!(epos.read_response_dword(0), Ok(0));
    assert_eq!(epos.read_response_dword(1), Ok(0x27));
}

#[test]
fn answer_after_deadline_is_an_error() {
    let (epos, mut node) = create();
    node.set_value(0x6040, 0, 0x27);

    epos.read_object(0x6040, 0, 0).unwrap();
    pump(&epos, &mut node);
    assert_eq!(epos.status(), ResponseStatus::Waiting);

    // The node answers in full, but only once the deadline has passed
    epos.interface().advance_clock(Duration::from_millis(500));
    pump(&epos, &mut node);
    assert_eq!(epos.status(), ResponseStatus::Error);

    assert_eq!(run(&epos, &mut node), ResponseStatus::Error);
    assert_eq!(epos.read_response_dword(1), Err(EposError::NoResponse));
    assert_eq!(node.completed(), 0);
}

#[test]
fn consecutive_transactions() {
    let (epos, mut node) = create();

    epos.set_mode(0, Mode::Velocity).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);
    epos.set_target_velocity(0, -1000).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);
    epos.enable_operation(0).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);

    assert_eq!(node.value(MODES_OPERATION_INDEX, 0), Some(0xFE));
    assert_eq!(node.value(TARGET_VELOCITY_INDEX, 0), Some(-1000i32 as u32));
    assert_eq!(node.completed(), 3);

    epos.read_object(TARGET_VELOCITY_INDEX, 0, 0).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);
    assert_eq!(epos.read_response_dword(1).map(|v| v as i32), Ok(-1000));
}

#[test]
fn request_carries_node_id() {
    let (epos, mut node) = create();

    epos.shutdown(3).unwrap();
    assert_eq!(run(&epos, &mut node), ResponseStatus::Success);

    let request = node.last_request().unwrap();
    assert_eq!(request.address.node_id, 3);
    assert_eq!(request.address.index, 0x6040);
}
