use crate::*;

use thiserror::Error;

const XMODEM: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// Data words of a write object request: index, subindex + node id, value
pub const WRITE_REQUEST_WORDS: usize = 4;
/// Data words of a read object request: index, subindex + node id
pub const READ_REQUEST_WORDS: usize = 2;

/// Opcode and length bytes ahead of the data, CRC after it
const REQUEST_OVERHEAD: usize = 4;
/// Length byte ahead of the data, CRC after it
const RESPONSE_OVERHEAD: usize = 3;

/// Reasons a frame fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),
    #[error("unknown opcode 0x{0:02X}")]
    Opcode(u8),
    #[error("length field {got} does not match {expected}")]
    Length { expected: u8, got: u8 },
    #[error("crc mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    Crc { computed: u16, received: u16 },
    #[error("frame carries {0} data words")]
    WordCount(usize),
}

/// Most data words a response payload can carry
pub const MAX_RESPONSE_WORDS: usize = (MAX_FRAME_SIZE - RESPONSE_OVERHEAD) / 2;

/// Decoded object dictionary request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Read,
    Write(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub address: ObjectAddress,
    pub command: CommandType,
}

/// Folds a single byte into the CRC, MSB first with polynomial 0x1021.
pub fn crc_byte(crc: u16, byte: u8) -> u16 {
    crc_data(crc, &[byte])
}

/// Folds a byte sequence into the CRC. An empty sequence returns `crc`.
pub fn crc_data(crc: u16, bytes: &[u8]) -> u16 {
    let mut digest = XMODEM.digest_with_initial(crc);
    digest.update(bytes);
    digest.finalize()
}

/// Number of bytes the device sends after its response opcode
pub const fn response_len(words: usize) -> usize {
    words * 2 + RESPONSE_OVERHEAD
}

/// Number of bytes of a request frame carrying `words` data words
pub const fn request_len(words: usize) -> usize {
    words * 2 + REQUEST_OVERHEAD
}

fn put_crc(buf: &mut [u8], at: usize, crc: u16) {
    buf[at..at + 2].copy_from_slice(&crc.to_le_bytes());
}

fn get_crc(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn put_address(buf: &mut [u8], address: &ObjectAddress) {
    buf[0..2].copy_from_slice(&address.index.to_le_bytes());
    buf[2] = address.subindex;
    buf[3] = address.node_id;
}

/// Encodes a write object request into `buf`, returning the frame length
pub fn encode_write(buf: &mut [u8; MAX_FRAME_SIZE], address: &ObjectAddress, data: u32) -> usize {
    let len = request_len(WRITE_REQUEST_WORDS);

    buf[0] = OPCODE_WRITE_OBJECT;
    buf[1] = (WRITE_REQUEST_WORDS - 1) as u8;
    put_address(&mut buf[2..6], address);
    buf[6..10].copy_from_slice(&data.to_le_bytes());
    let crc = crc_data(0, &buf[..len - 2]);
    put_crc(buf, len - 2, crc);

    len
}

/// Encodes a read object request into `buf`, returning the frame length
pub fn encode_read(buf: &mut [u8; MAX_FRAME_SIZE], address: &ObjectAddress) -> usize {
    let len = request_len(READ_REQUEST_WORDS);

    buf[0] = OPCODE_READ_OBJECT;
    buf[1] = (READ_REQUEST_WORDS - 1) as u8;
    put_address(&mut buf[2..6], address);
    let crc = crc_data(0, &buf[..len - 2]);
    put_crc(buf, len - 2, crc);

    len
}

/// Decodes a complete request frame, opcode included.
pub fn decode_request(frame: &[u8]) -> Result<Request, FrameError> {
    if frame.len() < 2 {
        return Err(FrameError::Truncated(frame.len()));
    }

    let words = match frame[0] {
        OPCODE_READ_OBJECT => READ_REQUEST_WORDS,
        OPCODE_WRITE_OBJECT => WRITE_REQUEST_WORDS,
        other => return Err(FrameError::Opcode(other)),
    };

    if frame[1] as usize != words - 1 {
        return Err(FrameError::Length {
            expected: (words - 1) as u8,
            got: frame[1],
        });
    }

    let len = request_len(words);
    if frame.len() < len {
        return Err(FrameError::Truncated(frame.len()));
    }

    let computed = crc_data(0, &frame[..len - 2]);
    let received = get_crc(frame, len - 2);
    if computed != received {
        return Err(FrameError::Crc { computed, received });
    }

    let address = ObjectAddress {
        index: u16::from_le_bytes([frame[2], frame[3]]),
        subindex: frame[4],
        node_id: frame[5],
    };

    let command = if frame[0] == OPCODE_WRITE_OBJECT {
        CommandType::Write(u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]))
    } else {
        CommandType::Read
    };

    Ok(Request { address, command })
}

/// Encodes the payload a device sends after its response opcode:
/// length, data words and CRC. A trailing odd byte of `data` is ignored.
pub fn encode_response(buf: &mut [u8; MAX_FRAME_SIZE], data: &[u8]) -> Result<usize, FrameError> {
    let words = data.len() / 2;
    if words == 0 || words > MAX_RESPONSE_WORDS {
        return Err(FrameError::WordCount(words));
    }
    let len = response_len(words);

    buf[0] = (words - 1) as u8;
    buf[1..1 + words * 2].copy_from_slice(&data[..words * 2]);
    let crc = crc_data(0, &buf[..len - 2]);
    put_crc(buf, len - 2, crc);

    Ok(len)
}

/// Validates a response payload carrying `words` data words.
pub fn check_response(payload: &[u8], words: usize) -> Result<(), FrameError> {
    if words == 0 || words > MAX_RESPONSE_WORDS {
        return Err(FrameError::WordCount(words));
    }
    let len = response_len(words);
    if payload.len() < len {
        return Err(FrameError::Truncated(payload.len()));
    }

    if payload[0] as usize != words - 1 {
        return Err(FrameError::Length {
            expected: (words - 1) as u8,
            got: payload[0],
        });
    }

    let computed = crc_data(0, &payload[..len - 2]);
    let received = get_crc(payload, len - 2);
    if computed != received {
        return Err(FrameError::Crc { computed, received });
    }

    Ok(())
}

/// Data word `windex` of a response payload, length byte excluded
pub fn word_at(data: &[u8], windex: usize) -> Option<u16> {
    let at = windex * 2;
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Data double word `dindex` of a response payload, length byte excluded
pub fn dword_at(data: &[u8], dindex: usize) -> Option<u32> {
    let at = dindex * 4;
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
