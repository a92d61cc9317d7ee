use crate::prelude::*;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;

pub const REQUEST_ADDRESS: u8 = 0x00;
pub const RESPONSE_ADDRESS: u8 = 0x01;
pub const EXCEPTION_FLAG: u8 = 0x80;

pub const REQUEST_LEN: usize = 18;
pub const WRITE_RESPONSE_LEN: usize = 18;
pub const EXCEPTION_LEN: usize = 17;
pub const MIN_RESPONSE_LEN: usize = 17;
pub const MAX_REGISTERS: u16 = 127;
/// Write multi request bytes before the value block.
pub const MULTI_HEADER_LEN: usize = 17;

pub const CRC_MISMATCH: &str = "CRC mismatch";

// field offsets shared by requests and responses
const FUNC: usize = 1;
const SERIAL: usize = 2;
const START: usize = 12;
const COUNT_OR_VALUE: usize = 14;
const READ_DATA: usize = 15;
const MULTI_BYTE_COUNT: usize = 16;
const MULTI_DATA: usize = 17;

// {{{ DeviceFunction
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceFunction {
    ReadHold = 3,
    ReadInput = 4,
    WriteSingle = 6,
    WriteMulti = 16,
}

impl DeviceFunction {
    pub fn is_read(self) -> bool {
        matches!(self, Self::ReadHold | Self::ReadInput)
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    fn is_known(func: u8) -> bool {
        Self::try_from(func & !EXCEPTION_FLAG).is_ok()
    }
}
// }}}

// {{{ ExceptionCode
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 1,
    IllegalDataAddress = 2,
    IllegalDataValue = 3,
    SlaveDeviceFailure = 4,
}

impl ExceptionCode {
    pub fn describe(code: u8) -> &'static str {
        match Self::try_from(code) {
            Ok(Self::IllegalFunction) => "Illegal function",
            Ok(Self::IllegalDataAddress) => "Illegal data address",
            Ok(Self::IllegalDataValue) => "Illegal data value",
            Ok(Self::SlaveDeviceFailure) => "Slave device failure",
            Err(_) => "Unknown exception",
        }
    }
}
// }}}

// {{{ ParsedResult
/// Outcome of decoding one response frame from the bus.
///
/// `function` never carries the exception bit; an exception response sets
/// `exception` instead. A CRC mismatch still yields `success == true` with
/// `error` set to [`CRC_MISMATCH`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedResult {
    pub success: bool,
    pub function: u8,
    pub start_register: u16,
    pub register_count: u16,
    pub values: Vec<u16>,
    pub serial: Serial,
    pub exception: Option<u8>,
    pub error: Option<String>,
}

impl ParsedResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn crc_mismatch(&self) -> bool {
        self.error.as_deref() == Some(CRC_MISMATCH)
    }

    /// The register values as the raw little-endian bytes they arrived as.
    pub fn value_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}
// }}}

// {{{ BusRequest
/// A request frame as seen on the bus, whether ours or another master's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusRequest {
    pub function: DeviceFunction,
    pub serial: Serial,
    pub start_register: u16,
    pub register_count: u16,
    pub values: Vec<u16>,
}
// }}}

// {{{ Frame
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameKind {
    Request,
    Response,
}

/// One frame found by [`scan_frames`], borrowing the buffer it was found in.
#[derive(Clone, Debug)]
pub struct Frame<'a> {
    pub offset: usize,
    pub bytes: &'a [u8],
    pub kind: FrameKind,
    pub result: Option<ParsedResult>,
}

impl Frame<'_> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_request(&self) -> bool {
        self.kind == FrameKind::Request
    }
}
// }}}

pub fn checksum(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

fn append_checksum(frame: &mut Vec<u8>) {
    let crc = checksum(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

fn checksum_ok(frame: &[u8]) -> bool {
    let body = frame.len() - 2;
    checksum(&frame[..body]) == Utils::u16ify(frame, body)
}

fn header(function: u8, serial: Serial, start_register: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REQUEST_LEN);
    frame.push(REQUEST_ADDRESS);
    frame.push(function);
    frame.extend_from_slice(serial.as_bytes());
    frame.extend_from_slice(&start_register.to_le_bytes());
    frame
}

fn check_count(count: usize) -> Result<()> {
    if count == 0 || count > MAX_REGISTERS as usize {
        bail!("register count {} out of range 1..={}", count, MAX_REGISTERS);
    }
    Ok(())
}

// {{{ encoding
/// Builds an 18-byte read request (holding or input registers).
pub fn encode_read(
    function: DeviceFunction,
    start_register: u16,
    count: u16,
    serial: Serial,
) -> Result<Vec<u8>> {
    if !function.is_read() {
        bail!("{:?} is not a read function", function);
    }
    check_count(count as usize)?;

    let mut frame = header(function.into(), serial, start_register);
    frame.extend_from_slice(&count.to_le_bytes());
    append_checksum(&mut frame);
    Ok(frame)
}

pub fn encode_write_single(start_register: u16, value: u16, serial: Serial) -> Result<Vec<u8>> {
    let mut frame = header(DeviceFunction::WriteSingle.into(), serial, start_register);
    frame.extend_from_slice(&value.to_le_bytes());
    append_checksum(&mut frame);
    Ok(frame)
}

/// `[addr][0x10][serial][start][count][byte_count][values..][crc]`, 19 + 2n bytes.
pub fn encode_write_multi(start_register: u16, values: &[u16], serial: Serial) -> Result<Vec<u8>> {
    check_count(values.len())?;

    let mut frame = header(DeviceFunction::WriteMulti.into(), serial, start_register);
    frame.extend_from_slice(&(values.len() as u16).to_le_bytes());
    frame.push((values.len() * 2) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    append_checksum(&mut frame);
    Ok(frame)
}

/// Write single when exactly one value is given, write multi otherwise.
pub fn encode_write(start_register: u16, values: &[u16], serial: Serial) -> Result<Vec<u8>> {
    match values {
        [value] => encode_write_single(start_register, *value, serial),
        _ => encode_write_multi(start_register, values, serial),
    }
}
// }}}

// {{{ classification
pub fn is_request(data: &[u8]) -> bool {
    data.first() == Some(&REQUEST_ADDRESS)
}

/// Structural check: response address, a known function code, and at least
/// the minimum size for a normal or exception response as applicable.
pub fn is_valid_response(data: &[u8]) -> bool {
    if data.len() < 2 {
        return false;
    }

    let func = data[FUNC];
    let min = if func & EXCEPTION_FLAG != 0 {
        EXCEPTION_LEN
    } else {
        MIN_RESPONSE_LEN
    };

    data.len() >= min && data[0] == RESPONSE_ADDRESS && DeviceFunction::is_known(func)
}

/// Length of the frame starting at `frame[0]`, or 0 when it cannot be
/// determined from the bytes available.
pub fn frame_length(frame: &[u8]) -> usize {
    if frame.len() < 2 {
        return 0;
    }

    let func = frame[FUNC];

    match frame[0] {
        REQUEST_ADDRESS => {
            if DeviceFunction::try_from(func).is_err() {
                0
            } else if func == u8::from(DeviceFunction::WriteMulti) {
                if frame.len() > MULTI_BYTE_COUNT {
                    MULTI_HEADER_LEN + frame[MULTI_BYTE_COUNT] as usize + 2
                } else {
                    0
                }
            } else {
                REQUEST_LEN
            }
        }
        RESPONSE_ADDRESS => {
            if func & EXCEPTION_FLAG != 0 {
                return if DeviceFunction::is_known(func) {
                    EXCEPTION_LEN
                } else {
                    0
                };
            }
            match DeviceFunction::try_from(func) {
                Ok(f) if f.is_read() => {
                    if frame.len() > COUNT_OR_VALUE {
                        MIN_RESPONSE_LEN + frame[COUNT_OR_VALUE] as usize
                    } else {
                        0
                    }
                }
                Ok(_) => WRITE_RESPONSE_LEN,
                Err(_) => 0,
            }
        }
        _ => 0,
    }
}
// }}}

// {{{ decoding
/// Decodes a request frame, rejecting bad structure or checksum.
pub fn decode_request(data: &[u8]) -> Result<BusRequest> {
    if data.len() < REQUEST_LEN {
        bail!("request too short: {} bytes", data.len());
    }
    if data[0] != REQUEST_ADDRESS {
        bail!("not a request: address 0x{:02X}", data[0]);
    }

    let function = DeviceFunction::try_from(data[FUNC])
        .map_err(|_| anyhow!("unknown request function 0x{:02X}", data[FUNC]))?;
    let len = frame_length(data);
    if len == 0 || data.len() < len {
        bail!("request truncated: have {} bytes, need {}", data.len(), len);
    }
    let frame = &data[..len];
    if !checksum_ok(frame) {
        bail!("request {}", CRC_MISMATCH);
    }

    let serial = Serial::from(&frame[SERIAL..START]);
    let start_register = Utils::u16ify(frame, START);
    let count_or_value = Utils::u16ify(frame, COUNT_OR_VALUE);

    let (register_count, values) = match function {
        DeviceFunction::ReadHold | DeviceFunction::ReadInput => (count_or_value, Vec::new()),
        DeviceFunction::WriteSingle => (1, vec![count_or_value]),
        DeviceFunction::WriteMulti => {
            let values: Vec<u16> = frame[MULTI_DATA..len - 2]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            if values.len() != count_or_value as usize {
                bail!(
                    "write multi declares {} registers but carries {}",
                    count_or_value,
                    values.len()
                );
            }
            (count_or_value, values)
        }
    };

    Ok(BusRequest {
        function,
        serial,
        start_register,
        register_count,
        values,
    })
}

/// Decodes a response frame. Trailing bytes past the declared frame length
/// (a concatenated frame) are ignored.
pub fn decode(data: &[u8]) -> ParsedResult {
    if !is_valid_response(data) {
        debug!("invalid response: {}", Utils::hex_truncated(data, 32));
        return ParsedResult::failed("Invalid response packet");
    }

    let func = data[FUNC];
    if func & EXCEPTION_FLAG != 0 {
        return decode_exception(data);
    }

    match DeviceFunction::try_from(func) {
        Ok(f) if f.is_read() => decode_read(data, func),
        Ok(DeviceFunction::WriteSingle) => decode_write(data, func, true),
        Ok(_) => decode_write(data, func, false),
        Err(_) => ParsedResult::failed("Unknown function code in response"),
    }
}

fn verify_checksum(frame: &[u8], result: &mut ParsedResult) {
    if !checksum_ok(frame) {
        // tolerated: the inverter emits occasional CRC noise on otherwise good frames
        warn!(
            "{}: calculated=0x{:04X} received=0x{:04X} frame={}",
            CRC_MISMATCH,
            checksum(&frame[..frame.len() - 2]),
            Utils::u16ify(frame, frame.len() - 2),
            Utils::hex_truncated(frame, 32)
        );
        result.error = Some(CRC_MISMATCH.to_string());
    }
}

fn decode_read(data: &[u8], func: u8) -> ParsedResult {
    let byte_count = data[COUNT_OR_VALUE] as usize;
    let len = MIN_RESPONSE_LEN + byte_count;
    if data.len() < len {
        return ParsedResult::failed(format!(
            "Response packet too short: got {}, expected {}",
            data.len(),
            len
        ));
    }
    if data.len() > len {
        debug!("{} bytes trail the read response", data.len() - len);
    }

    let frame = &data[..len];
    let values: Vec<u16> = frame[READ_DATA..READ_DATA + byte_count]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    let mut result = ParsedResult {
        success: true,
        function: func,
        start_register: Utils::u16ify(frame, START),
        register_count: values.len() as u16,
        values,
        serial: Serial::from(&frame[SERIAL..START]),
        ..Default::default()
    };
    verify_checksum(frame, &mut result);
    result
}

fn decode_write(data: &[u8], func: u8, single: bool) -> ParsedResult {
    if data.len() < WRITE_RESPONSE_LEN {
        return ParsedResult::failed(format!(
            "Response packet too short: got {}, expected {}",
            data.len(),
            WRITE_RESPONSE_LEN
        ));
    }

    let frame = &data[..WRITE_RESPONSE_LEN];
    let echoed = Utils::u16ify(frame, COUNT_OR_VALUE);
    let (register_count, values) = if single {
        (1, vec![echoed])
    } else {
        (echoed, Vec::new())
    };

    let mut result = ParsedResult {
        success: true,
        function: func,
        start_register: Utils::u16ify(frame, START),
        register_count,
        values,
        serial: Serial::from(&frame[SERIAL..START]),
        ..Default::default()
    };
    verify_checksum(frame, &mut result);
    result
}

fn decode_exception(data: &[u8]) -> ParsedResult {
    let frame = &data[..EXCEPTION_LEN];
    let function = frame[FUNC] & !EXCEPTION_FLAG;
    let start_register = Utils::u16ify(frame, START);
    let code = frame[COUNT_OR_VALUE];

    let message = format!(
        "Modbus Exception 0x{:x}: {} (register {})",
        code,
        ExceptionCode::describe(code),
        start_register
    );
    warn!("inverter exception: func=0x{:02X} {}", frame[FUNC], message);

    if !checksum_ok(frame) {
        warn!("{} on exception frame {}", CRC_MISMATCH, Utils::hex(frame));
    }

    ParsedResult {
        success: false,
        function,
        start_register,
        serial: Serial::from(&frame[SERIAL..START]),
        exception: Some(code),
        error: Some(message),
        ..Default::default()
    }
}
// }}}

// {{{ multi-frame handling
/// Splits a receive buffer into the frames it contains.
///
/// A second master on the bus can leave its request, the inverter's answer
/// to it and our own answer back to back. Unrecognisable bytes are skipped
/// one at a time, so the walk always terminates inside the buffer.
pub fn scan_frames(data: &[u8]) -> Vec<Frame<'_>> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while data.len() - offset >= 2 {
        let rest = &data[offset..];
        let kind = match rest[0] {
            REQUEST_ADDRESS => FrameKind::Request,
            RESPONSE_ADDRESS => FrameKind::Response,
            _ => {
                offset += 1;
                continue;
            }
        };

        let len = frame_length(rest);
        if len == 0 || len > rest.len() {
            offset += 1;
            continue;
        }

        let bytes = &rest[..len];
        let result = match kind {
            FrameKind::Request => None,
            FrameKind::Response => Some(decode(bytes)),
        };
        trace!(
            "frame[{}]: {:?} at offset {}, len {}",
            frames.len(),
            kind,
            offset,
            len
        );

        frames.push(Frame {
            offset,
            bytes,
            kind,
            result,
        });
        offset += len;
    }

    frames
}

/// Index of the first successful response answering `function` at `start_register`.
pub fn find_matching(frames: &[Frame], function: u8, start_register: u16) -> Option<usize> {
    frames.iter().position(|frame| {
        !frame.is_request()
            && frame.result.as_ref().is_some_and(|r| {
                r.success && r.function == function && r.start_register == start_register
            })
    })
}

/// Index of the first exception response for `function` at `start_register`.
pub fn find_exception(frames: &[Frame], function: u8, start_register: u16) -> Option<usize> {
    frames.iter().position(|frame| {
        frame.result.as_ref().is_some_and(|r| {
            r.is_exception() && r.function == function && r.start_register == start_register
        })
    })
}

/// Offset of the next plausible response start (response address followed by
/// a known function code) after the first byte, if any.
pub fn resync_offset(data: &[u8]) -> Option<usize> {
    (1..data.len().saturating_sub(1))
        .find(|&i| data[i] == RESPONSE_ADDRESS && DeviceFunction::is_known(data[i + 1]))
}
// }}}
