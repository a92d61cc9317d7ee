use crate::prelude::*;
use crate::inverter::packet::{self as bus, DeviceFunction};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;

pub const PREFIX: [u8; 2] = [0xa1, 0x1a];
pub const REQUEST_PROTOCOL: u16 = 2;
pub const RESPONSE_PROTOCOL: u16 = 5;
pub const MIN_REQUEST_LEN: usize = 38;
pub const MIN_RESPONSE_LEN: usize = 37;
/// Bytes before the embedded data frame: prefix through `data_len`.
pub const HEADER_LEN: usize = 20;

const RESERVED: u8 = 1;

// header offsets
const PROTOCOL: usize = 2;
const FRAME_LEN: usize = 4;
const RESERVED_BYTE: usize = 6;
const TCP_FUNCTION: usize = 7;
const DONGLE_SERIAL: usize = 8;
const DATA_LEN: usize = 18;
// data frame offsets, relative to the start of the packet
const DATA: usize = HEADER_LEN;
const DEVICE_FUNCTION: usize = 21;
const INVERTER_SERIAL: usize = 22;
const START: usize = 32;
const COUNT_OR_VALUE: usize = 34;
const BYTE_COUNT: usize = 36;
const MULTI_VALUES: usize = 37;

// {{{ TcpFunction
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TcpFunction {
    Heartbeat = 193,
    TranslatedData = 194,
    ReadParam = 195,
    WriteParam = 196,
}
// }}}

// {{{ ParsedRequest
/// A translated-data request from a client, ready to be put on the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedRequest {
    pub function: DeviceFunction,
    pub start_register: u16,
    pub register_count: u16,
    /// Empty for reads.
    pub values: Vec<u16>,
    pub inverter: Serial,
    pub dongle: Serial,
}

impl ParsedRequest {
    pub fn read(function: DeviceFunction, start_register: u16, register_count: u16) -> Self {
        Self {
            function,
            start_register,
            register_count,
            values: Vec::new(),
            inverter: Serial::default(),
            dongle: Serial::default(),
        }
    }

    pub fn write(function: DeviceFunction, start_register: u16, values: Vec<u16>) -> Self {
        Self {
            function,
            start_register,
            register_count: values.len() as u16,
            values,
            inverter: Serial::default(),
            dongle: Serial::default(),
        }
    }

    pub fn is_write(&self) -> bool {
        self.function.is_write()
    }

    /// Human readable one-liner for logs, e.g. `READ_INPUT regs=115-119 (5 regs)`.
    pub fn describe(&self) -> String {
        let last = self
            .start_register
            .saturating_add(self.register_count.saturating_sub(1));
        match self.function {
            DeviceFunction::ReadHold => format!(
                "READ_HOLD regs={}-{} ({} regs)",
                self.start_register, last, self.register_count
            ),
            DeviceFunction::ReadInput => format!(
                "READ_INPUT regs={}-{} ({} regs)",
                self.start_register, last, self.register_count
            ),
            DeviceFunction::WriteSingle => format!(
                "WRITE_SINGLE reg={} val=0x{:04X}",
                self.start_register,
                self.values.first().copied().unwrap_or_default()
            ),
            DeviceFunction::WriteMulti => format!(
                "WRITE_MULTI regs={}-{} ({} vals)",
                self.start_register,
                last,
                self.values.len()
            ),
        }
    }

    /// The equivalent bus request frame, addressed to `inverter`.
    pub fn to_bus_frame(&self, inverter: Serial) -> Result<Vec<u8>> {
        match self.function {
            DeviceFunction::ReadHold | DeviceFunction::ReadInput => bus::encode_read(
                self.function,
                self.start_register,
                self.register_count,
                inverter,
            ),
            DeviceFunction::WriteSingle => {
                let value = self
                    .values
                    .first()
                    .copied()
                    .ok_or_else(|| anyhow!("write single without a value"))?;
                bus::encode_write_single(self.start_register, value, inverter)
            }
            DeviceFunction::WriteMulti => {
                bus::encode_write_multi(self.start_register, &self.values, inverter)
            }
        }
    }
}
// }}}

fn write_header(packet: &mut Vec<u8>, protocol: u16, total_len: usize, dongle: Serial) {
    packet.extend_from_slice(&PREFIX);
    packet.extend_from_slice(&protocol.to_le_bytes());
    packet.extend_from_slice(&((total_len - 6) as u16).to_le_bytes());
    packet.push(RESERVED);
    packet.push(TcpFunction::TranslatedData.into());
    packet.extend_from_slice(dongle.as_bytes());
}

// {{{ parse
/// Parses a client request. Structure, function codes, register count and
/// the CRC of the embedded data frame are all checked.
pub fn parse(data: &[u8]) -> Result<ParsedRequest> {
    if data.len() < MIN_REQUEST_LEN {
        bail!(
            "request too short: {} bytes (min {})",
            data.len(),
            MIN_REQUEST_LEN
        );
    }
    if data[..2] != PREFIX {
        bail!("invalid prefix {:02X} {:02X}", data[0], data[1]);
    }

    let tcp_function = data[TCP_FUNCTION];
    match TcpFunction::try_from(tcp_function) {
        Ok(TcpFunction::TranslatedData) => {}
        Ok(other) => bail!("unsupported tcp function {:?}", other),
        Err(_) => bail!("unknown tcp function 0x{:02X}", tcp_function),
    }

    let protocol = Utils::u16ify(data, PROTOCOL);
    if protocol != REQUEST_PROTOCOL {
        debug!("request protocol {} (expected {})", protocol, REQUEST_PROTOCOL);
    }
    if data[RESERVED_BYTE] != RESERVED {
        debug!("reserved byte is 0x{:02X}", data[RESERVED_BYTE]);
    }

    let function = DeviceFunction::try_from(data[DEVICE_FUNCTION])
        .map_err(|_| anyhow!("unsupported device function 0x{:02X}", data[DEVICE_FUNCTION]))?;
    let dongle = Serial::from(&data[DONGLE_SERIAL..DATA_LEN]);
    let inverter = Serial::from(&data[INVERTER_SERIAL..START]);
    let start_register = Utils::u16ify(data, START);
    let count_or_value = Utils::u16ify(data, COUNT_OR_VALUE);

    let (register_count, values, data_frame_len) = match function {
        DeviceFunction::ReadHold | DeviceFunction::ReadInput => {
            check_count(count_or_value)?;
            (count_or_value, Vec::new(), bus::REQUEST_LEN)
        }
        DeviceFunction::WriteSingle => (1, vec![count_or_value], bus::REQUEST_LEN),
        DeviceFunction::WriteMulti => {
            check_count(count_or_value)?;
            let byte_count = data[BYTE_COUNT] as usize;
            if byte_count != count_or_value as usize * 2 {
                bail!(
                    "byte count {} does not match {} registers",
                    byte_count,
                    count_or_value
                );
            }
            let data_frame_len = bus::MULTI_HEADER_LEN + byte_count + 2;
            if data.len() < DATA + data_frame_len {
                bail!(
                    "write multi truncated: {} bytes, need {}",
                    data.len(),
                    DATA + data_frame_len
                );
            }
            let values = data[MULTI_VALUES..MULTI_VALUES + byte_count]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            (count_or_value, values, data_frame_len)
        }
    };

    let crc_at = DATA + data_frame_len - 2;
    let calculated = bus::checksum(&data[DATA..crc_at]);
    let received = Utils::u16ify(data, crc_at);
    if calculated != received {
        bail!(
            "CRC mismatch: calculated=0x{:04X} received=0x{:04X}",
            calculated,
            received
        );
    }

    Ok(ParsedRequest {
        function,
        start_register,
        register_count,
        values,
        inverter,
        dongle,
    })
}

fn check_count(count: u16) -> Result<()> {
    if count == 0 || count > bus::MAX_REGISTERS {
        bail!(
            "invalid register count {} (must be 1-{})",
            count,
            bus::MAX_REGISTERS
        );
    }
    Ok(())
}
// }}}

// {{{ build
/// Wraps a bus request for `request` in a client frame, as a client would send it.
pub fn build_request(dongle: Serial, request: &ParsedRequest) -> Result<Vec<u8>> {
    let data_frame = request.to_bus_frame(request.inverter)?;
    let total_len = HEADER_LEN + data_frame.len();

    let mut packet = Vec::with_capacity(total_len);
    write_header(&mut packet, REQUEST_PROTOCOL, total_len, dongle);
    packet.extend_from_slice(&(data_frame.len() as u16).to_le_bytes());
    packet.extend_from_slice(&data_frame);
    Ok(packet)
}

/// Wraps a complete inverter response frame (CRC included) for the client.
///
/// The inverter's own CRC is dropped and a fresh one computed over the
/// embedded frame, address byte included.
pub fn build_response(dongle: Serial, bus_frame: &[u8]) -> Result<Vec<u8>> {
    let is_exception = bus_frame.len() > 1 && bus_frame[1] & bus::EXCEPTION_FLAG != 0;
    let min = if is_exception {
        bus::EXCEPTION_LEN
    } else {
        bus::WRITE_RESPONSE_LEN
    };
    if bus_frame.len() < min {
        bail!(
            "inverter frame too short to forward: {} bytes (min {})",
            bus_frame.len(),
            min
        );
    }

    let data_frame = &bus_frame[..bus_frame.len() - 2];
    let total_len = HEADER_LEN + data_frame.len() + 2;

    let mut packet = Vec::with_capacity(total_len);
    write_header(&mut packet, RESPONSE_PROTOCOL, total_len, dongle);
    packet.extend_from_slice(&(data_frame.len() as u16).to_le_bytes());
    packet.extend_from_slice(data_frame);
    packet.extend_from_slice(&bus::checksum(data_frame).to_le_bytes());
    Ok(packet)
}
// }}}

/// The embedded inverter frame of a response built by [`build_response`], without CRC.
pub fn response_data_frame(packet: &[u8]) -> Result<&[u8]> {
    if packet.len() < MIN_RESPONSE_LEN || packet[..2] != PREFIX {
        bail!("not a client response frame");
    }
    let data_len = Utils::u16ify(packet, DATA_LEN) as usize;
    if packet.len() < DATA + data_len + 2 {
        bail!("response truncated");
    }
    Ok(&packet[DATA..DATA + data_len])
}

/// Total frame length declared by a client frame header, if enough bytes are present.
pub fn declared_len(header: &[u8]) -> Option<usize> {
    if header.len() < FRAME_LEN + 2 {
        return None;
    }
    Some(Utils::u16ify(header, FRAME_LEN) as usize + 6)
}
