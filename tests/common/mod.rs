#![allow(dead_code)]

pub use lux_dongle_bridge::bridge::{Bridge, BridgeSettings, ClientHandle, ClientSink};
pub use lux_dongle_bridge::client::packet::ParsedRequest;
pub use lux_dongle_bridge::inverter::packet::{self as bus, DeviceFunction};
pub use lux_dongle_bridge::prelude::*;
pub use lux_dongle_bridge::rs485::{SerialLine, Transport, TransportSettings};

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// {{{ MockLine
type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Scripted serial line: records what is transmitted and hands out
/// whatever the test queues up.
#[derive(Default)]
pub struct MockLine {
    pub sent: Vec<Vec<u8>>,
    pub driver: Vec<bool>,
    pub inbound: BytesMut,
    pub responder: Option<Responder>,
    pub fail_transmit: bool,
}

impl MockLine {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    pub fn last_sent(&self) -> Option<&Vec<u8>> {
        self.sent.last()
    }

    /// Answers every probe with `serial`.
    pub fn answering_probes(serial: Serial) -> Self {
        Self {
            responder: Some(Box::new(move |frame| {
                let probe = frame[1] == 0x04 && Utils::u16ify(frame, 12) == 115;
                probe.then(|| Factory::probe_response(serial))
            })),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SerialLine for MockLine {
    fn set_driver(&mut self, transmit: bool) -> Result<()> {
        self.driver.push(transmit);
        Ok(())
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        if self.fail_transmit {
            bail!("mock transmit failure");
        }
        self.sent.push(frame.to_vec());
        if let Some(responder) = self.responder.as_mut() {
            if let Some(reply) = responder(frame) {
                self.inbound.extend_from_slice(&reply);
            }
        }
        Ok(())
    }

    fn drain(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = self.inbound.len();
        buf.extend_from_slice(&self.inbound);
        self.inbound.clear();
        Ok(n)
    }
}
// }}}

// {{{ RecordingClient
pub struct RecordingClient {
    pub sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn responses(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ClientSink for RecordingClient {
    fn peer(&self) -> String {
        "test-client".to_string()
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            bail!("closed");
        }
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
// }}}

// {{{ Factory
pub struct Factory;

impl Factory {
    pub fn inverter_serial() -> Serial {
        Serial::from("AB12345678")
    }

    pub fn dongle_serial() -> Serial {
        Serial::from("0123456789")
    }

    fn finish(mut frame: Vec<u8>) -> Vec<u8> {
        let crc = bus::checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    fn head(function: u8, serial: Serial, start: u16) -> Vec<u8> {
        let mut frame = vec![0x01, function];
        frame.extend_from_slice(serial.as_bytes());
        frame.extend_from_slice(&start.to_le_bytes());
        frame
    }

    pub fn read_response(function: u8, start: u16, values: &[u16], serial: Serial) -> Vec<u8> {
        let mut frame = Self::head(function, serial, start);
        frame.push((values.len() * 2) as u8);
        for v in values {
            frame.extend_from_slice(&v.to_le_bytes());
        }
        Self::finish(frame)
    }

    pub fn write_single_response(start: u16, value: u16, serial: Serial) -> Vec<u8> {
        let mut frame = Self::head(0x06, serial, start);
        frame.extend_from_slice(&value.to_le_bytes());
        Self::finish(frame)
    }

    pub fn write_multi_response(start: u16, count: u16, serial: Serial) -> Vec<u8> {
        let mut frame = Self::head(0x10, serial, start);
        frame.extend_from_slice(&count.to_le_bytes());
        Self::finish(frame)
    }

    pub fn exception_response(function: u8, start: u16, code: u8, serial: Serial) -> Vec<u8> {
        let mut frame = Self::head(function | 0x80, serial, start);
        frame.push(code);
        Self::finish(frame)
    }

    pub fn probe_response(serial: Serial) -> Vec<u8> {
        let values: Vec<u16> = serial
            .as_bytes()
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Self::read_response(0x04, 115, &values, serial)
    }

    pub fn input_values(count: u16) -> Vec<u16> {
        (0..count).map(|i| 1000 + i).collect()
    }

    fn client_frame(mut request: ParsedRequest) -> Vec<u8> {
        request.inverter = Self::inverter_serial();
        lux_dongle_bridge::client::packet::build_request(Self::dongle_serial(), &request)
            .expect("build_request")
    }

    pub fn client_read(function: DeviceFunction, start: u16, count: u16) -> Vec<u8> {
        Self::client_frame(ParsedRequest::read(function, start, count))
    }

    pub fn client_write_single(start: u16, value: u16) -> Vec<u8> {
        Self::client_frame(ParsedRequest::write(DeviceFunction::WriteSingle, start, vec![value]))
    }

    pub fn client_write_multi(start: u16, values: Vec<u16>) -> Vec<u8> {
        Self::client_frame(ParsedRequest::write(DeviceFunction::WriteMulti, start, values))
    }
}
// }}}

// {{{ bridge helpers
pub const SETTLE: Duration = Duration::from_millis(60);

/// Polls, waits out the inter-frame gap and polls again so buffered bytes
/// get processed.
pub async fn settle<L: SerialLine>(bridge: &mut Bridge<L>) {
    bridge.poll().await;
    tokio::time::advance(SETTLE).await;
    bridge.poll().await;
}

/// Bridge on a mock line whose link has come up through a real probe.
/// Needs paused time.
pub async fn linked_bridge() -> (Bridge<MockLine>, Arc<GuardArbiter>) {
    let arbiter = GuardArbiter::new();
    let line = MockLine::answering_probes(Factory::inverter_serial());
    let transport = Transport::new(line, TransportSettings::default(), arbiter.clone());
    let mut bridge = Bridge::new(transport, arbiter.clone(), BridgeSettings::default());

    bridge.transport_mut().begin();
    bridge.poll().await; // probe goes out, reply queued
    settle(&mut bridge).await;

    assert!(bridge.transport().is_link_up(), "probe did not bring link up");
    assert_eq!(bridge.transport().inverter_serial(), Factory::inverter_serial());

    (bridge, arbiter)
}

/// Queues `reply` on the line and lets the bridge pick it up.
pub async fn reply_with(bridge: &mut Bridge<MockLine>, reply: &[u8]) {
    bridge.transport_mut().line_mut().feed(reply);
    settle(bridge).await;
}
// }}}
