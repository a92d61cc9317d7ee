pub mod line;

use crate::prelude::*;
use crate::inverter::packet::{self, DeviceFunction, ParsedResult};

use bytes::BytesMut;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub use line::{Direction, SerialLine, SerialPortLine};

/// Input registers holding the inverter serial number.
pub const PROBE_REGISTER: u16 = 115;
pub const PROBE_COUNT: u16 = 5;

const MISMATCH: &str = "Response mismatch";
const TIMEOUT: &str = "Timeout";

// {{{ TransportSettings
#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub response_timeout: Duration,
    pub inter_frame_delay: Duration,
    pub probe_backoff_base: Duration,
    pub probe_backoff_max: Duration,
    pub max_rx_buffer: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            inter_frame_delay: Duration::from_millis(50),
            probe_backoff_base: Duration::from_millis(5000),
            probe_backoff_max: Duration::from_millis(300_000),
            max_rx_buffer: 1024,
        }
    }
}

impl From<&config::SerialPort> for TransportSettings {
    fn from(config: &config::SerialPort) -> Self {
        Self {
            response_timeout: Duration::from_millis(config.response_timeout_ms()),
            inter_frame_delay: Duration::from_millis(config.inter_frame_delay_ms()),
            probe_backoff_base: Duration::from_millis(config.probe_backoff_base_ms()),
            probe_backoff_max: Duration::from_millis(config.probe_backoff_max_ms()),
            max_rx_buffer: config.max_rx_buffer(),
        }
    }
}
// }}}

// {{{ TransportStats
#[derive(Clone, Debug, Default, Serialize)]
pub struct TransportStats {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub crc_errors: u64,
    pub ignored_packets: u64,
    pub foreign_frames: u64,
    pub resyncs: u64,
    pub discarded_bytes: u64,
    pub probes: u64,
    pub probe_failures: u64,
}
// }}}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Uninitialized,
    Idle,
    ProbePending,
    AwaitingResponse,
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    function: u8,
    start_register: u16,
    probe: bool,
    sent_at: Instant,
}

/// A finished bus exchange: the decoded outcome and, when one arrived, the
/// inverter frame it was decoded from.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub result: ParsedResult,
    pub raw: Option<Vec<u8>>,
}

// {{{ Transport
/// Owns the serial line and runs one exchange at a time over it.
///
/// Nothing here blocks waiting for bytes: [`Transport::poll`] is called on a
/// steady tick and drains whatever has arrived, treating a quiet gap of
/// `inter_frame_delay` as the end of a frame.
pub struct Transport<L> {
    line: L,
    settings: TransportSettings,
    arbiter: Arc<GuardArbiter>,

    state: State,
    pending: Option<Pending>,
    rx: BytesMut,
    last_rx: Option<Instant>,
    result: Option<Exchange>,

    link_up: bool,
    inverter_serial: Serial,
    backoff: Duration,
    next_probe: Option<Instant>,
    probe_guard: Option<OperationGuard>,

    stats: TransportStats,
}

impl<L: SerialLine> Transport<L> {
    pub fn new(line: L, settings: TransportSettings, arbiter: Arc<GuardArbiter>) -> Self {
        let backoff = settings.probe_backoff_base;
        let rx = BytesMut::with_capacity(settings.max_rx_buffer);
        Self {
            line,
            settings,
            arbiter,
            state: State::Uninitialized,
            pending: None,
            rx,
            last_rx: None,
            result: None,
            link_up: false,
            inverter_serial: Serial::default(),
            backoff,
            next_probe: None,
            probe_guard: None,
            stats: TransportStats::default(),
        }
    }

    /// Moves to idle and schedules an immediate serial probe.
    pub fn begin(&mut self) {
        info!("rs485 transport starting");
        self.state = State::Idle;
        self.next_probe = Some(Instant::now());
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn inverter_serial(&self) -> Serial {
        self.inverter_serial
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn line(&self) -> &L {
        &self.line
    }

    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }

    /// Current probe backoff, i.e. the delay applied after the next failure.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn next_probe(&self) -> Option<Instant> {
        self.next_probe
    }

    /// True while any exchange (probe included) is outstanding.
    pub fn is_waiting(&self) -> bool {
        self.pending.is_some()
    }

    /// Hands over the outcome of the last client exchange, once.
    pub fn take_result(&mut self) -> Option<Exchange> {
        self.result.take()
    }

    fn check_ready(&mut self) -> Result<()> {
        if self.state == State::Uninitialized {
            bail!("transport not started");
        }
        if self.pending.is_some() {
            bail!("bus busy: request already outstanding");
        }
        if !self.link_up {
            // bring the next probe forward rather than waiting out the backoff
            self.next_probe = Some(Instant::now());
            bail!("link down: inverter serial unknown");
        }
        Ok(())
    }

    pub async fn send_read(&mut self, function: DeviceFunction, start: u16, count: u16) -> Result<()> {
        self.check_ready()?;
        let frame = packet::encode_read(function, start, count, self.inverter_serial)?;
        self.send_packet(&frame, function.into(), start, false).await
    }

    /// Sends a write. `WriteSingle` requires exactly one value.
    pub async fn send_write(
        &mut self,
        function: DeviceFunction,
        start: u16,
        values: &[u16],
    ) -> Result<()> {
        self.check_ready()?;
        let frame = match (function, values) {
            (DeviceFunction::WriteSingle, [value]) => {
                packet::encode_write_single(start, *value, self.inverter_serial)?
            }
            (DeviceFunction::WriteSingle, _) => {
                bail!("write single needs exactly one value, got {}", values.len())
            }
            (DeviceFunction::WriteMulti, _) => {
                packet::encode_write_multi(start, values, self.inverter_serial)?
            }
            (other, _) => bail!("{:?} is not a write function", other),
        };
        self.send_packet(&frame, function.into(), start, false).await
    }

    async fn send_packet(&mut self, frame: &[u8], function: u8, start: u16, probe: bool) -> Result<()> {
        if !self.rx.is_empty() {
            debug!("discarding {} stale bytes before send", self.rx.len());
            self.stats.discarded_bytes += self.rx.len() as u64;
            self.rx.clear();
        }
        self.result = None;

        debug!("TX {}", Utils::hex(frame));

        self.line.set_driver(true)?;
        let sent = self.line.transmit(frame).await;
        let released = self.line.set_driver(false);
        sent?;
        released?;

        self.pending = Some(Pending {
            function,
            start_register: start,
            probe,
            sent_at: Instant::now(),
        });
        self.last_rx = None;
        self.state = if probe {
            State::ProbePending
        } else {
            State::AwaitingResponse
        };
        self.stats.total_requests += 1;

        Ok(())
    }

    // {{{ poll
    /// One tick: gather bytes, process a finished frame, enforce the
    /// response window, and probe for the inverter when the link is down.
    pub async fn poll(&mut self) -> Result<()> {
        if self.state == State::Uninitialized {
            return Ok(());
        }

        let now = Instant::now();
        match self.line.drain(&mut self.rx) {
            Ok(0) => {}
            Ok(n) => {
                trace!("rx {} bytes ({} buffered)", n, self.rx.len());
                self.last_rx = Some(now);
            }
            Err(err) => warn!("serial read: {}", err),
        }

        if self.rx.len() > self.settings.max_rx_buffer {
            warn!(
                "rx buffer overflow ({} bytes), discarding",
                self.rx.len()
            );
            self.stats.discarded_bytes += self.rx.len() as u64;
            self.stats.resyncs += 1;
            self.rx.clear();
            self.last_rx = None;
        }

        let quiet = self
            .last_rx
            .is_some_and(|t| now.saturating_duration_since(t) >= self.settings.inter_frame_delay);
        if !self.rx.is_empty() && quiet {
            self.process_rx();
        }

        if let Some(pending) = self.pending {
            if now.saturating_duration_since(pending.sent_at) > self.settings.response_timeout {
                self.handle_timeout(pending);
            }
        }

        let probe_due = self.next_probe.is_some_and(|t| now >= t);
        if !self.link_up && self.pending.is_none() && probe_due {
            self.start_probe().await;
        }

        Ok(())
    }

    fn process_rx(&mut self) {
        let data = self.rx.split();

        let pending = match self.pending {
            Some(p) => p,
            None => {
                debug!("ignoring {} unsolicited bytes: {}", data.len(), Utils::hex_truncated(&data, 32));
                self.stats.ignored_packets += 1;
                return;
            }
        };

        debug!("RX {}", Utils::hex_truncated(&data, 64));

        let frames = packet::scan_frames(&data);
        let requests = frames.iter().filter(|f| f.is_request()).count();
        if requests > 0 {
            warn!("{} request frame(s) from another bus master", requests);
            self.stats.foreign_frames += requests as u64;
        }

        let found = packet::find_matching(&frames, pending.function, pending.start_register)
            .or_else(|| packet::find_exception(&frames, pending.function, pending.start_register));

        if let Some(i) = found {
            let frame = &frames[i];
            if frame.offset > 0 {
                debug!("response found at offset {}", frame.offset);
            }
            let result = frame.result.clone().unwrap_or_default();
            let raw = frame.bytes.to_vec();
            self.complete(pending, result, Some(raw));
            return;
        }

        // a frame that does not decode is noise shaped like a header
        let responses: Vec<_> = frames
            .iter()
            .filter(|f| !f.is_request())
            .filter(|f| {
                f.result
                    .as_ref()
                    .is_some_and(|r| r.success || r.is_exception())
            })
            .collect();
        if requests > 0 {
            // the other master's exchange; ours has yet to arrive
            trace!("no answer to our request among {} frame(s), waiting", frames.len());
            return;
        }

        if let Some(first) = responses.first() {
            let result = first.result.clone().unwrap_or_default();
            let error = match result.error {
                Some(ref e) if !result.success => e.clone(),
                _ => format!(
                    "{}: expected func 0x{:02X} start {}, got func 0x{:02X} start {}",
                    MISMATCH,
                    pending.function,
                    pending.start_register,
                    result.function,
                    result.start_register
                ),
            };
            warn!("{}", error);
            let raw = first.bytes.to_vec();
            self.complete(pending, ParsedResult::failed(error), Some(raw));
            return;
        }

        match packet::resync_offset(&data) {
            Some(offset) => {
                warn!("resync: discarding {} garbage bytes", offset);
                self.stats.resyncs += 1;
                self.stats.discarded_bytes += offset as u64;
                self.rx.extend_from_slice(&data[offset..]);
            }
            None => {
                warn!("no frame in {} bytes, discarding: {}", data.len(), Utils::hex_truncated(&data, 32));
                self.stats.discarded_bytes += data.len() as u64;
            }
        }
    }
    // }}}

    fn complete(&mut self, pending: Pending, result: ParsedResult, raw: Option<Vec<u8>>) {
        self.pending = None;
        self.state = State::Idle;

        if pending.probe {
            self.finish_probe(&result);
            return;
        }

        if result.crc_mismatch() {
            self.stats.crc_errors += 1;
        }
        if result.success {
            self.stats.successful += 1;
        } else {
            self.stats.failed += 1;
        }

        self.result = Some(Exchange { result, raw });
    }

    fn handle_timeout(&mut self, pending: Pending) {
        warn!(
            "no response for func 0x{:02X} start {} within {}ms",
            pending.function,
            pending.start_register,
            self.settings.response_timeout.as_millis()
        );

        if !self.rx.is_empty() {
            self.stats.discarded_bytes += self.rx.len() as u64;
            self.rx.clear();
        }
        self.last_rx = None;
        self.stats.timeouts += 1;

        if pending.probe {
            self.pending = None;
            self.state = State::Idle;
            self.probe_failed("timeout");
        } else {
            self.complete(pending, ParsedResult::failed(TIMEOUT), None);
        }
    }

    // {{{ probe
    async fn start_probe(&mut self) {
        let guard = match self.arbiter.try_acquire(GuardKind::BusOperation, "inverter serial probe") {
            Some(guard) => guard,
            None => {
                debug!("serial probe deferred, bus in use");
                return;
            }
        };

        self.stats.probes += 1;
        debug!("probing for inverter serial (attempt {})", self.stats.probes);

        let sent = match packet::encode_read(
            DeviceFunction::ReadInput,
            PROBE_REGISTER,
            PROBE_COUNT,
            self.inverter_serial,
        ) {
            Ok(frame) => {
                self.send_packet(&frame, DeviceFunction::ReadInput.into(), PROBE_REGISTER, true)
                    .await
            }
            Err(err) => Err(err),
        };

        match sent {
            Ok(()) => self.probe_guard = Some(guard),
            Err(err) => {
                drop(guard);
                self.probe_failed(&err.to_string());
            }
        }
    }

    fn finish_probe(&mut self, result: &ParsedResult) {
        if let Some(mut guard) = self.probe_guard.take() {
            guard.release();
        }

        let serial = Serial::from(&result.value_bytes()[..]);
        if result.success && result.values.len() == PROBE_COUNT as usize && serial.is_plausible() {
            if !self.link_up || serial != self.inverter_serial {
                info!("inverter serial {}, link up", serial);
            }
            self.inverter_serial = serial;
            self.link_up = true;
            self.backoff = self.settings.probe_backoff_base;
            self.next_probe = None;
        } else {
            let reason = match &result.error {
                Some(e) if !result.success => e.clone(),
                _ if serial.is_blank() => "inverter reported a blank serial".to_string(),
                _ => format!("implausible serial {:?}", serial),
            };
            self.probe_failed(&reason);
        }
    }

    fn probe_failed(&mut self, reason: &str) {
        if let Some(mut guard) = self.probe_guard.take() {
            guard.release();
        }

        self.stats.probe_failures += 1;
        if self.link_up {
            warn!("inverter link down: {}", reason);
        }
        self.link_up = false;
        self.next_probe = Some(Instant::now() + self.backoff);
        info!(
            "serial probe failed ({}), retry in {}ms",
            reason,
            self.backoff.as_millis()
        );
        self.backoff = (self.backoff * 2).min(self.settings.probe_backoff_max);
    }

    /// Marks the link down and schedules a probe now, e.g. after an
    /// operator-triggered reset.
    pub fn reprobe(&mut self) {
        self.link_up = false;
        self.next_probe = Some(Instant::now());
    }
    // }}}
}
// }}}
