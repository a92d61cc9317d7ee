pub mod cache;

use crate::prelude::*;
use crate::client::packet::{self as client_packet, ParsedRequest};
use crate::inverter::packet::{DeviceFunction, ParsedResult};
use crate::rs485::{Exchange, SerialLine, Transport, TransportStats};
use crate::tcp_server::ServerStats;

use bytes::Bytes;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

pub use cache::{CacheEntry, CacheKey, CacheStats, FallbackCache};

const MISMATCH: &str = "Response mismatch (collision?)";
const REQUEST_TIMEOUT: &str = "Request timeout";

// {{{ client boundary
/// Where a response for a client request goes.
pub trait ClientSink: Send + Sync {
    fn peer(&self) -> String;
    fn send(&self, data: &[u8]) -> Result<()>;
    /// Drops the connection; used when no meaningful reply can be built.
    fn close(&self);
}

pub type ClientHandle = Arc<dyn ClientSink>;

/// One complete client frame and the connection it arrived on.
#[derive(Clone)]
pub struct ClientRequest {
    pub bytes: Bytes,
    pub client: ClientHandle,
}

impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRequest")
            .field("peer", &self.client.peer())
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum ChannelData {
    Request(ClientRequest),
    Shutdown,
}
// }}}

// {{{ stats and status
#[derive(Clone, Debug, Default, Serialize)]
pub struct BridgeStats {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub busy_rejections: u64,
    pub cache_served: u64,
}

impl BridgeStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            100.0 * self.successful as f64 / self.total_requests as f64
        }
    }
}

/// Point-in-time view of the whole gateway, shared with the status publishers.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Status {
    pub link_up: bool,
    pub inverter_serial: Serial,
    pub paused: bool,
    pub bridge: BridgeStats,
    pub transport: TransportStats,
    pub cache: CacheStats,
    pub server: ServerStats,
}

pub type SharedStatus = Arc<Mutex<Status>>;

impl Status {
    pub fn shared() -> SharedStatus {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn print_summary(&self) {
        info!("Bridge Statistics:");
        info!(
            "  Inverter: {} ({})",
            self.inverter_serial,
            if self.link_up { "link up" } else { "link down" }
        );
        if self.paused {
            info!("  Bridge is PAUSED");
        }
        info!("  Requests:");
        info!("    Total: {}", self.bridge.total_requests);
        info!(
            "    Successful: {} ({:.1}%)",
            self.bridge.successful,
            self.bridge.success_rate()
        );
        info!("    Failed: {}", self.bridge.failed);
        info!("    Busy rejections: {}", self.bridge.busy_rejections);
        info!("    Served from cache: {}", self.bridge.cache_served);
        info!("  RS485:");
        info!("    Requests sent: {}", self.transport.total_requests);
        info!("    Successful: {}", self.transport.successful);
        info!("    Failed: {}", self.transport.failed);
        info!("    Timeouts: {}", self.transport.timeouts);
        info!("    CRC errors: {}", self.transport.crc_errors);
        info!("    Foreign frames: {}", self.transport.foreign_frames);
        info!("    Ignored packets: {}", self.transport.ignored_packets);
        info!(
            "    Resyncs: {} ({} bytes discarded)",
            self.transport.resyncs, self.transport.discarded_bytes
        );
        info!(
            "    Probes: {} ({} failed)",
            self.transport.probes, self.transport.probe_failures
        );
        info!("  Cache:");
        info!("    Entries: {}", self.cache.entries);
        info!("    Hits: {}", self.cache.hits);
        info!("    Misses: {}", self.cache.misses);
        info!("    Invalidations: {}", self.cache.invalidations);
        info!("    Evictions: {}", self.cache.evictions);
        info!("  TCP:");
        info!("    Active clients: {}", self.server.active_clients);
        info!("    Connections: {}", self.server.connections_total);
        info!("    Rejected: {}", self.server.rejected_clients);
        info!(
            "    Frames in: {} ({} bytes), bytes out: {}",
            self.server.frames_in, self.server.bytes_in, self.server.bytes_out
        );
    }
}
// }}}

#[derive(Clone, Debug)]
pub struct BridgeSettings {
    pub dongle_serial: Serial,
    pub request_timeout: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub poll_interval: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            dongle_serial: Serial::from("0123456789"),
            request_timeout: Duration::from_millis(2000),
            cache_capacity: 10,
            cache_ttl: Duration::from_millis(300_000),
            poll_interval: Duration::from_millis(5),
        }
    }
}

impl From<&config::Bridge> for BridgeSettings {
    fn from(config: &config::Bridge) -> Self {
        Self {
            dongle_serial: config.dongle_serial(),
            request_timeout: Duration::from_millis(config.request_timeout_ms()),
            cache_capacity: config.cache_capacity(),
            cache_ttl: Duration::from_millis(config.cache_ttl_ms()),
            poll_interval: Duration::from_millis(config.poll_interval_ms()),
        }
    }
}

struct InFlight {
    id: u64,
    request: ParsedRequest,
    client: ClientHandle,
    started: Instant,
    _guard: OperationGuard,
}

// {{{ Bridge
/// Couples client requests to bus exchanges, one at a time.
pub struct Bridge<L> {
    transport: Transport<L>,
    arbiter: Arc<GuardArbiter>,
    cache: FallbackCache,
    settings: BridgeSettings,
    in_flight: Option<InFlight>,
    paused: bool,
    stats: BridgeStats,
}

impl<L: SerialLine> Bridge<L> {
    pub fn new(transport: Transport<L>, arbiter: Arc<GuardArbiter>, settings: BridgeSettings) -> Self {
        info!("bridge dongle serial {}", settings.dongle_serial);
        let cache = FallbackCache::new(settings.cache_capacity, settings.cache_ttl);
        Self {
            transport,
            arbiter,
            cache,
            settings,
            in_flight: None,
            paused: false,
            stats: BridgeStats::default(),
        }
    }

    pub fn transport(&self) -> &Transport<L> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport<L> {
        &mut self.transport
    }

    pub fn cache(&self) -> &FallbackCache {
        &self.cache
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        if paused != self.paused {
            info!("bridge {}", if paused { "paused" } else { "resumed" });
        }
        self.paused = paused;
    }

    pub fn status(&self) -> Status {
        Status {
            link_up: self.transport.is_link_up(),
            inverter_serial: self.transport.inverter_serial(),
            paused: self.paused,
            bridge: self.stats.clone(),
            transport: self.transport.stats().clone(),
            cache: self.cache.stats(),
            server: ServerStats::default(),
        }
    }

    // {{{ handle_request
    /// Takes one complete client frame. The outcome reaches `client` either
    /// right away (rejection, parse error, cache hit) or from a later `poll`.
    pub async fn handle_request(&mut self, bytes: &[u8], client: ClientHandle) {
        self.stats.total_requests += 1;
        let id = self.stats.total_requests;
        let peer = client.peer();
        debug!("[REQ#{}] {} bytes from {}: {}", id, bytes.len(), peer, Utils::hex_truncated(bytes, 40));

        if self.paused {
            self.reject(&client, "Bridge paused");
            return;
        }
        if !self.arbiter.can_perform(GuardKind::ClientProcessing) {
            let holder = self
                .arbiter
                .active()
                .map(|a| format!("{} ({})", a.kind, a.reason))
                .unwrap_or_default();
            self.reject(&client, &format!("Bridge busy: {} in progress", holder));
            return;
        }
        if self.in_flight.is_some() || self.transport.is_waiting() {
            self.reject(&client, "Bridge busy");
            return;
        }

        let guard = match self
            .arbiter
            .try_acquire(GuardKind::ClientProcessing, format!("request #{} from {}", id, peer))
        {
            Some(guard) => guard,
            None => {
                self.reject(&client, "Bridge busy");
                return;
            }
        };

        let request = match client_packet::parse(bytes) {
            Ok(request) => request,
            Err(err) => {
                warn!("[REQ#{}] bad request from {}: {}", id, peer, err);
                self.stats.failed += 1;
                self.send_error(&client, &err.to_string(), None);
                return;
            }
        };

        info!("[REQ#{}] {} from {}", id, request.describe(), peer);

        let sent = if request.is_write() {
            self.transport
                .send_write(request.function, request.start_register, &request.values)
                .await
        } else {
            self.transport
                .send_read(request.function, request.start_register, request.register_count)
                .await
        };

        match sent {
            Ok(()) => {
                self.in_flight = Some(InFlight {
                    id,
                    request,
                    client,
                    started: Instant::now(),
                    _guard: guard,
                });
            }
            Err(err) => {
                warn!("[REQ#{}] RS485 send failed: {}", id, err);
                drop(guard);
                if !request.is_write() && self.serve_from_cache(id, &request, &client) {
                    return;
                }
                self.stats.failed += 1;
                self.send_error(&client, &format!("RS485 send failed: {}", err), None);
            }
        }
    }

    fn reject(&mut self, client: &ClientHandle, reason: &str) {
        warn!("rejecting request from {}: {}", client.peer(), reason);
        self.stats.busy_rejections += 1;
        self.stats.failed += 1;
        self.send_error(client, reason, None);
    }
    // }}}

    // {{{ poll
    /// Drives the bus and completes the in-flight request when its answer
    /// (or its timeout) arrives.
    pub async fn poll(&mut self) {
        if let Err(err) = self.transport.poll().await {
            warn!("rs485 poll: {}", err);
        }

        if let Some(exchange) = self.transport.take_result() {
            match self.in_flight.take() {
                Some(flight) => self.finish(flight, exchange),
                None => debug!("dropping bus result with no request waiting"),
            }
            return;
        }

        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.started.elapsed() > self.settings.request_timeout);
        if expired {
            if let Some(flight) = self.in_flight.take() {
                warn!(
                    "[REQ#{}] {} ({}ms)",
                    flight.id,
                    REQUEST_TIMEOUT,
                    self.settings.request_timeout.as_millis()
                );
                self.fail(flight, REQUEST_TIMEOUT, None);
            }
        }
    }

    fn finish(&mut self, flight: InFlight, exchange: Exchange) {
        let Exchange { result, raw } = exchange;
        let elapsed = flight.started.elapsed().as_millis();

        if (result.success || result.is_exception()) && !Self::matches(&flight.request, &result) {
            warn!(
                "[REQ#{}] mismatch: expected func=0x{:02X} start={}, got func=0x{:02X} start={}",
                flight.id,
                u8::from(flight.request.function),
                flight.request.start_register,
                result.function,
                result.start_register
            );
            self.fail(flight, MISMATCH, None);
            return;
        }

        if !result.success {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "RS485 failure".to_string());
            warn!("[REQ#{}] RS485 FAIL: {} (after {}ms)", flight.id, error, elapsed);
            let exception_frame = raw.filter(|_| result.is_exception());
            self.fail(flight, &error, exception_frame.as_deref());
            return;
        }

        let raw = match raw {
            Some(raw) => raw,
            None => {
                self.fail(flight, "No RS485 response available", None);
                return;
            }
        };

        let response = match client_packet::build_response(self.settings.dongle_serial, &raw) {
            Ok(response) => Bytes::from(response),
            Err(err) => {
                warn!("[REQ#{}] response build failed: {}", flight.id, err);
                self.fail(flight, "Response build failed", None);
                return;
            }
        };

        info!(
            "[REQ#{}] OK func=0x{:02X} regs={} start={} time={}ms{}",
            flight.id,
            result.function,
            result.register_count,
            result.start_register,
            elapsed,
            Self::value_summary(&result)
        );
        if result.crc_mismatch() {
            warn!("[REQ#{}] forwarding response despite CRC mismatch", flight.id);
        }

        self.deliver(&flight.client, &response);
        self.stats.successful += 1;

        let request = &flight.request;
        if request.is_write() {
            self.cache
                .invalidate_range(request.start_register, request.register_count);
        } else if result.crc_mismatch() {
            debug!("[REQ#{}] not caching response with CRC mismatch", flight.id);
        } else {
            self.cache.insert(
                CacheKey::new(request.function, request.start_register, request.register_count),
                response,
            );
        }
    }

    /// Whether `result` answers `request`: same function and start, and for
    /// a success the echoed count (or, for a single write, the value).
    fn matches(request: &ParsedRequest, result: &ParsedResult) -> bool {
        if result.function != u8::from(request.function)
            || result.start_register != request.start_register
        {
            return false;
        }
        if !result.success {
            return true;
        }
        match request.function {
            DeviceFunction::WriteSingle => result.values.first() == request.values.first(),
            DeviceFunction::WriteMulti => result.register_count as usize == request.values.len(),
            _ => result.register_count == request.register_count,
        }
    }

    fn value_summary(result: &ParsedResult) -> String {
        match result.values.as_slice() {
            [] => String::new(),
            [value] => format!(" val=0x{:X}", value),
            values => {
                let head: Vec<_> = values.iter().take(3).map(|v| format!("0x{:X}", v)).collect();
                let more = if values.len() > 3 { "..." } else { "" };
                format!(" [{}{}]", head.join(", "), more)
            }
        }
    }

    fn fail(&mut self, flight: InFlight, error: &str, exception_frame: Option<&[u8]>) {
        if !flight.request.is_write() && self.serve_from_cache(flight.id, &flight.request, &flight.client)
        {
            return;
        }
        self.stats.failed += 1;
        self.send_error(&flight.client, error, exception_frame);
    }

    fn serve_from_cache(&mut self, id: u64, request: &ParsedRequest, client: &ClientHandle) -> bool {
        let key = CacheKey::new(request.function, request.start_register, request.register_count);
        match self.cache.lookup(&key) {
            Some(response) => {
                info!("[REQ#{}] serving {} from cache", id, request.describe());
                self.deliver(client, &response);
                self.stats.successful += 1;
                self.stats.cache_served += 1;
                true
            }
            None => false,
        }
    }

    fn deliver(&self, client: &ClientHandle, response: &[u8]) {
        debug!("-> {} {}", client.peer(), Utils::hex_truncated(response, 60));
        if let Err(err) = client.send(response) {
            warn!("client {} gone before response: {}", client.peer(), err);
        }
    }

    /// The vendor protocol has no error frame: an inverter exception is
    /// forwarded as-is, anything else closes the connection.
    fn send_error(&self, client: &ClientHandle, error: &str, exception_frame: Option<&[u8]>) {
        warn!("error for {}: {}", client.peer(), error);

        if let Some(frame) = exception_frame {
            match client_packet::build_response(self.settings.dongle_serial, frame) {
                Ok(response) => {
                    if client.send(&response).is_ok() {
                        info!("exception forwarded to {} ({} bytes)", client.peer(), response.len());
                        return;
                    }
                }
                Err(err) => debug!("cannot wrap exception frame: {}", err),
            }
        }

        warn!("closing connection to {}", client.peer());
        client.close();
    }
    // }}}

    fn publish_status(&self, shared: &SharedStatus) {
        let mut status = shared.lock().unwrap_or_else(|e| e.into_inner());
        let server = std::mem::take(&mut status.server);
        *status = Status {
            server,
            ..self.status()
        };
    }
}

impl<L: SerialLine + 'static> Bridge<L> {
    /// Bus worker: requests from the channel, a poll tick, and shutdown.
    pub async fn run(mut self, channels: Channels, status: SharedStatus) -> Result<()> {
        self.transport.begin();

        let mut receiver = channels.to_bridge.subscribe();
        let mut tick = tokio::time::interval(self.settings.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = receiver.recv() => match msg {
                    Ok(ChannelData::Request(request)) => {
                        self.handle_request(&request.bytes, request.client).await;
                        self.publish_status(&status);
                    }
                    Ok(ChannelData::Shutdown) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("bridge lagged, {} requests dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tick.tick() => {
                    self.poll().await;
                    self.publish_status(&status);
                }
            }
        }

        info!("bridge exiting");
        self.publish_status(&status);
        Ok(())
    }
}
// }}}
