use crate::prelude::*;
use crate::rs485::Direction;

use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub serial: SerialPort,

    #[serde(default)]
    pub bridge: Bridge,

    #[serde(default)]
    pub tcp: Tcp,

    #[serde(default)]
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    pub status_interval_secs: Option<u64>,
}

// SerialPort {{{
#[derive(Clone, Debug, Deserialize)]
pub struct SerialPort {
    pub port: String,
    pub baud: Option<u32>,
    #[serde(default)]
    pub direction: Direction,

    pub response_timeout_ms: Option<u64>,
    pub inter_frame_delay_ms: Option<u64>,
    pub probe_backoff_base_ms: Option<u64>,
    pub probe_backoff_max_ms: Option<u64>,
    pub max_rx_buffer: Option<usize>,
}

impl SerialPort {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or(19200)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn response_timeout_ms(&self) -> u64 {
        self.response_timeout_ms.unwrap_or(1000)
    }

    pub fn inter_frame_delay_ms(&self) -> u64 {
        self.inter_frame_delay_ms.unwrap_or(50)
    }

    pub fn probe_backoff_base_ms(&self) -> u64 {
        self.probe_backoff_base_ms.unwrap_or(5000)
    }

    pub fn probe_backoff_max_ms(&self) -> u64 {
        self.probe_backoff_max_ms.unwrap_or(300_000) // 5 minutes
    }

    pub fn max_rx_buffer(&self) -> usize {
        self.max_rx_buffer.unwrap_or(1024)
    }
} // }}}

// Bridge {{{
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Bridge {
    #[serde(default, deserialize_with = "de_serial")]
    pub dongle_serial: Option<Serial>,

    pub request_timeout_ms: Option<u64>,
    pub cache_capacity: Option<usize>,
    pub cache_ttl_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl Bridge {
    pub fn dongle_serial(&self) -> Serial {
        self.dongle_serial
            .unwrap_or_else(|| Serial::from("0123456789"))
    }

    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms.unwrap_or(2000)
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity.unwrap_or(10)
    }

    pub fn cache_ttl_ms(&self) -> u64 {
        self.cache_ttl_ms.unwrap_or(300_000)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.unwrap_or(5)
    }
} // }}}

// Tcp {{{
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Tcp {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub max_clients: Option<usize>,
    pub client_timeout_ms: Option<u64>,
    pub keepalive_secs: Option<u64>,
}

impl Tcp {
    pub fn listen(&self) -> &str {
        self.listen.as_deref().unwrap_or("0.0.0.0")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8000)
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients.unwrap_or(5)
    }

    pub fn client_timeout_ms(&self) -> u64 {
        self.client_timeout_ms.unwrap_or(300_000)
    }

    pub fn keepalive_secs(&self) -> u64 {
        self.keepalive_secs.unwrap_or(60)
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,

    pub status_interval_secs: Option<u64>,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: Config::default_mqtt_port(),
            username: None,
            password: None,
            namespace: Config::default_mqtt_namespace(),
            status_interval_secs: None,
        }
    }
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn status_interval_secs(&self) -> u64 {
        self.status_interval_secs.unwrap_or(60)
    }
} // }}}

#[derive(Clone)]
pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn serial(&self) -> SerialPort {
        self.lock().serial.clone()
    }

    pub fn bridge(&self) -> Bridge {
        self.lock().bridge.clone()
    }

    pub fn tcp(&self) -> Tcp {
        self.lock().tcp.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn status_interval_secs(&self) -> u64 {
        self.lock().status_interval_secs()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error_with_source!(err, "error reading {}", file))?;

        Self::from_yaml(&content).map_err(|err| anyhow!("{}: {}", file, err))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Logs every setting in effect, defaults included.
    pub fn log_summary(&self) {
        let s = &self.serial;
        info!("Configuration loaded successfully:");
        info!("  Serial:");
        info!("    Port: {}", s.port());
        info!("    Baud: {}", s.baud());
        info!("    Direction: {:?}", s.direction());
        info!("    Response Timeout: {}ms", s.response_timeout_ms());
        info!("    Inter-frame Delay: {}ms", s.inter_frame_delay_ms());
        info!(
            "    Probe Backoff: {}ms - {}ms",
            s.probe_backoff_base_ms(),
            s.probe_backoff_max_ms()
        );
        info!("    Max RX Buffer: {} bytes", s.max_rx_buffer());

        let b = &self.bridge;
        info!("  Bridge:");
        info!("    Dongle Serial: {}", b.dongle_serial());
        info!("    Request Timeout: {}ms", b.request_timeout_ms());
        info!(
            "    Cache: {} entries, TTL {}ms",
            b.cache_capacity(),
            b.cache_ttl_ms()
        );
        info!("    Poll Interval: {}ms", b.poll_interval_ms());

        let t = &self.tcp;
        info!("  TCP:");
        info!("    Listen: {}:{}", t.listen(), t.port());
        info!("    Max Clients: {}", t.max_clients());
        info!("    Client Timeout: {}ms", t.client_timeout_ms());
        info!("    Keepalive: {}s", t.keepalive_secs());

        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Namespace: {}", self.mqtt.namespace);
            info!("    Status Interval: {}s", self.mqtt.status_interval_secs());
        }

        info!("  Status Interval: {}s", self.status_interval_secs());
        info!("  Log Level: {}", self.loglevel);
    }

    pub fn status_interval_secs(&self) -> u64 {
        self.status_interval_secs.unwrap_or(60)
    }

    fn validate(&self) -> Result<()> {
        let s = &self.serial;
        if s.port.is_empty() {
            bail!("serial.port cannot be empty");
        }
        if s.baud() == 0 {
            bail!("serial.baud must be greater than 0");
        }
        if s.response_timeout_ms() == 0 || s.inter_frame_delay_ms() == 0 {
            bail!("serial timeouts must be greater than 0");
        }
        if s.probe_backoff_base_ms() == 0 {
            bail!("serial.probe_backoff_base_ms must be greater than 0");
        }
        if s.probe_backoff_base_ms() > s.probe_backoff_max_ms() {
            bail!(
                "serial.probe_backoff_base_ms ({}) exceeds probe_backoff_max_ms ({})",
                s.probe_backoff_base_ms(),
                s.probe_backoff_max_ms()
            );
        }
        if s.max_rx_buffer() < 256 {
            bail!("serial.max_rx_buffer must be at least 256");
        }

        let b = &self.bridge;
        if b.request_timeout_ms() == 0 || b.poll_interval_ms() == 0 {
            bail!("bridge timeouts must be greater than 0");
        }
        if b.cache_capacity() == 0 {
            bail!("bridge.cache_capacity must be at least 1");
        }

        let t = &self.tcp;
        if t.port() == 0 {
            bail!("tcp.port must be between 1 and 65535");
        }
        if t.max_clients() == 0 {
            bail!("tcp.max_clients must be at least 1");
        }
        if t.client_timeout_ms() == 0 {
            bail!("tcp.client_timeout_ms must be greater than 0");
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
        }

        if self.mqtt.status_interval_secs() == 0 || self.status_interval_secs() == 0 {
            bail!("status intervals must be greater than 0");
        }

        Ok(())
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "luxbridge".to_string()
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}

fn de_serial<'de, D>(deserializer: D) -> Result<Option<Serial>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(None)
    } else {
        Serial::from_str(&s).map(Some).map_err(serde::de::Error::custom)
    }
}
