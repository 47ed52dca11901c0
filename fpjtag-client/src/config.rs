use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

/// How often to try reaching a companion that was just started.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectRetry {
    pub attempts: u32,
    pub delay: Duration,
    /// Pause after a successful connection before the first request.
    pub settle: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(150),
            settle: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ip: IpAddr,
    pub port: u16,
    /// Companion binary. A relative path is resolved next to the running executable.
    pub server_path: PathBuf,
    /// Extra arguments appended to the companion command line, e.g. its backend.
    pub server_args: Vec<String>,
    pub autostart: bool,
    pub autokill: bool,
    /// Programmer port selected by [`crate::client::Client::open`].
    pub programmer_port: String,
    pub tunnel_mode: bool,
    pub logging: bool,
    /// Time allowed per unit of opcode weight. Zero disables the watchdog.
    pub client_timeout: Duration,
    pub hardware_timeout: Duration,
    /// Added to the deadline of a call that has to connect first.
    pub cold_start_grace: Duration,
    pub idle_timeout: Duration,
    /// Idle timeout handed to an autostarted companion. Falls back to `idle_timeout`.
    pub idle_timeout_autostart: Option<Duration>,
    pub connect_retry: ConnectRetry,
    /// Terminate the process on transport failures instead of returning them.
    pub fail_stop: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3334,
            server_path: PathBuf::from("fpserver"),
            server_args: Vec::new(),
            autostart: false,
            autokill: false,
            programmer_port: String::new(),
            tunnel_mode: false,
            logging: false,
            client_timeout: Duration::ZERO,
            hardware_timeout: Duration::from_millis(1700),
            cold_start_grace: Duration::from_secs(14),
            idle_timeout: Duration::from_secs(120),
            idle_timeout_autostart: None,
            connect_retry: ConnectRetry::default(),
            fail_stop: true,
        }
    }
}

impl Config {
    /// The idle timeout passed to an autostarted companion.
    pub fn companion_idle_timeout(&self) -> Duration {
        self.idle_timeout_autostart.unwrap_or(self.idle_timeout)
    }
}

/// Builder to create a [Config] with chained setters
///
/// # Example
///
/// ```
/// use fpjtag_client::config::Builder;
/// use std::time::Duration;
///
/// let config = Builder::new()
///     .port(4000)
///     .autostart(true)
///     .autokill(true)
///     .client_timeout(Duration::from_millis(100))
///     .build();
/// assert!(config.autostart && config.autokill);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.config.ip = ip;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.server_path = path.into();
        self
    }

    pub fn server_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.config.server_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn autostart(mut self, enable: bool) -> Self {
        self.config.autostart = enable;
        self
    }

    pub fn autokill(mut self, enable: bool) -> Self {
        self.config.autokill = enable;
        self
    }

    pub fn programmer_port(mut self, port: impl Into<String>) -> Self {
        self.config.programmer_port = port.into();
        self
    }

    pub fn tunnel_mode(mut self, enable: bool) -> Self {
        self.config.tunnel_mode = enable;
        self
    }

    pub fn logging(mut self, enable: bool) -> Self {
        self.config.logging = enable;
        self
    }

    pub fn client_timeout(mut self, per_unit: Duration) -> Self {
        self.config.client_timeout = per_unit;
        self
    }

    pub fn hardware_timeout(mut self, timeout: Duration) -> Self {
        self.config.hardware_timeout = timeout;
        self
    }

    pub fn cold_start_grace(mut self, grace: Duration) -> Self {
        self.config.cold_start_grace = grace;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn idle_timeout_autostart(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_autostart = Some(timeout);
        self
    }

    pub fn connect_retry(mut self, retry: ConnectRetry) -> Self {
        self.config.connect_retry = retry;
        self
    }

    pub fn fail_stop(mut self, enable: bool) -> Self {
        self.config.fail_stop = enable;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Parses a boolean option value: `on`, `enable`, `1` or `off`, `disable`, `0`.
pub fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "enable" | "1" => Some(true),
        "off" | "disable" | "0" => Some(false),
        _ => None,
    }
}
