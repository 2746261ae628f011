use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// PNG files start with these eight bytes
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n'];

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and debug endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend server and the container it lives in
    #[serde(default)]
    pub backend: BackendConfig,

    /// Listing shown while the backend is down
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Game port address (default: 0.0.0.0:25565)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Debug HTTP endpoint address (default: 127.0.0.1:6060, empty to disable)
    #[serde(default = "default_debug_listen")]
    pub debug_listen: String,

    /// Verbose logging (default: false)
    #[serde(default)]
    pub debug: bool,
}

impl ServerConfig {
    pub fn debug_endpoint_enabled(&self) -> bool {
        !self.debug_listen.trim().is_empty()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            debug_listen: default_debug_listen(),
            debug: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Backend server address as host:port
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Exact name of the container hosting the backend
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Docker daemon address (unix:///path or tcp://host:port).
    /// Falls back to DOCKER_HOST, then the usual socket paths.
    pub docker_host: Option<String>,

    /// How long a login waits for the backend to accept connections
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Start the container as soon as the gateway launches
    #[serde(default = "default_true")]
    pub start_on_launch: bool,
}

impl BackendConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Split the endpoint into host and port, as sent in a handshake
    pub fn host_and_port(&self) -> anyhow::Result<(String, u16)> {
        let (host, port) = self
            .endpoint
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("endpoint '{}' has no port", self.endpoint))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("endpoint '{}' has an invalid port: {}", self.endpoint, e))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok((host.to_string(), port))
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            container_name: default_container_name(),
            docker_host: None,
            dial_timeout_secs: default_dial_timeout(),
            start_on_launch: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    /// Version name shown in the server list
    #[serde(default = "default_status_name")]
    pub name: String,

    /// Protocol number reported to every client
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,

    /// Message of the day while the backend is down
    #[serde(default = "default_motd")]
    pub motd: String,

    /// Path to a 64x64 PNG server icon
    pub favicon: Option<String>,
}

impl StatusConfig {
    /// Load the icon as a data URI, if one is configured
    pub fn favicon_data_uri(&self) -> anyhow::Result<Option<String>> {
        let Some(path) = &self.favicon else {
            return Ok(None);
        };

        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Cannot read favicon '{}': {}", path, e))?;
        if !bytes.starts_with(&PNG_SIGNATURE) {
            anyhow::bail!("Favicon '{}' is not a PNG image", path);
        }

        Ok(Some(format!("data:image/png;base64,{}", BASE64.encode(bytes))))
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            name: default_status_name(),
            protocol_version: default_protocol_version(),
            motd: default_motd(),
            favicon: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:25565".to_string()
}

fn default_debug_listen() -> String {
    "127.0.0.1:6060".to_string()
}

fn default_endpoint() -> String {
    "172.25.0.5:25565".to_string()
}

fn default_container_name() -> String {
    "minecraft".to_string()
}

fn default_dial_timeout() -> u64 {
    25
}

fn default_true() -> bool {
    true
}

fn default_status_name() -> String {
    "1.21.4".to_string()
}

fn default_protocol_version() -> i32 {
    769
}

fn default_motd() -> String {
    "Server is booting...".to_string()
}

/// `:25565` binds every interface, as `0.0.0.0:25565` does
fn normalize_listen(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// `1`, `t`, `true` and `0`, `f`, `false` in lower, upper or title case
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.server.listen = normalize_listen(&config.server.listen);
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the defaults if `path` is the default location and
    /// nothing is there
    pub fn load_or_default<P: AsRef<Path>>(path: P, is_default_path: bool) -> anyhow::Result<Self> {
        if is_default_path && !path.as_ref().exists() {
            return Ok(Config::default());
        }
        Self::load(path)
    }

    /// Apply environment overrides, then re-validate
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();

        if let Some(listen) = lookup("LISTEN_ADDRESS") {
            self.server.listen = normalize_listen(&listen);
        }
        if let Some(name) = lookup("MINECRAFT_CONTAINER_NAME") {
            self.backend.container_name = name;
        }
        if let Some(endpoint) = lookup("MINECRAFT_ENDPOINT") {
            self.backend.endpoint = endpoint;
        }
        if let Some(debug) = lookup("ENABLE_DEBUG") {
            match parse_bool(&debug) {
                Some(debug) => self.server.debug = debug,
                None => errors.push(format!("ENABLE_DEBUG: '{}' is not a boolean", debug)),
            }
        }
        if let Some(motd) = lookup("STARTUP_MOTD") {
            self.status.motd = motd;
        }
        if let Some(name) = lookup("STARTUP_NAME") {
            self.status.name = name;
        }
        if let Some(protocol) = lookup("STARTUP_PROTOCOL_VERSION") {
            match protocol.trim().parse::<i32>() {
                Ok(protocol) => self.status.protocol_version = protocol,
                Err(e) => errors.push(format!("STARTUP_PROTOCOL_VERSION: '{}': {}", protocol, e)),
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Environment errors:\n  - {}", errors.join("\n  - "));
        }

        self.validate()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.listen.parse::<SocketAddr>() {
            errors.push(format!(
                "server.listen '{}' is not a socket address: {}",
                self.server.listen, e
            ));
        }
        if self.server.debug_endpoint_enabled() {
            if let Err(e) = self.server.debug_listen.parse::<SocketAddr>() {
                errors.push(format!(
                    "server.debug_listen '{}' is not a socket address: {}",
                    self.server.debug_listen, e
                ));
            }
        }
        if self.backend.container_name.trim().is_empty() {
            errors.push("backend.container_name must not be empty".to_string());
        }
        if let Err(e) = self.backend.host_and_port() {
            errors.push(format!("backend.{}", e));
        }
        if self.backend.dial_timeout_secs == 0 {
            errors.push("backend.dial_timeout_secs must be greater than 0".to_string());
        }
        if let Some(host) = &self.backend.docker_host {
            if !(host.starts_with("unix://") || host.starts_with("tcp://") || host.starts_with("http://")) {
                errors.push(format!(
                    "backend.docker_host '{}' must start with unix://, tcp:// or http://",
                    host
                ));
            }
        }
        if self.status.name.chars().count() > 32_767 || self.status.motd.chars().count() > 32_767 {
            errors.push("status.name and status.motd must fit in a status response".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
