use std::{env, path::PathBuf, str::FromStr, time::Duration};

use log::warn;

use crate::{
    connection::{ConnectionConfig, DEFAULT_PORT},
    data::{CLIENT_PROTOCOL_VERSION, DEFAULT_TIMEOUT, RequestDefaults},
};

const ENV_PREFIX: &str = "SIGACCESS_";

/// Settings resolved when a [`Client`](super::Client) is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub failover: Option<(String, u16)>,
    /// Socket age in seconds after which a fresh socket is opened.
    pub timeout: u32,
    pub max_socket_delay: Duration,
    pub max_socket_attempts: u32,
    pub io_timeout: Option<Duration>,
    pub request_defaults: RequestDefaults,
    pub hosts_file: Option<PathBuf>,
    /// Highest protocol version to offer the server.
    pub protocol_version: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            failover: None,
            timeout: DEFAULT_TIMEOUT,
            max_socket_delay: Duration::from_secs(10),
            max_socket_attempts: 3,
            io_timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT as u64)),
            request_defaults: RequestDefaults::default(),
            hosts_file: default_hosts_file(),
            protocol_version: CLIENT_PROTOCOL_VERSION,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `SIGACCESS_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = var("HOST") {
            config.host = host;
        }
        if let Some(port) = parsed("PORT") {
            config.port = port;
        }
        if let Some(host) = var("HOST2") {
            let port = parsed("PORT2").unwrap_or(config.port);
            config.failover = Some((host, port));
        }
        if let Some(timeout) = parsed("TIMEOUT") {
            config.timeout = timeout;
        }
        if let Some(delay) = parsed("MAX_SOCKET_DELAY") {
            config.max_socket_delay = Duration::from_secs(delay);
        }
        if let Some(attempts) = parsed("MAX_SOCKET_ATTEMPTS") {
            config.max_socket_attempts = attempts;
        }
        if let Some(delimiter) = var("API_DELIM") {
            config.request_defaults.delimiter = delimiter;
        }
        if let Some(device) = var("DEVICE") {
            config.request_defaults.device = device;
        }
        if let Some(archive) = var("ARCHIVE") {
            config.request_defaults.archive = archive;
        }
        if let Some(path) = var("HOSTS_CONFIG") {
            config.hosts_file = Some(PathBuf::from(path));
        }
        config
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_socket_attempts: self.max_socket_attempts,
            max_socket_delay: self.max_socket_delay,
            io_timeout: self.io_timeout,
            user_timeout: Duration::from_secs(self.timeout as u64),
            ..ConnectionConfig::default()
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str) -> Option<T> {
    let value = var(name)?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {ENV_PREFIX}{name}={value}: not a valid number");
            None
        }
    }
}

fn default_hosts_file() -> Option<PathBuf> {
    env::var_os("HOME").map(|home| PathBuf::from(home).join(".sigaccess").join("hosts.cfg"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_settings_follow_the_client() {
        let config = ClientConfig {
            timeout: 30,
            max_socket_attempts: 0,
            ..ClientConfig::default()
        };
        let connection = config.connection_config();
        assert_eq!(connection.user_timeout, Duration::from_secs(30));
        assert_eq!(connection.max_socket_attempts, 0);
    }

    #[test]
    fn environment_overrides() {
        // Only variables no other test reads are touched here.
        unsafe {
            env::set_var("SIGACCESS_HOST2", "backup.example.org");
            env::set_var("SIGACCESS_MAX_SOCKET_ATTEMPTS", "seven");
        }
        let config = ClientConfig::from_env();
        assert_eq!(
            config.failover,
            Some(("backup.example.org".to_string(), config.port))
        );
        assert_eq!(config.max_socket_attempts, 3);
        unsafe {
            env::remove_var("SIGACCESS_HOST2");
            env::remove_var("SIGACCESS_MAX_SOCKET_ATTEMPTS");
        }
    }
}
