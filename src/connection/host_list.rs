use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use log::debug;
use thiserror::Error;

const SSL_PREFIX: &str = "SSL://";

#[derive(Debug, Error)]
pub enum HostListError {
    #[error("unable to read host list: {0}")]
    Io(#[from] io::Error),
    #[error("host list line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// A server instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostEntry {
    pub alias: String,
    pub host: String,
    pub port: Option<u16>,
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca_certificate: Option<PathBuf>,
    pub secure: bool,
}

impl HostEntry {
    fn has_credentials(&self) -> bool {
        self.certificate.is_some() && self.key.is_some() && self.ca_certificate.is_some()
    }
}

/// Named servers read from a host list file.
///
/// The file holds one `keyword value` pair per line. `host_name` opens a new entry and the
/// keywords after it (`host_alias`, `port`, `certificate`, `key`, `ca_certificate`) fill
/// it in. Lines starting with `#` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostList {
    entries: Vec<HostEntry>,
}

impl HostList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, HostListError> {
        let text = fs::read_to_string(path)?;
        let list = Self::parse(&text)?;
        debug!("loaded {} host(s) from {}", list.entries.len(), path.display());
        Ok(list)
    }

    /// Like [`HostList::load`], but a missing file gives an empty list.
    pub fn load_or_default(path: &Path) -> Result<Self, HostListError> {
        match Self::load(path) {
            Err(HostListError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no host list at {}", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn parse(text: &str) -> Result<Self, HostListError> {
        let mut entries: Vec<HostEntry> = Vec::new();

        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parse_error = |reason: String| HostListError::Parse {
                line: i + 1,
                reason,
            };

            let (keyword, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => return Err(parse_error(format!("{line} has no value"))),
            };

            if keyword.eq_ignore_ascii_case("host_name") {
                let (host, secure) = strip_ssl(value);
                let (host, port) = split_port(host);
                entries.push(HostEntry {
                    host: host.to_string(),
                    port,
                    secure,
                    ..HostEntry::default()
                });
                continue;
            }

            let Some(entry) = entries.last_mut() else {
                return Err(parse_error(format!("{keyword} before any host_name")));
            };
            match keyword.to_ascii_lowercase().as_str() {
                "host_alias" => entry.alias = value.to_string(),
                "port" => {
                    let port = value
                        .parse()
                        .map_err(|_| parse_error(format!("invalid port {value}")))?;
                    entry.port = Some(port);
                }
                "certificate" => entry.certificate = Some(PathBuf::from(value)),
                "key" => entry.key = Some(PathBuf::from(value)),
                "ca_certificate" => entry.ca_certificate = Some(PathBuf::from(value)),
                _ => return Err(parse_error(format!("unknown keyword {keyword}"))),
            }
        }

        for entry in &mut entries {
            entry.secure |= entry.has_credentials();
        }
        Ok(Self { entries })
    }

    pub fn push(&mut self, entry: HostEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[HostEntry] {
        &self.entries
    }

    pub fn find_by_alias(&self, alias: &str) -> Option<&HostEntry> {
        self.entries
            .iter()
            .find(|e| !e.alias.is_empty() && e.alias.eq_ignore_ascii_case(alias))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&HostEntry> {
        let (name, _) = strip_ssl(name);
        self.entries
            .iter()
            .find(|e| e.host.eq_ignore_ascii_case(name))
    }

    /// Alias first, then literal host name.
    pub fn resolve(&self, name: &str) -> Option<&HostEntry> {
        self.find_by_alias(name).or_else(|| self.find_by_name(name))
    }
}

/// Remove an `SSL://` prefix, reporting whether it was there.
pub(crate) fn strip_ssl(host: &str) -> (&str, bool) {
    match host.get(..SSL_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(SSL_PREFIX) => {
            (&host[SSL_PREFIX.len()..], true)
        }
        _ => (host, false),
    }
}

/// Split `host:port`. Bare IPv6 addresses are left whole; bracketed ones may carry a port.
pub(crate) fn split_port(host: &str) -> (&str, Option<u16>) {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((addr, tail)) => (addr, tail.strip_prefix(':').and_then(|p| p.parse().ok())),
            None => (host, None),
        };
    }
    if host.matches(':').count() != 1 {
        return (host, None);
    }
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name, Some(port)),
            Err(_) => (host, None),
        },
        None => (host, None),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempdir::TempDir;

    use super::*;

    const HOSTS: &str = "\
# production servers
host_name data1.example.org
host_alias Primary
port 56565

host_name SSL://secure.example.org:56566
host_alias vault

host_name certs.example.org
certificate /etc/certs/client.pem
key /etc/certs/client.key
ca_certificate /etc/certs/ca.pem
";

    #[test]
    fn entries_and_lookup() {
        let list = HostList::parse(HOSTS).unwrap();
        assert_eq!(list.entries().len(), 3);

        let primary = list.resolve("PRIMARY").unwrap();
        assert_eq!(primary.host, "data1.example.org");
        assert_eq!(primary.port, Some(56565));
        assert!(!primary.secure);

        let vault = list.resolve("vault").unwrap();
        assert_eq!(vault.host, "secure.example.org");
        assert_eq!(vault.port, Some(56566));
        assert!(vault.secure);

        assert!(list.resolve("certs.example.org").unwrap().secure);
        assert!(list.resolve("ssl://secure.example.org").is_some());
        assert!(list.resolve("elsewhere").is_none());
    }

    #[test]
    fn keyword_before_host_is_rejected() {
        let err = HostList::parse("port 1\n").unwrap_err();
        assert!(matches!(err, HostListError::Parse { line: 1, .. }));

        let err = HostList::parse("host_name a\nport x\n").unwrap_err();
        assert!(matches!(err, HostListError::Parse { line: 2, .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = TempDir::new("hosts").unwrap();
        let path = dir.path().join("hosts.cfg");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(HOSTS.as_bytes()).unwrap();

        let list = HostList::load(&path).unwrap();
        assert_eq!(list, HostList::parse(HOSTS).unwrap());

        let missing = HostList::load_or_default(&dir.path().join("absent.cfg")).unwrap();
        assert!(missing.entries().is_empty());
    }

    #[test]
    fn port_suffixes() {
        assert_eq!(split_port("host:80"), ("host", Some(80)));
        assert_eq!(split_port("host"), ("host", None));
        assert_eq!(split_port("::1"), ("::1", None));
        assert_eq!(split_port("[::1]:80"), ("::1", Some(80)));
        assert_eq!(strip_ssl("ssl://h"), ("h", true));
    }
}
