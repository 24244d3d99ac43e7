use log::Level;
use thiserror::Error;

use crate::data::{ClientBlock, ClientFlags, PrivateFlags, Properties};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("unknown property {0}")]
    Unknown(String),
    #[error("property {name} expects a whole number, got {value}")]
    InvalidValue { name: String, value: String },
}

const PROPERTIES: [(&str, Properties); 12] = [
    ("get_datadble", Properties::GET_DATADBLE),
    ("get_dimdble", Properties::GET_DIMDBLE),
    ("get_timedble", Properties::GET_TIMEDBLE),
    ("get_scalar", Properties::GET_SCALAR),
    ("get_bytes", Properties::GET_BYTES),
    ("get_bad", Properties::GET_BAD),
    ("get_meta", Properties::GET_META),
    ("get_asis", Properties::GET_ASIS),
    ("get_uncal", Properties::GET_UNCAL),
    ("get_notoff", Properties::GET_NOTOFF),
    ("get_nodimdata", Properties::GET_NODIMDATA),
    ("get_synthetic", Properties::GET_SYNTHETIC),
];

const FLAGS: [(&str, ClientFlags); 4] = [
    ("altdata", ClientFlags::ALT_DATA),
    ("reuselasthandle", ClientFlags::REUSE_LAST_HANDLE),
    ("freeandreuselasthandle", ClientFlags::FREE_REUSE_LAST_HANDLE),
    ("filecache", ClientFlags::FILE_CACHE),
];

/// Caller-controlled behaviour, copied into the client block before each request.
///
/// Names are matched case-insensitively. Valued properties are written `timeout=N` and
/// `altRank=N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySet {
    pub properties: Properties,
    pub flags: ClientFlags,
    pub private_flags: PrivateFlags,
    /// Socket age limit in seconds.
    pub user_timeout: u32,
    pub alt_rank: i32,
    pub verbose: bool,
    pub debug: bool,
    default_timeout: u32,
}

impl PropertySet {
    pub fn new(default_timeout: u32) -> Self {
        Self {
            properties: Properties::empty(),
            flags: ClientFlags::empty(),
            private_flags: PrivateFlags::empty(),
            user_timeout: default_timeout,
            alt_rank: 0,
            verbose: false,
            debug: false,
            default_timeout,
        }
    }

    pub fn set(&mut self, property: &str) -> Result<(), PropertyError> {
        let property = normalise(property);
        if let Some((name, value)) = property.split_once('=') {
            let number = || {
                value.parse::<i64>().map_err(|_| PropertyError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })
            };
            return match name {
                "timeout" => {
                    self.user_timeout = number()?.clamp(0, u32::MAX as i64) as u32;
                    Ok(())
                }
                "altrank" => {
                    self.alt_rank = number()?.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                    Ok(())
                }
                _ => Err(PropertyError::Unknown(property.clone())),
            };
        }

        match property.as_str() {
            "verbose" => self.verbose = true,
            "debug" => self.debug = true,
            name => {
                if let Some(p) = lookup(&PROPERTIES, name) {
                    self.properties.insert(p);
                } else if let Some(f) = lookup(&FLAGS, name) {
                    self.flags.insert(f);
                } else {
                    return Err(PropertyError::Unknown(property.clone()));
                }
            }
        }
        Ok(())
    }

    /// Current value: 0 or 1 for switches, the number for `timeout` and `altRank`.
    pub fn get(&self, property: &str) -> Result<i64, PropertyError> {
        let property = normalise(property);
        let value = match property.as_str() {
            "timeout" => self.user_timeout as i64,
            "altrank" => self.alt_rank as i64,
            "verbose" => self.verbose as i64,
            "debug" => self.debug as i64,
            name => {
                if let Some(p) = lookup(&PROPERTIES, name) {
                    self.properties.contains(p) as i64
                } else if let Some(f) = lookup(&FLAGS, name) {
                    self.flags.contains(f) as i64
                } else {
                    return Err(PropertyError::Unknown(property.clone()));
                }
            }
        };
        Ok(value)
    }

    pub fn reset(&mut self, property: &str) -> Result<(), PropertyError> {
        let property = normalise(property);
        match property.as_str() {
            "timeout" => self.user_timeout = self.default_timeout,
            "altrank" => self.alt_rank = 0,
            "verbose" => self.verbose = false,
            "debug" => self.debug = false,
            name => {
                if let Some(p) = lookup(&PROPERTIES, name) {
                    self.properties.remove(p);
                } else if let Some(f) = lookup(&FLAGS, name) {
                    self.flags.remove(f);
                } else {
                    return Err(PropertyError::Unknown(property.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn reset_all(&mut self) {
        *self = Self::new(self.default_timeout);
    }

    /// Level for the client's own state dumps.
    pub fn log_level(&self) -> Level {
        if self.debug {
            Level::Debug
        } else if self.verbose {
            Level::Info
        } else {
            Level::Trace
        }
    }

    pub fn apply(&self, block: &mut ClientBlock) {
        block.properties = self.properties;
        block.flags = self.flags;
        block.private_flags = self.private_flags;
        block.alt_rank = self.alt_rank;
        block.timeout = self.user_timeout;
    }
}

fn normalise(property: &str) -> String {
    property
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn lookup<T: Copy>(table: &[(&str, T)], name: &str) -> Option<T> {
    table.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switches_set_and_reset() {
        let mut set = PropertySet::new(600);
        set.set("GET_BAD").unwrap();
        set.set("reuseLastHandle").unwrap();
        assert_eq!(set.get("get_bad"), Ok(1));
        assert_eq!(set.get("reuselasthandle"), Ok(1));

        set.reset("get_bad").unwrap();
        set.reset("reuseLastHandle").unwrap();
        assert_eq!(set.get("get_bad"), Ok(0));
        assert!(!set.flags.contains(ClientFlags::REUSE_LAST_HANDLE));
        assert_eq!(set.flags, ClientFlags::empty());
    }

    #[test]
    fn valued_properties() {
        let mut set = PropertySet::new(600);
        set.set("timeout = 30").unwrap();
        set.set("altRank=2").unwrap();
        assert_eq!(set.get("timeout"), Ok(30));
        assert_eq!(set.get("altRank"), Ok(2));

        assert_eq!(
            set.set("timeout=soon"),
            Err(PropertyError::InvalidValue {
                name: "timeout".to_string(),
                value: "soon".to_string()
            })
        );
        set.reset("timeout").unwrap();
        assert_eq!(set.get("timeout"), Ok(600));
    }

    #[test]
    fn unknown_names_are_errors() {
        let mut set = PropertySet::new(600);
        assert!(matches!(set.set("get_everything"), Err(PropertyError::Unknown(_))));
        assert!(set.get("colour").is_err());
    }

    #[test]
    fn applied_to_the_client_block() {
        let mut set = PropertySet::new(600);
        set.set("get_meta").unwrap();
        set.set("altData").unwrap();
        set.set("debug").unwrap();
        assert_eq!(set.log_level(), Level::Debug);

        let mut block = ClientBlock::default();
        set.apply(&mut block);
        assert!(block.properties.contains(Properties::GET_META));
        assert!(block.flags.contains(ClientFlags::ALT_DATA));

        set.reset_all();
        assert_eq!(set, PropertySet::new(600));
    }
}
