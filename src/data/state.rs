//! Negotiation blocks exchanged at handshake and at the start of every request.
use super::error::{ErrorRecord, ErrorStack};

/// Protocol version spoken by this client.
pub const CLIENT_PROTOCOL_VERSION: u32 = 8;

/// Server-side idle timeout requested by default, in seconds.
pub const DEFAULT_TIMEOUT: u32 = 600;

macro_rules! bitset {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($bit);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            pub fn set(&mut self, other: Self, on: bool) {
                if on {
                    self.insert(other)
                } else {
                    self.remove(other)
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitset! {
    /// Session capability flags carried in the [`ClientBlock`].
    ClientFlags {
        ALT_DATA = 1,
        XDR_FILE = 2,
        CACHE = 4,
        CLOSEDOWN = 8,
        XDR_OBJECT = 16,
        REUSE_LAST_HANDLE = 32,
        FREE_REUSE_LAST_HANDLE = 64,
        FILE_CACHE = 128,
    }
}

bitset! {
    /// Flags used between cooperating servers, never set by callers directly.
    PrivateFlags {
        XDR_FILE = 1,
        EXTERNAL = 2,
        CACHE = 4,
        XDR_OBJECT = 8,
    }
}

bitset! {
    /// Data retrieval behaviour requested from the server.
    Properties {
        /// Return data as double precision.
        GET_DATADBLE = 1,
        /// Return dimensions as double precision.
        GET_DIMDBLE = 2,
        /// Return the time dimension as double precision.
        GET_TIMEDBLE = 4,
        GET_SCALAR = 8,
        /// Return the raw bytes of the source file.
        GET_BYTES = 16,
        /// Accept data flagged as bad.
        GET_BAD = 32,
        /// Return database metadata records alongside the data.
        GET_META = 64,
        /// Return data exactly as stored, no corrections applied.
        GET_ASIS = 128,
        GET_UNCAL = 256,
        GET_NOTOFF = 512,
        GET_NODIMDATA = 1024,
        GET_SYNTHETIC = 2048,
    }
}

/// Client state sent to the server on handshake and with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBlock {
    pub version: u32,
    pub pid: u32,
    pub uid: u32,
    /// Server idle timeout in seconds.
    pub timeout: u32,
    pub flags: ClientFlags,
    pub alt_rank: i32,
    pub properties: Properties,
    pub private_flags: PrivateFlags,
    pub os_name: String,
    /// Digital object identifier the client is working under.
    pub doi: String,
}

impl Default for ClientBlock {
    fn default() -> Self {
        Self {
            version: CLIENT_PROTOCOL_VERSION,
            pid: std::process::id(),
            uid: current_uid(),
            timeout: DEFAULT_TIMEOUT,
            flags: ClientFlags::empty(),
            alt_rank: 0,
            properties: Properties::empty(),
            private_flags: PrivateFlags::empty(),
            os_name: std::env::consts::OS.to_string(),
            doi: String::new(),
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

/// Server state returned on handshake and at the start of every reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerBlock {
    pub version: u32,
    pub error: i32,
    pub msg: String,
    pub errors: ErrorStack,
    pub os_name: String,
    pub doi: String,
}

impl ServerBlock {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            os_name: std::env::consts::OS.to_string(),
            ..Self::default()
        }
    }

    /// Add a record to the stack; the first one also sets `error` and `msg`.
    pub fn push_error(&mut self, record: ErrorRecord) {
        if self.errors.is_empty() {
            self.error = record.code;
            self.msg = record.message.clone();
        }
        self.errors.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ErrorType;

    #[test]
    fn first_error_heads_the_server_block() {
        let mut block = ServerBlock::new(8);
        block.push_error(ErrorRecord::new(ErrorType::Server, -3, "read", "no such signal"));
        block.push_error(ErrorRecord::new(ErrorType::Server, -9, "read", "no such shot"));
        assert_eq!(block.error, -3);
        assert_eq!(block.msg, "no such signal");
        assert_eq!(block.errors.len(), 2);
    }

    #[test]
    fn removed_flag_stays_removed() {
        let mut flags = ClientFlags::ALT_DATA | ClientFlags::CACHE | ClientFlags::FILE_CACHE;

        flags.remove(ClientFlags::CACHE);
        assert!(!flags.contains(ClientFlags::CACHE));
        assert!(flags.contains(ClientFlags::ALT_DATA));
        assert!(flags.contains(ClientFlags::FILE_CACHE));

        flags.remove(ClientFlags::CACHE);
        assert!(!flags.contains(ClientFlags::CACHE));
        assert_eq!(flags.bits(), 1 | 128);
    }

    #[test]
    fn set_toggles_properties() {
        let mut props = Properties::empty();
        props.set(Properties::GET_BAD, true);
        assert!(props.contains(Properties::GET_BAD));
        props.set(Properties::GET_BAD, false);
        assert_eq!(props, Properties::empty());
    }
}
