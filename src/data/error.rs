//! Error records and the per-request error stack.
//!
//! Both peers report failures as a list of [`ErrorRecord`]s. The client merges the records
//! it receives from the server with the ones it raises itself into a single [`ErrorStack`],
//! whose first entry is the message shown to the caller.

/// Status of a signal or source that has not been set.
pub const DEFAULT_STATUS: i32 = 1;
/// Status value marking data as bad.
pub const MIN_STATUS: i32 = -1;

/// Error code attached to a block whose data is flagged bad.
pub const DATA_STATUS_BAD: i32 = -17000;
/// Error code returned when no server connection could be made.
pub const NO_SOCKET_CONNECTION: i32 = -10000;
/// Error code for framing, version and type failures on the wire.
pub const PROTOCOL_ERROR: i32 = -10001;
/// Error code for local failures assembling a result.
pub const CLIENT_LOGIC_ERROR: i32 = -10002;
/// Error code returned when a result handle does not exist.
pub const INVALID_HANDLE: i32 = -10003;

/// Origin of an [`ErrorRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorType {
    /// Operating system failure; the code is the OS error number.
    System,
    /// Framing, version or element type failure.
    Protocol,
    /// Reported by the remote peer.
    #[default]
    Server,
    /// Local failure while assembling results.
    Client,
}

impl ErrorType {
    pub fn from_tag(tag: i32) -> Self {
        match tag {
            1 => ErrorType::System,
            2 => ErrorType::Protocol,
            4 => ErrorType::Client,
            _ => ErrorType::Server,
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            ErrorType::System => 1,
            ErrorType::Protocol => 2,
            ErrorType::Server => 3,
            ErrorType::Client => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorRecord {
    pub error_type: ErrorType,
    pub code: i32,
    /// Function or component that raised the error.
    pub location: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(error_type: ErrorType, code: i32, location: &str, message: impl Into<String>) -> Self {
        Self {
            error_type,
            code,
            location: location.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.location, self.message)
    }
}

/// Ordered list of errors accumulated during one request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorStack {
    records: Vec<ErrorRecord>,
}

impl ErrorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: ErrorRecord) {
        self.records.push(record);
    }

    /// Append all records from `other`, keeping their order.
    pub fn concat(&mut self, other: &ErrorStack) {
        self.records.extend(other.records.iter().cloned());
    }

    pub fn first(&self) -> Option<&ErrorRecord> {
        self.records.first()
    }

    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl From<Vec<ErrorRecord>> for ErrorStack {
    fn from(records: Vec<ErrorRecord>) -> Self {
        Self { records }
    }
}

impl Extend<ErrorRecord> for ErrorStack {
    fn extend<I: IntoIterator<Item = ErrorRecord>>(&mut self, iter: I) {
        self.records.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_preserves_order() {
        let mut a = ErrorStack::from(vec![ErrorRecord::new(ErrorType::Server, 1, "a", "first")]);
        let b = ErrorStack::from(vec![
            ErrorRecord::new(ErrorType::Client, 2, "b", "second"),
            ErrorRecord::new(ErrorType::System, 3, "c", "third"),
        ]);
        a.concat(&b);

        let codes: Vec<i32> = a.records().iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![1, 2, 3]);
        assert_eq!(a.first().map(|r| r.message.as_str()), Some("first"));
    }

    #[test]
    fn unknown_wire_type_is_server() {
        assert_eq!(ErrorType::from_tag(77), ErrorType::Server);
        assert_eq!(ErrorType::from_tag(ErrorType::System.tag()), ErrorType::System);
    }
}
