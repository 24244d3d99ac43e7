//! Request construction.
//!
//! A caller names a signal and a source. The source string may carry a device and archive
//! prefix separated by the API delimiter (`DEVICE::archive::path`), a shot number with an
//! optional pass (`12345/2`), a file path, or a server side function call
//! (`name(a=1, b=text)`). [`RequestData::parse`] splits it into the fields sent to the
//! server.
use thiserror::Error;

use super::blocks::PutDataBlock;

pub const MAX_SIGNAL_LENGTH: usize = 10 * 1024;
pub const MAX_SOURCE_LENGTH: usize = 1024;
pub const DEFAULT_DELIMITER: &str = "::";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("signal name is {0} bytes, the limit is {MAX_SIGNAL_LENGTH}")]
    SignalTooLong(usize),
    #[error("source name is {0} bytes, the limit is {MAX_SOURCE_LENGTH}")]
    SourceTooLong(usize),
    #[error("neither a signal nor a source was given")]
    Empty,
    #[error("malformed function call '{0}'")]
    MalformedFunction(String),
}

/// What the server is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    /// Read a signal from a path, file or default source.
    #[default]
    Generic,
    /// Read a signal from a numbered shot.
    Shot,
    /// Evaluate a server side function.
    Function,
}

impl RequestKind {
    pub fn from_tag(tag: i32) -> Self {
        match tag {
            1 => RequestKind::Shot,
            2 => RequestKind::Function,
            _ => RequestKind::Generic,
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            RequestKind::Generic => 0,
            RequestKind::Shot => 1,
            RequestKind::Function => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

/// Prefixes applied when the source names no device or archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDefaults {
    pub delimiter: String,
    pub device: String,
    pub archive: String,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_string(),
            device: String::new(),
            archive: String::new(),
        }
    }
}

/// One signal and source request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestData {
    pub request: RequestKind,
    pub exp_number: i32,
    pub pass: i32,
    pub tpass: String,
    pub archive: String,
    pub device_name: String,
    pub server: String,
    pub path: String,
    pub file: String,
    pub format: String,
    pub signal: String,
    pub source: String,
    pub api_delim: String,
    pub function: String,
    pub name_values: Vec<NameValue>,
    pub put: bool,
    pub put_data: Vec<PutDataBlock>,
}

impl RequestData {
    pub fn parse(
        signal: &str,
        source: &str,
        defaults: &RequestDefaults,
    ) -> Result<Self, RequestError> {
        let signal = signal.trim();
        let source = source.trim();

        if signal.len() >= MAX_SIGNAL_LENGTH {
            return Err(RequestError::SignalTooLong(signal.len()));
        }
        if source.len() >= MAX_SOURCE_LENGTH {
            return Err(RequestError::SourceTooLong(source.len()));
        }
        if signal.is_empty() && source.is_empty() {
            return Err(RequestError::Empty);
        }

        let delim = if defaults.delimiter.is_empty() {
            DEFAULT_DELIMITER
        } else {
            defaults.delimiter.as_str()
        };

        let mut request = RequestData {
            signal: signal.to_string(),
            source: source.to_string(),
            api_delim: delim.to_string(),
            device_name: defaults.device.clone(),
            archive: defaults.archive.clone(),
            ..Self::default()
        };

        let parts: Vec<&str> = source.splitn(3, delim).collect();
        let rest = match parts.as_slice() {
            [device, archive, rest] => {
                request.device_name = device.to_string();
                request.archive = archive.to_string();
                *rest
            }
            [device, rest] => {
                request.device_name = device.to_string();
                *rest
            }
            [rest] => *rest,
            _ => "",
        };

        if let Some(open) = rest.find('(') {
            if !rest.ends_with(')') {
                return Err(RequestError::MalformedFunction(rest.to_string()));
            }
            request.request = RequestKind::Function;
            request.function = rest[..open].trim().to_string();
            request.name_values = parse_name_values(&rest[open + 1..rest.len() - 1]);
            if request.function.is_empty() {
                return Err(RequestError::MalformedFunction(rest.to_string()));
            }
        } else if let Some((exp_number, pass)) = parse_shot(rest) {
            request.request = RequestKind::Shot;
            request.exp_number = exp_number;
            match pass {
                Some(p) => match p.parse::<i32>() {
                    Ok(n) => request.pass = n,
                    Err(_) => request.tpass = p.to_string(),
                },
                None => request.pass = -1,
            }
        } else {
            request.path = rest.to_string();
        }

        Ok(request)
    }

    /// Attach payloads to be written to the server.
    pub fn with_put_data(mut self, blocks: Vec<PutDataBlock>) -> Self {
        self.put = true;
        self.put_data = blocks;
        self
    }

    /// Value of a function argument, matched case-insensitively.
    pub fn name_value(&self, name: &str) -> Option<&str> {
        self.name_values
            .iter()
            .find(|nv| nv.name.eq_ignore_ascii_case(name))
            .map(|nv| nv.value.as_str())
    }
}

fn parse_shot(s: &str) -> Option<(i32, Option<&str>)> {
    let (number, pass) = match s.split_once('/') {
        Some((n, p)) => (n, Some(p.trim())),
        None => (s, None),
    };
    number.trim().parse::<i32>().ok().map(|n| (n, pass))
}

/// Split `a=1, b = "two", flag` into name-value pairs. A bare name means `true`.
fn parse_name_values(s: &str) -> Vec<NameValue> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;

    let mut push = |item: &str| {
        let item = item.trim();
        if item.is_empty() {
            return;
        }
        let (name, value) = match item.split_once('=') {
            Some((n, v)) => (n.trim(), v.trim().trim_matches(|c| c == '"' || c == '\'')),
            None => (item, "true"),
        };
        out.push(NameValue {
            name: name.to_string(),
            value: value.to_string(),
        });
    };

    for (i, c) in s.char_indices() {
        match c {
            '"' | '\'' => quoted = !quoted,
            '(' | '[' if !quoted => depth += 1,
            ')' | ']' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    push(&s[start..]);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_prefix_is_split_off() {
        let req = RequestData::parse("signal_A", "device::source_B", &RequestDefaults::default())
            .unwrap();
        assert_eq!(req.device_name, "device");
        assert_eq!(req.path, "source_B");
        assert_eq!(req.request, RequestKind::Generic);
        assert_eq!(req.api_delim, "::");
    }

    #[test]
    fn defaults_apply_without_delimiter() {
        let defaults = RequestDefaults {
            device: "MAST".to_string(),
            archive: "MAST".to_string(),
            ..RequestDefaults::default()
        };
        let req = RequestData::parse("ip", "12345/2", &defaults).unwrap();
        assert_eq!(req.device_name, "MAST");
        assert_eq!(req.archive, "MAST");
        assert_eq!(req.request, RequestKind::Shot);
        assert_eq!(req.exp_number, 12345);
        assert_eq!(req.pass, 2);
    }

    #[test]
    fn text_pass_kept_as_tpass() {
        let req = RequestData::parse("ip", "99/LATEST", &RequestDefaults::default()).unwrap();
        assert_eq!(req.exp_number, 99);
        assert_eq!(req.tpass, "LATEST");
    }

    #[test]
    fn function_calls_are_not_paths() {
        let req = RequestData::parse(
            "",
            "DEV::archive::ramp(n=10, label=\"a, b\", verbose)",
            &RequestDefaults::default(),
        )
        .unwrap();
        assert_eq!(req.request, RequestKind::Function);
        assert_eq!(req.function, "ramp");
        assert!(req.path.is_empty());
        assert_eq!(req.archive, "archive");
        assert_eq!(req.name_value("N"), Some("10"));
        assert_eq!(req.name_value("label"), Some("a, b"));
        assert_eq!(req.name_value("verbose"), Some("true"));
    }

    #[test]
    fn oversized_names_are_rejected() {
        let long = "x".repeat(MAX_SOURCE_LENGTH);
        let err = RequestData::parse("s", &long, &RequestDefaults::default()).unwrap_err();
        assert_eq!(err, RequestError::SourceTooLong(MAX_SOURCE_LENGTH));

        let err = RequestData::parse("", "", &RequestDefaults::default()).unwrap_err();
        assert_eq!(err, RequestError::Empty);
    }

    #[test]
    fn unterminated_function_is_malformed() {
        let err = RequestData::parse("s", "f(a=1", &RequestDefaults::default()).unwrap_err();
        assert!(matches!(err, RequestError::MalformedFunction(_)));
    }
}
