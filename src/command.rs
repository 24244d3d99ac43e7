//! Interactive shell commands.
//!
//! This module defines the [`Command`] enum, which encapsulates a line typed at the
//! `sigaccess` prompt. Commands are applied to a [`Client`](crate::Client): a request for
//! data, a property change or a change of server.
//!
//! # Overview
//! The `Command` enum represents supported operations such as:
//!
//! - `Exit`: Close every socket and leave the shell.
//! - `Get { signal, source }`: Fetch a signal, written `get <signal> <source>`.
//! - `Set(String)` / `Reset(String)`: Change a client property, e.g. `.set get_meta`.
//! - `Host(String)` / `Port(u16)`: Point the client at another server.
//! - `Errors`: Print the error stack left by the last request.
//!
//! # Example
//! ```rust
//! use sigaccess::Command;
//!
//! let cmd: Command = "get ip 12345".try_into().unwrap();
//! assert_eq!(cmd, Command::Get { signal: "ip".to_string(), source: "12345".to_string() });
//! ```
//!
//! # See Also
//! - [`prompt`](crate::prompt): Reads one command from a terminal.
use thiserror::Error;

/// List of possible errors a command line can produce.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,
}

/// Commands accepted by the interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Close every socket and terminate the shell.
    Exit,
    /// Request a signal from a source.
    Get { signal: String, source: String },
    /// Set a named client property.
    Set(String),
    /// Reset a named client property to its default.
    Reset(String),
    Host(String),
    Port(u16),
    /// Print the errors gathered by the last request.
    Errors,
}

impl TryInto<Command> for &str {
    type Error = CommandError;

    fn try_into(self) -> Result<Command, Self::Error> {
        let s = self.trim();
        let (word, rest) = match s.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (s, ""),
        };

        match word.to_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            ".exit" => Ok(Command::Exit),
            ".errors" => Ok(Command::Errors),
            "get" => {
                // The signal is one word; the source may contain spaces inside a function call.
                let (signal, source) = match rest.split_once(char::is_whitespace) {
                    Some((signal, source)) => (signal, source.trim()),
                    None => (rest, ""),
                };
                if signal.is_empty() {
                    return Err(arguments(
                        "get",
                        "requires a signal and a source. Example: get ip 12345",
                    ));
                }
                Ok(Command::Get {
                    signal: signal.to_string(),
                    source: source.to_string(),
                })
            }
            ".set" | ".reset" => {
                if rest.is_empty() {
                    return Err(arguments(
                        word,
                        "requires a property name. Example: .set get_meta",
                    ));
                }
                if word.eq_ignore_ascii_case(".set") {
                    Ok(Command::Set(rest.to_string()))
                } else {
                    Ok(Command::Reset(rest.to_string()))
                }
            }
            ".host" => {
                if rest.is_empty() {
                    return Err(arguments(".host", "requires a host name or alias"));
                }
                Ok(Command::Host(rest.to_string()))
            }
            ".port" => {
                let port = rest.parse::<u16>().map_err(|_| {
                    arguments(".port", "requires a port number between 0 and 65535")
                })?;
                Ok(Command::Port(port))
            }
            _ => Err(CommandError::UnrecognizedCommand(s.to_string())),
        }
    }
}

fn arguments(command: &str, reason: &str) -> CommandError {
    CommandError::InvalidCommandArguments {
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_from_string() {
        let inputs = vec![
            (".exit", Command::Exit),
            (".errors\n", Command::Errors),
            (".set get_meta", Command::Set("get_meta".to_string())),
            (".RESET timeout", Command::Reset("timeout".to_string())),
            (".host fusion2", Command::Host("fusion2".to_string())),
            (".port 56566", Command::Port(56566)),
            (
                "get ip MAST::ramp(n = 4)",
                Command::Get {
                    signal: "ip".to_string(),
                    source: "MAST::ramp(n = 4)".to_string(),
                },
            ),
            (
                "get /path/to/file.nc",
                Command::Get {
                    signal: "/path/to/file.nc".to_string(),
                    source: String::new(),
                },
            ),
        ];

        for (cmd, expected) in inputs {
            let command: Command = cmd.try_into().unwrap();
            assert_eq!(command, expected);
        }
    }

    #[test]
    fn bad_commands() {
        let empty: Result<Command, _> = "   ".try_into();
        assert_eq!(empty, Err(CommandError::Empty));

        let port: Result<Command, _> = ".port seventy".try_into();
        assert!(matches!(
            port,
            Err(CommandError::InvalidCommandArguments { command, .. }) if command == ".port"
        ));

        let get: Result<Command, _> = "get".try_into();
        assert!(get.is_err());

        let unknown: Result<Command, _> = "select *".try_into();
        assert_eq!(
            unknown,
            Err(CommandError::UnrecognizedCommand("select *".to_string()))
        );
    }
}
