//! Client for a remote scientific signal data-access service.
//!
//! A caller names a signal and a source (a shot number, a file path or a function call such
//! as `ramp(n=10)`). The [`Client`] sends the request over a versioned, record-framed TCP
//! protocol and stores each returned [`DataBlock`](data::DataBlock) behind a [`Handle`].
//!
//! # Key Components
//!
//! - [`client`]: session orchestration, properties and result storage.
//! - [`connection`]: host aliases, failover and the socket pool.
//! - [`protocol`]: record framing, the message codec and a demo server.
//! - [`compress`]: expansion of compressed dimension axes.
//! - [`data`]: blocks, requests and error records.
//! - [`cli`] / [`command`]: the interactive shell used by the `sigaccess` binary.
pub mod cli;
pub mod client;
pub mod command;
pub mod compress;
pub mod connection;
pub mod data;
pub mod protocol;

pub use cli::{PromptError, prompt};
pub use client::{Client, ClientConfig, ClientError, Handle};
pub use command::{Command, CommandError};
pub use protocol::DataServer;
