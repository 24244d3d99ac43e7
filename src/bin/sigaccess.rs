use std::{
    error::Error,
    io::{self, Write},
};

use clap::{Parser, Subcommand};
use log::warn;
use sigaccess::{
    Client, ClientConfig, Command, PromptError,
    cli::{format_errors, summarize},
    connection::CloseDown,
    prompt,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server host name or alias; overrides SIGACCESS_HOST
    #[arg(long)]
    host: Option<String>,
    /// Server port; overrides SIGACCESS_PORT
    #[arg(long)]
    port: Option<u16>,
    /// Client property to set before the first request, e.g. get_meta or timeout=30
    #[arg(short, long = "property")]
    properties: Vec<String>,
    #[command(subcommand)]
    command: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// Fetch one signal and exit
    Get { signal: String, source: String },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let mut client = Client::new(config)?;
    for property in &cli.properties {
        client.set_property(property)?;
    }

    if let Some(Action::Get { signal, source }) = cli.command {
        let handle = client.get(&signal, &source).inspect_err(|_| {
            eprint!("{}", format_errors(client.error_stack()));
        })?;
        if let Some(block) = client.data_block(handle) {
            print!("{}", summarize(block));
        }
        return Ok(());
    }

    let stdio = io::stdin();
    let stdout = io::stdout();
    loop {
        let reader = stdio.lock();
        let writer = StdOut {
            inner: stdout.lock(),
        };

        let cmd = match prompt(reader, writer) {
            Ok(c) => c,
            Err(PromptError::Io(e)) => return Err(e.into()),
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => {
                client.close_down(CloseDown::CloseAll);
                break;
            }
            Command::Get { signal, source } => match client.get(&signal, &source) {
                Ok(handle) => {
                    if let Some(block) = client.data_block(handle) {
                        print!("{}", summarize(block));
                    }
                    if !client.error_stack().is_empty() {
                        eprint!("{}", format_errors(client.error_stack()));
                    }
                }
                Err(e) => {
                    eprintln!("request error: {e}");
                    eprint!("{}", format_errors(client.error_stack()));
                }
            },
            Command::Set(property) => {
                if let Err(e) = client.set_property(&property) {
                    eprintln!("{e}");
                }
            }
            Command::Reset(property) => {
                if let Err(e) = client.reset_property(&property) {
                    eprintln!("{e}");
                }
            }
            Command::Host(host) => client.set_host(&host),
            Command::Port(port) => client.set_port(port),
            Command::Errors => print!("{}", format_errors(client.error_stack())),
        }

        if let Err(e) = io::stdout().flush() {
            warn!("failed to flush stdout: {e}");
        }
    }

    Ok(())
}

/// StdOut wrapper that flushes content after every write.
struct StdOut<W: io::Write> {
    inner: W,
}

impl<W: io::Write> io::Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.inner.write(buf);
        if res.is_ok() {
            self.inner.flush()?
        }
        res
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
