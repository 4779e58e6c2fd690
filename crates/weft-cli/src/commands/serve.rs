//! Serve command - runs a line-echo server until SIGINT or SIGTERM.

use std::io::Write;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use weft_config::WeftConfig;
use weft_server::{Metrics, Server, ServerConfig};

pub struct ServeArgs {
    pub project: String,
    pub address: Option<String>,
    pub delimiter: Option<String>,
    pub print_metrics: bool,
}

pub fn run(args: &ServeArgs) -> Result<()> {
    let mut config = super::config::load(&args.project)?;
    crate::init_logging(&config.logging.level);
    if let Some(address) = &args.address {
        config.server.bind_address = parse_address(address);
    }
    if let Some(delimiter) = &args.delimiter {
        config.server.delimiter = unescape(delimiter);
    }

    let server_config = server_config(&config)?;
    let server = Server::new(server_config, echo);

    // Register before binding so an early signal is not lost.
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;

    server.up().context("Failed to start server")?;
    let addr = server
        .local_addr()
        .context("Server reported no bound address")?;

    println!();
    println!("weft - event-driven TCP frame server");
    println!();
    println!("  Listening on:   {addr}");
    println!("  Delimiter:      {:?}", config.server.delimiter);
    println!();
    println!("Server is ready. Press Ctrl+C to stop.");
    println!();

    if let Some(signal) = signals.forever().next() {
        info!(signal, "shutdown requested");
    }

    server.down().context("Errors while stopping server")?;

    if args.print_metrics {
        print!("{}", Metrics::global().render());
    }
    println!();
    println!("Server stopped gracefully.");

    Ok(())
}

/// Replies `> <frame>` to every frame.
fn echo(frame: &[u8], out: &mut dyn Write) -> Result<()> {
    out.write_all(b"> ")?;
    out.write_all(frame)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Maps the file configuration onto the server's.
pub(crate) fn server_config(config: &WeftConfig) -> Result<ServerConfig> {
    config.validate()?;
    let server = &config.server;
    let server_config = ServerConfig::new(server.bind_address.clone())
        .with_delimiter(server.delimiter.clone().into_bytes())
        .with_buffer_capacity(server.buffer_capacity)
        .with_pool_size(server.pool_size)
        .with_max_frame_size(server.max_frame_size)
        .with_poll_interval(server.poll_interval())
        .with_accept_backoff(server.accept_backoff())
        .with_write_timeout(server.write_timeout());
    server_config.validate()?;
    Ok(server_config)
}

/// A bare port means loopback on that port; anything else is passed through.
fn parse_address(address: &str) -> String {
    if address.parse::<u16>().is_ok() {
        format!("127.0.0.1:{address}")
    } else {
        address.to_string()
    }
}

/// Expands `\r`, `\n`, `\t`, `\0` and `\\` so delimiters can be typed on a
/// shell command line.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('\\') | None => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("7000"), "127.0.0.1:7000");
        assert_eq!(parse_address("0.0.0.0:7000"), "0.0.0.0:7000");
        assert_eq!(parse_address(":7000"), ":7000");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"\r\n"), "\r\n");
        assert_eq!(unescape(r"<END>"), "<END>");
        assert_eq!(unescape(r"a\\b"), "a\\b");
        assert_eq!(unescape(r"\x"), "\\x");
        assert_eq!(unescape("\\"), "\\");
    }

    #[test]
    fn test_server_config_mapping() {
        let mut config = WeftConfig::default();
        config.server.delimiter = "\n".to_string();
        config.server.poll_interval_ms = 20;

        let server_config = server_config(&config).unwrap();
        assert_eq!(server_config.bind_address, "127.0.0.1:7000");
        assert_eq!(&server_config.delimiter[..], b"\n");
        assert_eq!(
            server_config.poll_interval,
            std::time::Duration::from_millis(20)
        );
    }

    #[test]
    fn test_echo_reply() {
        let mut out = Vec::new();
        echo(b"hello", &mut out).unwrap();
        assert_eq!(out, b"> hello\n");
    }
}
