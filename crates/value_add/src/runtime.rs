//! Helper-side runtime for value-add processes.
//!
//! A value-add is started by the host with piped stdin/stdout. It must:
//! * bring up its local server,
//! * print exactly one `Server-Properties: {json}` line on stdout,
//! * keep running until stdin reaches EOF, which is the host's shutdown signal.
//!
//! Usage:
//! ```ignore
//! use value_add::{message::{ServerProperties, TransportName}, runtime};
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//!     let port = listener.local_addr()?.port();
//!     runtime::run(ServerProperties::new(TransportName::Tcp, port), serve(listener)).await
//! }
//! ```

use std::{future::Future, panic, path::Path};

use anyhow::Result;
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{dispatcher, info, warn, Dispatch};
use tracing_appender::rolling::daily;
use tracing_subscriber::{fmt, prelude::__tracing_subscriber_SubscriberExt, Layer, Registry};

use crate::message::{LogLevel, ServerProperties};

/// Install a file-only tracing subscriber. Stdout carries the announcement, so
/// logging there would corrupt it.
pub fn init_logging(log_level: LogLevel, log_dir: &Path) {
    static LOG_INIT: std::sync::Once = std::sync::Once::new();
    LOG_INIT.call_once(|| {
        let result = panic::catch_unwind(|| {
            std::fs::create_dir_all(log_dir).ok();
            let file_app = daily(log_dir, "value-add.log");

            let subscriber_dispatch = Dispatch::new(
                Registry::default().with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(false)
                        .with_writer(file_app)
                        .with_filter(tracing::level_filters::LevelFilter::from(log_level)),
                ),
            );

            if dispatcher::set_global_default(subscriber_dispatch).is_err() {
                eprintln!("a global tracing subscriber was already installed");
            }
        });
        if result.is_err() {
            eprintln!("❌ Logging setup failed");
        }
    });
}

/// Write the announcement line and flush.
pub async fn announce<W>(writer: &mut W, props: &ServerProperties) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(props.to_line().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Drain `reader` until EOF. Lines are logged and otherwise ignored.
pub async fn run_until_closed<R>(reader: R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            info!(%line, "ignoring input from host");
        }
    }
    Ok(())
}

/// Announce on stdout, then drive `serve` until it finishes or stdin closes.
pub async fn run<F>(props: ServerProperties, serve: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    run_with(props, serve, io::stdin(), &mut io::stdout()).await
}

/// [`run`] over any pair of host pipes.
pub async fn run_with<F, R, W>(props: ServerProperties, serve: F, host_in: R, host_out: &mut W) -> Result<()>
where
    F: Future<Output = Result<()>>,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    announce(host_out, &props).await?;
    info!(properties = ?props.attributes, "value-add announced");

    tokio::select! {
        res = serve => {
            if let Err(e) = &res {
                warn!("value-add server stopped: {e}");
            }
            res
        }
        res = run_until_closed(host_in) => {
            info!("stdin closed, shutting down");
            res.map_err(Into::into)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransportName;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn announce_writes_one_parseable_line() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let props = ServerProperties::new(TransportName::Tcp, 4711);
        announce(&mut client, &props).await.unwrap();
        drop(client);

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        assert!(out.ends_with('\n'));
        assert_eq!(out.lines().count(), 1);
        assert_eq!(ServerProperties::parse_output(&out).unwrap(), props);
    }

    #[tokio::test]
    async fn run_announces_then_exits_when_the_host_closes_stdin() {
        let (mut host_in, helper_in) = tokio::io::duplex(64);
        let (mut helper_out, mut host_out) = tokio::io::duplex(256);
        let props = ServerProperties::new(TransportName::Tcp, 5000);

        let task = tokio::spawn(async move {
            run_with(props, std::future::pending::<Result<()>>(), helper_in, &mut helper_out).await
        });

        let mut line = String::new();
        BufReader::new(&mut host_out).read_line(&mut line).await.unwrap();
        assert!(ServerProperties::is_announced(&line));
        assert_eq!(ServerProperties::parse_output(&line).unwrap().port(), Some("5000"));

        host_in.write_all(b"status\n").await.unwrap();
        drop(host_in);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_returns_the_server_error() {
        let (_host_in, helper_in) = tokio::io::duplex(64);
        let mut sink = Vec::new();
        let props = ServerProperties::new(TransportName::Tcp, 5001);
        let res = run_with(props, async { Err(anyhow::anyhow!("bind failed")) }, helper_in, &mut sink).await;
        assert!(res.unwrap_err().to_string().contains("bind failed"));
        assert!(String::from_utf8(sink).unwrap().starts_with(crate::message::SERVER_PROPERTIES_PREFIX));
    }

    #[test]
    fn init_logging_writes_to_the_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        init_logging(LogLevel::Info, &log_dir);
        info!("helper started");
        // only the first call installs anything
        init_logging(LogLevel::Trace, dir.path());

        let names: Vec<String> = std::fs::read_dir(&log_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("value-add.log")), "{names:?}");
    }

    #[tokio::test]
    async fn run_until_closed_returns_on_eof() {
        let (mut host, helper) = tokio::io::duplex(64);
        let task = tokio::spawn(run_until_closed(helper));
        host.write_all(b"ping\n").await.unwrap();
        drop(host);
        task.await.unwrap().unwrap();
    }
}
