//! # Parcelnet CLI
//!
//! A small interop harness around the transport layer: `serve` accepts
//! connections and prints every event, `send` dials a peer and pushes a text
//! object or a file. The heavy lifting all lives in the library; this binary
//! only wires arguments to it and renders events.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use parcelnet::logging::LevelColorFormatter;
use parcelnet::{
    dial, register_class, Acceptor, Connection, ConnectionEvent, ConnectionInfo,
    ConnectionListener, Parameters, Priority,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Prioritized object and file transport over TCP")]
struct Args {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress console output
    #[arg(short, long)]
    quiet: bool,

    /// Detailed log destination: a file path, or "stderr"
    #[arg(long)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and print everything that arrives
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:4460")]
        bind: String,

        /// Directory inbound files are stored under
        #[arg(long)]
        root: Option<PathBuf>,

        /// ALIVE beacon period in seconds (0 = off)
        #[arg(long, default_value_t = 0)]
        alive: u64,
    },
    /// Dial a peer and send a message or a file
    Send {
        /// Address to connect to
        #[arg(long, default_value = "127.0.0.1:4460")]
        connect: String,

        /// Text to send as an object
        #[arg(long)]
        text: Option<String>,

        /// File to transmit
        #[arg(long)]
        file: Option<PathBuf>,

        /// Destination path relative to the receiver's file root
        #[arg(long)]
        dest: Option<String>,

        /// Priority class for the transmission
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,

        /// Cap the outbound rate in bytes/second
        #[arg(long)]
        tempo: Option<i64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Bottom,
    Low,
    Normal,
    High,
    Top,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Bottom => Priority::Bottom,
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
            PriorityArg::Top => Priority::Top,
        }
    }
}

/// Forwards every connection event to the log and to the main task
struct EventPrinter {
    feed: tokio::sync::mpsc::UnboundedSender<String>,
}

impl ConnectionListener for EventPrinter {
    fn on_event(&self, connection: &ConnectionInfo, event: &ConnectionEvent) {
        let line = match event {
            ConnectionEvent::ObjectReceived { value, object_id, .. } => {
                match value.downcast_ref::<String>() {
                    Some(text) => format!("object {} received: {:?}", object_id, text),
                    None => format!("object {} received", object_id),
                }
            }
            other => format!("{:?}", other),
        };
        info!("[conn {}] {}", connection.id, line);
        let _ = self.feed.send(format!("{:?}", event));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // detailed layer to a file (kept alive through the guard) or stderr
    let guard;
    let detailed_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else if let Some(path_str) = args.log_file.as_deref() {
        let log_path = std::path::Path::new(path_str);
        let dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let name = log_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("parcelnet.log"));
        let appender = tracing_appender::rolling::daily(dir, name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    } else {
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::sink)
            .with_filter(LevelFilter::OFF)
            .boxed();
        guard = None;
    }

    let stdout_layer = (!args.quiet).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .event_format(LevelColorFormatter)
            .with_filter(log_level)
    });

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();
    let _log_guard = guard;

    // both roles must register the same classes in the same order
    register_class::<String>("String");

    match args.command {
        Command::Serve { bind, root, alive } => serve(bind, root, alive).await,
        Command::Send {
            connect,
            text,
            file,
            dest,
            priority,
            tempo,
        } => send(connect, text, file, dest, priority.into(), tempo).await,
    }
}

async fn serve(bind: String, root: Option<PathBuf>, alive: u64) -> Result<()> {
    let mut params = Parameters::new();
    if let Some(root) = root {
        params.set_file_root(root)?;
    }
    params.set_alive_period(Duration::from_secs(alive))?;

    let acceptor = Acceptor::bind(&bind, params).await?;
    info!("listening on {}", acceptor.local_addr()?);

    loop {
        match acceptor.accept().await {
            Ok(connection) => {
                let (feed, _drain) = tokio::sync::mpsc::unbounded_channel();
                connection.add_listener(Arc::new(EventPrinter { feed }));
                tokio::spawn(async move {
                    connection.wait_closed().await;
                });
            }
            Err(e) => warn!("inbound connection failed: {}", e),
        }
    }
}

async fn send(
    connect: String,
    text: Option<String>,
    file: Option<PathBuf>,
    dest: Option<String>,
    priority: Priority,
    tempo: Option<i64>,
) -> Result<()> {
    let mut params = Parameters::new();
    if let Some(rate) = tempo {
        params.set_tempo(rate)?;
    }

    let connection: Connection = dial(&connect, params).await?;
    let (feed, mut events) = tokio::sync::mpsc::unbounded_channel();
    connection.add_listener(Arc::new(EventPrinter { feed }));

    if let Some(message) = text {
        let id = connection.send_object(message, priority).await?;
        info!("queued object {}", id);
    }

    if let Some(source) = file {
        let fallback = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".into());
        let destination = dest.unwrap_or(fallback);
        let id = connection.send_file(&source, &destination, priority).await?;
        info!("queued file {} as {:?}", id, destination);

        // hold the connection open until the transfer settles
        loop {
            match tokio::time::timeout(Duration::from_secs(120), events.recv()).await {
                Ok(Some(event))
                    if event.starts_with("FileConfirmed")
                        || event.starts_with("FileAborted")
                        || event.starts_with("Closed") =>
                {
                    break
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    error!("no confirmation within 120s");
                    break;
                }
            }
        }
    }

    connection.close().await;
    connection.wait_closed().await;
    Ok(())
}
