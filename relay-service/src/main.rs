//! `pagetap-relay` entry point.
//!
//! ## Modes
//!
//! - **`serve`**: run the relay process. Accept bridge and client
//!   connections on the socket, deliver captures to the backend, and keep
//!   the backend command link up when one is configured.
//! - **`bridge`**: attach to a browser over CDP, install the interception
//!   hook in every matching page, and forward what the pages emit.
//! - **`status`**: ask a running relay for its counters and exit.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use pagetap_core::{PagetapConfig, RelayProcess};
use pagetap_relay::bridge_client::{BridgeOptions, run_bridge};
use pagetap_relay::ipc::{self, BridgeHub, RelayService};
use pagetap_relay::link::{LinkSettings, run_link};
use pagetap_relay::protocol::{METHOD_HELLO, METHOD_SERVICE_STATUS, ServiceStatusResult};
use pagetap_relay::{PROTOCOL_VERSION, logging, resolve_socket_path};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "pagetap-relay", version, about = "Capture page API traffic and relay it to a backend")]
struct Cli {
    /// Config file (defaults to the user config directory).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Relay socket path.
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay process.
    Serve,
    /// Connect a browser to a running relay.
    Bridge {
        /// Remote debugging port of the browser.
        #[arg(long)]
        debug_port: Option<u16>,
        /// Record network traffic of the first matching page.
        #[arg(long)]
        record: bool,
    },
    /// Print the status of a running relay.
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PagetapConfig> {
    let config = match path {
        Some(path) => PagetapConfig::load_from_path(path),
        None => PagetapConfig::load(),
    };
    config.context("failed to load pagetap config")
}

/// Cancel `token` on Ctrl+C.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("signal received, shutting down");
        }
        token.cancel();
    });
}

async fn serve(config: PagetapConfig, socket: PathBuf) -> anyhow::Result<()> {
    tracing::info!("pagetap-relay v{} starting", env!("CARGO_PKG_VERSION"));

    let hub = Arc::new(BridgeHub::new());
    let relay = Arc::new(
        RelayProcess::from_config(&config, hub.clone()).context("failed to start relay")?,
    );
    let service = Arc::new(RelayService::new(Arc::clone(&relay), hub));

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let health = tokio::spawn(Arc::clone(&relay).run_health_loop(cancel.child_token()));
    let link = LinkSettings::from_config(&config.backend)
        .map(|settings| tokio::spawn(run_link(Arc::clone(&relay), settings, cancel.child_token())));

    let listener = ipc::bind(&socket)
        .with_context(|| format!("failed to bind {}", socket.display()))?;
    tracing::info!(socket = %socket.display(), instance_id = relay.instance_id(), "relay listening");

    let served = ipc::serve(service, listener, cancel.clone()).await;
    cancel.cancel();

    // The health loop flushes the registry on its way out.
    if health.await.is_err() {
        relay.shutdown().await;
    }
    if let Some(link) = link {
        let _ = link.await;
    }
    let _ = std::fs::remove_file(&socket);
    served.context("relay socket server failed")?;
    tracing::info!("pagetap-relay exiting cleanly");
    Ok(())
}

async fn bridge(
    config: PagetapConfig,
    socket: PathBuf,
    debug_port: Option<u16>,
    record: bool,
) -> anyhow::Result<()> {
    let options = BridgeOptions {
        socket_path: socket,
        debug_port: debug_port.unwrap_or(config.recorder.debug_port),
        record_traffic: record || config.recorder.record_traffic,
    };
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    run_bridge(&config, options, cancel).await?;
    Ok(())
}

/// Synchronous client: hello, then `service.status`.
fn status(socket: &Path, json: bool) -> anyhow::Result<()> {
    let mut stream = std::os::unix::net::UnixStream::connect(socket)
        .with_context(|| format!("cannot connect to {}", socket.display()))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = std::io::BufReader::new(stream.try_clone()?);

    let mut call = |id: u64, method: &str, params: serde_json::Value| -> anyhow::Result<serde_json::Value> {
        let request = serde_json::json!({"id": id, "method": method, "params": params});
        stream.write_all(serde_json::to_string(&request)?.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;

        let mut line = String::new();
        reader.read_line(&mut line)?;
        let mut response: serde_json::Value =
            serde_json::from_str(line.trim()).context("invalid response JSON")?;
        if let Some(result) = response.get_mut("result") {
            return Ok(result.take());
        }
        let message = response
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        bail!("{method} failed: {message}")
    };

    call(
        0,
        METHOD_HELLO,
        serde_json::json!({
            "protocol_version": PROTOCOL_VERSION,
            "client_version": env!("CARGO_PKG_VERSION"),
        }),
    )?;
    let result = call(1, METHOD_SERVICE_STATUS, serde_json::json!({}))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    let status: ServiceStatusResult =
        serde_json::from_value(result).context("unexpected status shape")?;
    let snapshot = &status.snapshot;
    let counters = &snapshot.counters;
    println!("instance:   {}", snapshot.instance_id);
    println!("backend:    {}", snapshot.connection_state);
    println!("uptime:     {}s", snapshot.uptime_secs);
    println!("bridges:    {} ({} surfaces)", status.bridges, status.surfaces.len());
    println!("endpoints:  {}", snapshot.endpoints);
    println!(
        "captures:   {} received, {} malformed, {} delivered, {} failed",
        counters.captures_received,
        counters.captures_malformed,
        counters.delivered,
        counters.delivery_failures
    );
    println!("queue:      {} queued, {} dropped", snapshot.queue_depth, snapshot.queue_dropped);
    println!(
        "commands:   {} issued, {} resolved, {} timed out, {} rejected, {} pending",
        counters.commands_issued,
        counters.commands_resolved,
        counters.commands_timed_out,
        counters.commands_rejected,
        snapshot.pending_commands
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing();

    let config = load_config(cli.config.as_deref())?;
    let socket = resolve_socket_path(cli.socket.as_deref(), &config.relay);

    match cli.command {
        Command::Status { json } => status(&socket, json),
        Command::Serve => runtime()?.block_on(serve(config, socket)),
        Command::Bridge { debug_port, record } => {
            runtime()?.block_on(bridge(config, socket, debug_port, record))
        }
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}
