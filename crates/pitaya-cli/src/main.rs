//! Pitaya command-line client.
//!
//! Connects, optionally issues one request and one notify, logs every event
//! and disconnects.
//!
//! # Usage
//!
//! ```bash
//! # Plain TCP request
//! pitaya-cli --host 127.0.0.1 --port 3250 --request connector.entry --payload '{}'
//!
//! # TLS with a pinned server key
//! pitaya-cli --host game.example --port 3251 --tls --pin server.pem --request room.join
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use pitaya_client::{
    CallId, Client, ClientConfig, Event, EventFilter, EventKind, PinStore, RetryLimit, TlsOptions,
    TransportKind,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Pitaya client
#[derive(Parser, Debug)]
#[command(name = "pitaya-cli")]
#[command(about = "Connect to a Pitaya server and issue calls")]
#[command(version)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "3250")]
    port: u16,

    /// Use TLS
    #[arg(long)]
    tls: bool,

    /// Pin the public key of this certificate (PEM or DER); repeatable
    #[arg(long)]
    pin: Vec<PathBuf>,

    /// Trust this CA file when no keys are pinned
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Accept any server certificate
    #[arg(long)]
    skip_check: bool,

    /// Data sent with the session handshake
    #[arg(long)]
    handshake_data: Option<String>,

    /// Route to request
    #[arg(short, long)]
    request: Option<String>,

    /// Route to notify
    #[arg(short, long)]
    notify: Option<String>,

    /// Payload for the request and notify
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Call timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Reconnect retries before giving up
    #[arg(long, default_value = "3")]
    retries: u32,

    /// Keep the session open this many seconds to receive pushes
    #[arg(long, default_value = "0")]
    linger_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn log_event(event: &Event) {
    match event.kind {
        EventKind::UserDefinedPush => info!(
            route = event.primary.as_deref().unwrap_or_default(),
            body = event.secondary.as_deref().unwrap_or_default(),
            "push"
        ),
        kind => info!(?kind, reason = ?event.primary, "event"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let pins = PinStore::new();
    for path in &args.pin {
        let fingerprint = pins.add_pinned_key(path)?;
        info!(%fingerprint, path = %path.display(), "pinned key");
    }
    pins.skip_check(args.skip_check);
    if args.skip_check {
        warn!("certificate checks disabled");
    }

    let mut tls = TlsOptions::new();
    if let Some(ca_file) = &args.ca_file {
        tls.set_ca_file(ca_file)?;
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    let config = ClientConfig {
        transport: if args.tls { TransportKind::Tls } else { TransportKind::Tcp },
        reconnect_max_retries: RetryLimit::Limited(args.retries),
        default_request_timeout: timeout,
        ..ClientConfig::default()
    };
    let client = Client::builder(config).pins(pins).tls(tls).build()?;

    let (_, mut events) = client.subscribe(EventFilter::all())?;
    client.connect(&args.host, args.port, args.handshake_data.as_deref())?;

    loop {
        let Some(event) = events.recv().await else {
            return Err("client stopped".into());
        };
        log_event(&event);
        match event.kind {
            EventKind::Connected => break,
            EventKind::ConnectFailed | EventKind::KickedByServer => {
                client.cleanup()?;
                return Err(event.primary.unwrap_or_default().into());
            },
            _ => {},
        }
    }

    if let Some(route) = &args.notify {
        let route_name = route.clone();
        client.notify(CallId(1), route, args.payload.as_bytes(), None, move |error| match error {
            None => info!(route = %route_name, "notify sent"),
            Some(error) => warn!(route = %route_name, %error, "notify failed"),
        })?;
    }

    if let Some(route) = &args.request {
        match client.request_async(CallId(2), route, args.payload.as_bytes(), None)?.await {
            Ok(body) => info!(%route, body = %String::from_utf8_lossy(&body), "response"),
            Err(error) => error!(%route, %error, "request failed"),
        }
    }

    if args.linger_secs > 0 {
        let linger = tokio::time::sleep(Duration::from_secs(args.linger_secs));
        tokio::pin!(linger);
        loop {
            tokio::select! {
                () = &mut linger => break,
                event = events.recv() => match event {
                    Some(event) => log_event(&event),
                    None => break,
                },
            }
        }
    }

    match client.disconnect() {
        Ok(()) => {
            while let Some(event) = events.recv().await {
                log_event(&event);
                if event.kind == EventKind::Disconnect {
                    break;
                }
            }
        },
        Err(error) => warn!(%error, "session already closed"),
    }

    client.cleanup()?;
    Ok(())
}
