//! sensorlink: stream measurements from stdin to a Phoenix sensor topic.
//!
//! Connects, joins `sensor:{id}`, sends every stdin line as a measurement
//! (directly or through the backpressure buffer) and prints client events
//! until EOF or Ctrl-C.

mod input;
mod output;

use std::path::PathBuf;

use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use sensorlink_common::Result;
use sensorlink_config::SensorLinkConfig;
use sensorlink_realtime::{Client, ClientConfig};

use crate::input::parse_line;
use crate::output::format_event;

#[derive(Parser)]
#[command(name = "sensorlink", about = "Stream sensor measurements over Phoenix Channels")]
struct Args {
    /// Config file (defaults to the platform config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket endpoint, overriding the config file.
    #[arg(long)]
    url: Option<String>,

    /// Auth token, overriding the config file.
    #[arg(long)]
    token: Option<String>,

    /// Sensor id; joins `sensor:{id}`.
    #[arg(short, long)]
    sensor: String,

    /// Attribute id attached to every measurement.
    #[arg(short, long, default_value = "value")]
    attribute: String,

    /// Queue measurements under the server's backpressure policy.
    #[arg(long)]
    buffered: bool,
}

fn load(args: &Args) -> Result<SensorLinkConfig> {
    let mut config = match &args.config {
        Some(path) => sensorlink_config::load_from_path(path)?,
        None => sensorlink_config::load_config()?,
    };
    if let Some(url) = &args.url {
        config.connection.url = url.clone();
    }
    if let Some(token) = &args.token {
        config.connection.auth_token = Some(token.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensorlink=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load(&args)?;
    let client = Client::new(ClientConfig::from(&config));

    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", format_event(&event)),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    client.connect().await?;
    client.join_sensor(&args.sensor, json!({})).await?;
    tracing::info!(sensor = %args.sensor, buffered = args.buffered, "Streaming stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        let Some(payload) = parse_line(&line) else {
            continue;
        };

        let sent = if args.buffered {
            client
                .buffer_measurement(&args.sensor, &args.attribute, payload)
                .await
        } else {
            client
                .send_measurement(&args.sensor, &args.attribute, payload)
                .await
        };
        if let Err(e) = sent {
            tracing::warn!(sensor = %args.sensor, error = %e, "Measurement not sent");
        }
    }

    if args.buffered {
        match client.flush_buffered_measurements(&args.sensor).await {
            Ok(n) => tracing::info!(flushed = n, "Flushed buffered measurements"),
            Err(e) => tracing::warn!(error = %e, "Final flush failed"),
        }
    }
    if let Err(e) = client.leave(&sensorlink_realtime::protocol::sensor_topic(&args.sensor)).await {
        tracing::warn!(error = %e, "Leave failed");
    }
    client.disconnect().await;
    Ok(())
}
