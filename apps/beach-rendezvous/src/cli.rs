use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::{DEFAULT_LISTEN_ADDR, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_WS_PATH};
use crate::envelope::{self, SignalEnvelope};

#[derive(Parser, Debug)]
#[command(name = "beach-rendezvous", version)]
#[command(about = "Beach rendezvous relay and probe client")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Relay options (used when no subcommand is given)
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a relay, send one envelope and print what comes back
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "BEACH_RENDEZVOUS_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Path that accepts websocket upgrades.
    #[arg(long, env = "BEACH_RENDEZVOUS_WS_PATH", default_value = DEFAULT_WS_PATH)]
    pub ws_path: String,

    /// Largest websocket message accepted after reassembly.
    #[arg(
        long,
        env = "BEACH_RENDEZVOUS_MAX_MESSAGE_BYTES",
        default_value_t = DEFAULT_MAX_MESSAGE_BYTES
    )]
    pub max_message_bytes: usize,

    /// Time given to connections to flush their close frames on shutdown.
    #[arg(long, env = "BEACH_RENDEZVOUS_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Relay websocket URL
    #[arg(short, long, default_value = "ws://localhost:5204/ws")]
    pub url: String,

    /// Identifier to send as senderId
    #[arg(short, long)]
    pub sender: String,

    /// Identifier to send as targetUserId
    #[arg(short, long)]
    pub target: Option<String>,

    /// Envelope type
    #[arg(long = "type", default_value = "register")]
    pub kind: String,

    /// JSON payload for the data field
    #[arg(long, default_value = "null")]
    pub data: String,

    /// Seconds to keep printing incoming envelopes
    #[arg(long, default_value_t = 5)]
    pub listen_secs: u64,
}

impl ProbeArgs {
    pub fn envelope(&self) -> Result<SignalEnvelope> {
        let data: serde_json::Value = serde_json::from_str(&self.data)
            .with_context(|| format!("--data is not valid JSON: {}", self.data))?;
        Ok(SignalEnvelope::new(
            self.kind.clone(),
            self.sender.clone(),
            self.target.clone(),
            data,
        ))
    }
}

pub async fn run_probe(args: ProbeArgs) -> Result<()> {
    let outgoing = args.envelope()?;
    debug!("Connecting to {} as {}", args.url, args.sender);

    let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(args.url.as_str()))
        .await
        .context("connection timeout - is the relay running?")?
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let (mut write, mut read) = ws_stream.split();

    let text = envelope::encode(&outgoing)?;
    write.send(Message::Text(text.into())).await?;
    println!("sent {} as {}", outgoing.kind(), outgoing.sender_id);

    let deadline = Instant::now() + Duration::from_secs(args.listen_secs);
    loop {
        let next = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(next) => next,
            Err(_) => break,
        };
        match next {
            Some(Ok(Message::Text(text))) => match envelope::decode(text.as_str()) {
                Ok(incoming) => println!(
                    "received {} from {}: {}",
                    incoming.kind(), incoming.sender_id, incoming.data
                ),
                Err(err) => warn!("relay sent an unreadable envelope: {}", err),
            },
            Some(Ok(Message::Close(frame))) => {
                println!("relay closed the connection: {:?}", frame);
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err).context("websocket error"),
            None => break,
        }
    }

    let _ = write.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn no_subcommand_runs_relay_with_defaults() {
        let cli = Cli::try_parse_from(["beach-rendezvous"]).expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.ws_path, DEFAULT_WS_PATH);
        assert_eq!(cli.serve.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
    }

    #[test_timeout::timeout]
    fn serve_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "beach-rendezvous",
            "--listen-addr",
            "127.0.0.1:7000",
            "--ws-path",
            "/signal",
        ])
        .expect("parse");
        assert_eq!(cli.serve.listen_addr, "127.0.0.1:7000");
        assert_eq!(cli.serve.ws_path, "/signal");
    }

    #[test_timeout::timeout]
    fn probe_builds_envelope() {
        let cli = Cli::try_parse_from([
            "beach-rendezvous",
            "probe",
            "--sender",
            "X",
            "--target",
            "Y",
            "--type",
            "offer",
            "--data",
            r#"{"sdp":"v=0"}"#,
        ])
        .expect("parse");

        let Some(Commands::Probe(args)) = cli.command else {
            panic!("expected probe subcommand");
        };
        let envelope = args.envelope().expect("envelope");
        assert_eq!(envelope.kind(), "offer");
        assert_eq!(envelope.sender_id, "X");
        assert_eq!(envelope.target(), Some("Y"));
        assert_eq!(envelope.data["sdp"], "v=0");
    }

    #[test_timeout::timeout]
    fn probe_rejects_invalid_data() {
        let cli = Cli::try_parse_from([
            "beach-rendezvous",
            "probe",
            "--sender",
            "X",
            "--data",
            "{oops",
        ])
        .expect("parse");
        let Some(Commands::Probe(args)) = cli.command else {
            panic!("expected probe subcommand");
        };
        assert!(args.envelope().is_err());
    }
}
