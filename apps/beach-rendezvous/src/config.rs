use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};

use crate::cli::ServeArgs;

/// Default listener; the browser client dials `ws://<host>:5204/ws`.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5204";
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub ws_path: String,
    /// Upper bound on one reassembled websocket message.
    pub max_message_bytes: usize,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5204)),
            ws_path: DEFAULT_WS_PATH.to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if !args.ws_path.starts_with('/') {
            bail!("websocket path must start with '/': {}", args.ws_path);
        }
        if args.max_message_bytes == 0 {
            bail!("max message size must be greater than zero");
        }
        Ok(RelayConfig {
            listen_addr,
            ws_path: args.ws_path,
            max_message_bytes: args.max_message_bytes,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
