//! Control-client side of the daemon protocol.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};

use crate::protocol::{Request, Response, DEFAULT_PORT};
use crate::store::{DaemonInfo, StatePaths};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct DaemonClient {
    addr: String,
    /// Replies can legitimately take as long as a server-side delay.
    response_timeout: Option<Duration>,
}

impl DaemonClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            response_timeout: None,
        }
    }

    /// Explicit host/port win; otherwise use the running daemon's recorded
    /// endpoint, then the defaults.
    pub fn resolve(host: Option<&str>, port: Option<u16>, paths: &StatePaths) -> Self {
        let recorded = DaemonInfo::load(&paths.daemon).ok();
        let host = host
            .map(str::to_string)
            .or_else(|| recorded.as_ref().map(|info| info.host.clone()))
            .unwrap_or_else(|| crate::config::DEFAULT_HOST.to_string());
        let port = port
            .or_else(|| recorded.as_ref().map(|info| info.port))
            .unwrap_or(DEFAULT_PORT);
        Self::new(format!("{host}:{port}"))
    }

    pub fn with_response_timeout(mut self, limit: Duration) -> Self {
        self.response_timeout = Some(limit);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request on a fresh connection and wait for its reply.
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .with_context(|| format!("timed out connecting to fleet daemon at {}", self.addr))?
            .with_context(|| format!("fleet daemon not reachable at {}", self.addr))?;
        let (reader, mut writer) = stream.into_split();

        let mut body = serde_json::to_vec(request)?;
        body.push(b'\n');
        writer
            .write_all(&body)
            .await
            .context("failed sending request")?;

        let mut lines = BufReader::new(reader).lines();
        let next = lines.next_line();
        let line = match self.response_timeout {
            Some(limit) => timeout(limit, next)
                .await
                .context("timed out waiting for daemon reply")?,
            None => next.await,
        }
        .context("failed reading daemon reply")?;

        let Some(line) = line else {
            bail!("daemon closed the connection without replying");
        };
        serde_json::from_str(&line).with_context(|| format!("invalid daemon reply: {line}"))
    }
}
