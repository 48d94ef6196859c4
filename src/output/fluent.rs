//! Fluentd forward-protocol sink: flattens each frame and posts it as a
//! tagged `[tag, time, record]` msgpack message over TCP.
//!
//! `rmp-serde` stands in for the original `fluent-logger-golang`
//! client; tag syntax is validated once at config-load time
//! (`config::validate_tag`), not on every write.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::flatten::{flatten, FlattenOptions};
use crate::output::Sink;

pub struct FluentSink {
    addr: String,
    tag: String,
    flat: FlattenOptions,
    stream: Option<TcpStream>,
}

impl FluentSink {
    pub fn new(addr: String, tag: String, flat: FlattenOptions) -> Self {
        Self { addr, tag, flat, stream: None }
    }
}

#[async_trait]
impl Sink for FluentSink {
    async fn open(&mut self) -> Result<()> {
        self.stream = Some(TcpStream::connect(&self.addr).await.with_context(|| format!("dialing {}", self.addr))?);
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let record = match flatten(frame, &self.flat) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(%err, "dropping frame: failed to flatten for fluent sink");
                return Ok(());
            }
        };
        let time = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        let payload = rmp_serde::to_vec(&(&self.tag, time, &record)).context("encoding fluent forward message")?;

        let stream = self.stream.as_mut().context("fluent sink not open")?;
        stream.write_all(&payload).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.stream = None;
    }

    async fn tick(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream.flush().await?;
        }
        Ok(())
    }
}
