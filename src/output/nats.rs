//! NATS sink: batches flattened records in memory and publishes them as a
//! single JSON array every 10 ms, flushing again on close.
//!
//! Grounded in `dnstap_nats_output.go`'s `nats.JSON_ENCODER` publish;
//! `async-nats` replaces the deprecated `nats.go` client. The 10 ms batch
//! window is its own `tick_interval` override rather than the generic
//! 1 s `FlushTimeout` the other sinks tick on (§5's NATS batch publish
//! interval is distinct from the encoder-flush timeout), so `drain_loop`
//! calls `tick()` -> `flush()` every 10 ms regardless of write() activity.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::flatten::{flatten, FlattenOptions};
use crate::output::Sink;
use crate::types::DnstapRecord;

const BATCH_INTERVAL: Duration = Duration::from_millis(10);

pub struct NatsSink {
    host: String,
    subject: String,
    user: Option<String>,
    password: Option<String>,
    token: Option<String>,
    flat: FlattenOptions,
    client: Option<async_nats::Client>,
    pending: Vec<DnstapRecord>,
}

impl NatsSink {
    pub fn new(
        host: String,
        subject: String,
        user: Option<String>,
        password: Option<String>,
        token: Option<String>,
        flat: FlattenOptions,
    ) -> Self {
        Self {
            host,
            subject,
            user,
            password,
            token,
            flat,
            client: None,
            pending: Vec::new(),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let client = self.client.as_ref().context("nats sink not open")?;
        let payload = serde_json::to_vec(&self.pending).context("encoding batch as json")?;
        client.publish(self.subject.clone(), payload.into()).await.context("publishing to nats")?;
        self.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl Sink for NatsSink {
    async fn open(&mut self) -> Result<()> {
        let mut opts = async_nats::ConnectOptions::new();
        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            opts = opts.user_and_password(user.clone(), password.clone());
        } else if let Some(token) = &self.token {
            opts = opts.token(token.clone());
        }
        self.client = Some(opts.connect(&self.host).await.with_context(|| format!("connecting to nats at {}", self.host))?);
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let record = match flatten(frame, &self.flat) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(%err, "dropping frame: failed to flatten for nats sink");
                return Ok(());
            }
        };
        self.pending.push(record);
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.flush().await;
        if let Some(client) = self.client.take() {
            let _ = client.flush().await;
        }
    }

    async fn tick(&mut self) -> Result<()> {
        self.flush().await
    }

    fn tick_interval(&self) -> Duration {
        BATCH_INTERVAL
    }
}
