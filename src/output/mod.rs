//! Sinks and the output supervisor that drives each one.
//!
//! Every sink implements the same 3-method capability set (`open`,
//! `write`, `close`); the supervisor is sink-agnostic and owns the
//! retry/reopen/drain lifecycle, grounded in `dnstap_output.go`'s outer
//! `Run`/inner `run` loop shape.

pub mod file;
pub mod fluent;
pub mod kafka;
pub mod nats;
pub mod prometheus;
pub mod socket;
pub mod stdout;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::buffer::RingBuffer;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

/// A fan-out destination. Confined to its supervisor's task — no method
/// needs `Send + Sync` beyond what a single-owner `Box<dyn Sink>` gives
/// for free.
#[async_trait]
pub trait Sink: Send {
    async fn open(&mut self) -> Result<()>;
    async fn write(&mut self, frame: &[u8]) -> Result<()>;
    async fn close(&mut self);

    /// Called on the `tick_interval` ticker. Socket sinks flush their
    /// encoder here; the file sink additionally checks whether its
    /// strftime-formatted target name has changed.
    async fn tick(&mut self) -> Result<()> {
        Ok(())
    }

    /// Cadence `drain_loop` ticks this sink on. Defaults to the generic
    /// `FlushTimeout`; a sink with its own independent timer (e.g. the
    /// NATS sink's 10 ms batch window) overrides this instead of relying
    /// on write() activity to drive its timer.
    fn tick_interval(&self) -> Duration {
        FLUSH_TIMEOUT
    }
}

/// Runs one output's `open -> drain -> close -> (reopen unless
/// cancelled)` outer loop until `cancel` fires and the buffer is drained.
pub async fn run_supervisor(name: String, buffer: Arc<RingBuffer>, mut sink: Box<dyn Sink>, cancel: CancellationToken) {
    loop {
        if let Err(err) = sink.open().await {
            tracing::warn!(sink = %name, %err, "failed to open sink, retrying");
            tokio::select! {
                _ = tokio::time::sleep(REOPEN_BACKOFF) => continue,
                _ = cancel.cancelled() => {
                    buffer.close();
                    drain_remaining(&name, &buffer, &mut sink).await;
                    sink.close().await;
                    return;
                }
            }
        }

        let cancelled = drain_loop(&name, &buffer, &mut sink, &cancel).await;
        sink.close().await;

        if cancelled {
            return;
        }
        // write error closed the sink mid-drain: reopen on the next pass.
    }
}

/// Reads frames and writes them to the sink until a write fails or
/// `cancel` fires. Returns `true` when shutdown ran to completion
/// (buffer drained and closed), `false` when a write error means the
/// supervisor should reopen and retry.
async fn drain_loop(name: &str, buffer: &RingBuffer, sink: &mut Box<dyn Sink>, cancel: &CancellationToken) -> bool {
    let mut ticker = tokio::time::interval(sink.tick_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = buffer.read() => {
                match frame {
                    Some(frame) => {
                        if let Err(err) = sink.write(&frame).await {
                            tracing::debug!(sink = %name, %err, "sink write failed, closing for reopen");
                            return false;
                        }
                    }
                    None => return true, // buffer closed and drained
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = sink.tick().await {
                    tracing::debug!(sink = %name, %err, "sink tick failed, closing for reopen");
                    return false;
                }
            }
            _ = cancel.cancelled() => {
                buffer.close();
                drain_remaining(name, buffer, sink).await;
                return true;
            }
        }
    }
}

async fn drain_remaining(name: &str, buffer: &RingBuffer, sink: &mut Box<dyn Sink>) {
    while let Some(frame) = buffer.read().await {
        if let Err(err) = sink.write(&frame).await {
            tracing::debug!(sink = %name, %err, "sink write failed while draining on shutdown");
            break;
        }
    }
}
