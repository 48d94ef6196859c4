//! TCP and Unix stream socket sinks: dial out, complete the bidirectional
//! FrameStream handshake as the writer, and re-dial on any write error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::net::{TcpStream, UnixStream};

use crate::frame_stream::BidirectionalEncoder;
use crate::output::Sink;

pub struct TcpSink {
    addr: String,
    encoder: Option<BidirectionalEncoder<TcpStream>>,
}

impl TcpSink {
    pub fn new(addr: String) -> Self {
        Self { addr, encoder: None }
    }
}

#[async_trait]
impl Sink for TcpSink {
    async fn open(&mut self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await.with_context(|| format!("dialing {}", self.addr))?;
        self.encoder = Some(BidirectionalEncoder::handshake(stream).await?);
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        self.encoder.as_mut().context("tcp sink not open")?.write_frame(frame).await
    }

    async fn close(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            let _ = encoder.close().await;
        }
    }

    async fn tick(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.flush().await?;
        }
        Ok(())
    }
}

pub struct UnixSink {
    path: PathBuf,
    encoder: Option<BidirectionalEncoder<UnixStream>>,
}

impl UnixSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path, encoder: None }
    }
}

#[async_trait]
impl Sink for UnixSink {
    async fn open(&mut self) -> Result<()> {
        let stream = UnixStream::connect(&self.path).await.with_context(|| format!("dialing {}", self.path.display()))?;
        self.encoder = Some(BidirectionalEncoder::handshake(stream).await?);
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        self.encoder.as_mut().context("unix sink not open")?.write_frame(frame).await
    }

    async fn close(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            let _ = encoder.close().await;
        }
    }

    async fn tick(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.flush().await?;
        }
        Ok(())
    }
}
