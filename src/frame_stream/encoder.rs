use super::control::{ControlFrame, CONTROL_ACCEPT, CONTROL_READY, CONTROL_START, CONTROL_STOP};
use super::CONTENT_TYPE;
use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One-way encoder used for file outputs: emits `START`, data frames, then
/// `STOP` on close.
pub struct UnidirectionalEncoder<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> UnidirectionalEncoder<W> {
    pub async fn handshake(mut writer: W) -> Result<Self> {
        ControlFrame::with_content_type(CONTROL_START, CONTENT_TYPE)
            .write(&mut writer)
            .await?;
        Ok(Self { writer })
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_u32(frame.len() as u32).await?;
        self.writer.write_all(frame).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.flush().await?;
        ControlFrame::new(CONTROL_STOP).write(&mut self.writer).await?;
        Ok(())
    }
}

/// Handshake-bearing encoder used for TCP/Unix socket sinks: we (the
/// writer) wait for the peer's `READY`, reply `ACCEPT`, wait for `START`,
/// then stream data frames; on close we send `STOP` and wait for `FINISH`.
pub struct BidirectionalEncoder<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BidirectionalEncoder<S> {
    pub async fn handshake(mut stream: S) -> Result<Self> {
        let ready = read_escaped_control(&mut stream).await?;
        if ready.control_type != CONTROL_READY {
            bail!("expected READY control frame, got type {}", ready.control_type);
        }
        if !ready.has_content_type(CONTENT_TYPE) {
            bail!("content type mismatch in READY frame");
        }
        ControlFrame::with_content_type(CONTROL_ACCEPT, CONTENT_TYPE)
            .write(&mut stream)
            .await?;
        let start = read_escaped_control(&mut stream).await?;
        if start.control_type != CONTROL_START {
            bail!("expected START control frame, got type {}", start.control_type);
        }
        Ok(Self { stream })
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_u32(frame.len() as u32).await?;
        self.stream.write_all(frame).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.flush().await?;
        ControlFrame::new(CONTROL_STOP).write(&mut self.stream).await?;
        // best-effort: a peer that vanished mid-drain shouldn't fail the close.
        let _ = read_escaped_control(&mut self.stream).await;
        Ok(())
    }
}

async fn read_escaped_control<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ControlFrame> {
    let len = reader.read_u32().await.context("reading control escape")?;
    if len != 0 {
        bail!("expected control frame (zero-length escape), got data frame of length {len}");
    }
    ControlFrame::read(reader).await
}
