use super::control::{ControlFrame, CONTROL_ACCEPT, CONTROL_FINISH, CONTROL_READY, CONTROL_START, CONTROL_STOP};
use super::CONTENT_TYPE;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

async fn read_escaped_control<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ControlFrame> {
    let len = reader.read_u32().await.context("reading control escape")?;
    if len != 0 {
        bail!("expected control frame (zero-length escape), got data frame of length {len}");
    }
    ControlFrame::read(reader).await
}

/// One-way decoder used for file inputs: the writer emits `START`, data
/// frames, then `STOP`.
pub struct UnidirectionalDecoder<R> {
    reader: R,
    finished: bool,
}

impl<R: AsyncRead + Unpin> UnidirectionalDecoder<R> {
    pub async fn handshake(mut reader: R) -> Result<Self> {
        let start = read_escaped_control(&mut reader).await?;
        if start.control_type != CONTROL_START {
            bail!("expected START control frame, got type {}", start.control_type);
        }
        if !start.has_content_type(CONTENT_TYPE) {
            bail!("content type mismatch in START frame");
        }
        Ok(Self { reader, finished: false })
    }

    /// Returns the next data frame, `Ok(None)` on a clean `STOP`/EOF, or a
    /// fatal `Err` for truncated frames or an unknown content type.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        next_frame_inner(&mut self.reader, &mut self.finished).await
    }
}

/// Handshake-bearing decoder used for TCP/Unix socket inputs: the reader
/// (us) sends `READY`, the peer replies `ACCEPT`, we send `START`, then data
/// frames flow until the peer sends `STOP`; we acknowledge with `FINISH`.
pub struct BidirectionalDecoder<S> {
    stream: S,
    finished: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BidirectionalDecoder<S> {
    pub async fn handshake(mut stream: S) -> Result<Self> {
        ControlFrame::with_content_type(CONTROL_READY, CONTENT_TYPE)
            .write(&mut stream)
            .await?;
        let accept = read_escaped_control(&mut stream).await?;
        if accept.control_type != CONTROL_ACCEPT {
            bail!("expected ACCEPT control frame, got type {}", accept.control_type);
        }
        if !accept.has_content_type(CONTENT_TYPE) {
            bail!("content type mismatch in ACCEPT frame");
        }
        ControlFrame::with_content_type(CONTROL_START, CONTENT_TYPE)
            .write(&mut stream)
            .await?;
        Ok(Self { stream, finished: false })
    }

    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let frame = next_frame_inner(&mut self.stream, &mut self.finished).await?;
        if frame.is_none() && self.finished {
            // best-effort ack; a peer that has already hung up is not fatal here.
            let _ = ControlFrame::new(CONTROL_FINISH).write(&mut self.stream).await;
        }
        Ok(frame)
    }
}

async fn next_frame_inner<R: AsyncRead + Unpin>(reader: &mut R, finished: &mut bool) -> Result<Option<Bytes>> {
    if *finished {
        return Ok(None);
    }
    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                *finished = true;
                return Ok(None);
            }
            Err(e) => return Err(e).context("reading frame length"),
        };
        if len == 0 {
            let control = ControlFrame::read(reader).await?;
            match control.control_type {
                CONTROL_STOP => {
                    *finished = true;
                    return Ok(None);
                }
                _ => continue, // unknown control type: ignore per protocol
            }
        }
        if len > MAX_FRAME_LEN {
            bail!("frame of {len} bytes exceeds sanity limit; truncated/corrupt stream");
        }
        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .context("truncated data frame is fatal for the stream")?;
        return Ok(Some(Bytes::from(buf)));
    }
}
