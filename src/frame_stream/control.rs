//! Control-frame encoding for the frame-stream wire format.
//!
//! A control frame is signalled by a zero-length data frame: `0x00000000`
//! followed by a `uint32` control-frame length and that many bytes of
//! payload (`uint32 control_type` then zero or more `{field_type,
//! field_len, field_bytes}` tuples).

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CONTROL_ACCEPT: u32 = 0x01;
pub const CONTROL_START: u32 = 0x02;
pub const CONTROL_STOP: u32 = 0x03;
pub const CONTROL_READY: u32 = 0x04;
pub const CONTROL_FINISH: u32 = 0x05;

const FIELD_CONTENT_TYPE: u32 = 0x01;

#[derive(Debug, Clone)]
pub struct ControlFrame {
    pub control_type: u32,
    pub content_types: Vec<String>,
}

impl ControlFrame {
    pub fn new(control_type: u32) -> Self {
        Self { control_type, content_types: Vec::new() }
    }

    pub fn with_content_type(control_type: u32, content_type: &str) -> Self {
        Self { control_type, content_types: vec![content_type.to_string()] }
    }

    pub fn has_content_type(&self, content_type: &str) -> bool {
        self.content_types.iter().any(|c| c == content_type)
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&self.control_type.to_be_bytes());
        for ct in &self.content_types {
            buf.extend_from_slice(&FIELD_CONTENT_TYPE.to_be_bytes());
            buf.extend_from_slice(&(ct.len() as u32).to_be_bytes());
            buf.extend_from_slice(ct.as_bytes());
        }
        buf
    }

    /// Writes the zero-length escape, the control length, and the payload.
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let payload = self.encode_payload();
        w.write_u32(0).await?;
        w.write_u32(payload.len() as u32).await?;
        w.write_all(&payload).await?;
        w.flush().await?;
        Ok(())
    }

    /// Reads a control frame body, assuming the zero-length escape has
    /// already been consumed by the caller.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let len = r.read_u32().await.context("reading control frame length")?;
        if len == 0 || len > 1 << 20 {
            bail!("invalid control frame length {len}");
        }
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf).await.context("reading control frame body")?;
        Self::decode_payload(&buf)
    }

    pub(crate) fn decode_payload(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            bail!("control frame payload too short");
        }
        let control_type = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let mut content_types = Vec::new();
        let mut offset = 4;
        while offset + 8 <= buf.len() {
            let field_type = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap());
            let field_len = u32::from_be_bytes(buf[offset + 4..offset + 8].try_into().unwrap()) as usize;
            offset += 8;
            if offset + field_len > buf.len() {
                break;
            }
            if field_type == FIELD_CONTENT_TYPE {
                if let Ok(s) = std::str::from_utf8(&buf[offset..offset + field_len]) {
                    content_types.push(s.to_string());
                }
            }
            offset += field_len;
        }
        Ok(Self { control_type, content_types })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_start_frame() {
        let frame = ControlFrame::with_content_type(CONTROL_START, "protobuf:dnstap.Dnstap");
        let mut buf = Vec::new();
        frame.write(&mut buf).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let escape = tokio::io::AsyncReadExt::read_u32(&mut cursor).await.unwrap();
        assert_eq!(escape, 0);
        let decoded = ControlFrame::read(&mut cursor).await.unwrap();
        assert_eq!(decoded.control_type, CONTROL_START);
        assert!(decoded.has_content_type("protobuf:dnstap.Dnstap"));
    }

    #[tokio::test]
    async fn ready_frame_has_no_surprise_fields() {
        let frame = ControlFrame::new(CONTROL_READY);
        assert!(frame.content_types.is_empty());
    }
}
