//! One-shot file input: reads a dnstap FrameStream file once through to
//! EOF, transparently decompressing by file extension.
//!
//! Grounded in `dnstap_fstrm_file_input.go`'s extension sniff;
//! `async-compression` stands in for `compress/gzip`/`compress/bzip2`/
//! `github.com/ulikunitz/xz`.

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, BufReader};

use crate::buffer::RingBuffer;
use crate::frame_stream::UnidirectionalDecoder;

pub async fn run(path: String, buffer: Arc<RingBuffer>) {
    if let Err(err) = read_once(&path, &buffer).await {
        tracing::warn!(%path, %err, "file input finished with an error");
    }
}

async fn read_once(path: &str, buffer: &RingBuffer) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let reader = BufReader::new(file);

    let mut decoder = match extension(path) {
        Some("gz") => UnidirectionalDecoder::handshake(Box::pin(GzipDecoder::new(reader)) as BoxedReader).await?,
        Some("bz2") => UnidirectionalDecoder::handshake(Box::pin(BzDecoder::new(reader)) as BoxedReader).await?,
        Some("xz") => UnidirectionalDecoder::handshake(Box::pin(XzDecoder::new(reader)) as BoxedReader).await?,
        _ => UnidirectionalDecoder::handshake(Box::pin(reader) as BoxedReader).await?,
    };

    while let Some(frame) = decoder.next_frame().await? {
        buffer.write(frame);
    }
    Ok(())
}

type BoxedReader = std::pin::Pin<Box<dyn AsyncRead + Send>>;

fn extension(path: &str) -> Option<&str> {
    Path::new(path).extension().and_then(|e| e.to_str())
}
