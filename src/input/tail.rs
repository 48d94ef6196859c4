//! Tail input: polls a glob pattern every 60 seconds for new files, then
//! watches each matched file for writes and resumes reading from wherever
//! it left off. A file with no modification for 5 minutes is retired; the
//! search loop will pick it back up if it starts growing again.
//!
//! Grounded in `dnstap_fstrm_tail_input.go`'s `runSearchPath`/
//! `runReadFile` split; `notify` replaces `fsnotify`.
//!
//! `UnidirectionalDecoder` latches closed on its first EOF, which fits a
//! file read once start-to-finish but not a file that keeps growing, so
//! frames here are read with a byte offset tracked across polls instead
//! of through that decoder. Only the initial `START` control frame is
//! parsed through the shared `ControlFrame` reader; a `STOP` mid-file
//! (not expected from a log writer that's still live) ends the tail.

use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::RingBuffer;
use crate::frame_stream::control::{ControlFrame, CONTROL_START, CONTROL_STOP};

const MAX_CONTROL_LEN: u32 = 1 << 20;

const SEARCH_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_RETIREMENT: Duration = Duration::from_secs(5 * 60);
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub async fn run(pattern: String, buffer: Arc<RingBuffer>, cancel: CancellationToken) {
    let mut tracked: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(SEARCH_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let matches = match glob::glob(&pattern) {
                    Ok(paths) => paths.filter_map(Result::ok).filter_map(|p| p.to_str().map(str::to_string)).collect::<Vec<_>>(),
                    Err(err) => {
                        tracing::warn!(pattern = %pattern, %err, "tail input glob pattern error");
                        continue;
                    }
                };
                for filename in matches {
                    if tracked.insert(filename.clone()) {
                        let buffer = buffer.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(err) = tail_file(&filename, &buffer, cancel).await {
                                tracing::warn!(path = %filename, %err, "tail input file reader exited");
                            }
                        });
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

async fn tail_file(path: &str, buffer: &RingBuffer, cancel: CancellationToken) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;
    watcher.watch(std::path::Path::new(path), RecursiveMode::NonRecursive)?;

    let mut pos = consume_start_frame(path).await?;

    loop {
        let (new_pos, stopped) = read_available_frames(path, pos, buffer).await?;
        pos = new_pos;
        if stopped {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(IDLE_RETIREMENT) => return Ok(()),
            _ = cancel.cancelled() => return Ok(()),
            event = rx.recv() => {
                match event {
                    Some(event) if matches!(event.kind, EventKind::Modify(_)) => continue,
                    Some(_) => continue,
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Reads past the leading `START` control frame, returning the byte
/// offset data frames begin at. Offsets are tracked by exact byte counts
/// rather than the file's own cursor, since a later pass reopens the file
/// and seeks rather than keeping the handle alive across polls.
async fn consume_start_frame(path: &str) -> anyhow::Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.read_u32().await?;
    anyhow::ensure!(len == 0, "tail input expected a START control frame at the head of {path}");
    let clen = file.read_u32().await?;
    anyhow::ensure!(clen > 0 && clen <= MAX_CONTROL_LEN, "invalid control frame length {clen} in {path}");
    let mut cbuf = vec![0u8; clen as usize];
    file.read_exact(&mut cbuf).await?;
    let start = ControlFrame::decode_payload(&cbuf)?;
    anyhow::ensure!(start.control_type == CONTROL_START, "tail input expected START, got type {}", start.control_type);
    Ok(8 + clen as u64)
}

/// Reads every complete data frame available from `pos` onward, stopping
/// cleanly at whatever incomplete tail the writer hasn't finished
/// flushing yet. Returns the offset to resume from next time, and whether
/// a `STOP` control frame ended the stream for good.
async fn read_available_frames(path: &str, pos: u64, buffer: &RingBuffer) -> anyhow::Result<(u64, bool)> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(pos)).await?;
    let mut offset = pos;

    loop {
        let len = match file.read_u32().await {
            Ok(len) => len,
            Err(_) => return Ok((offset, false)), // incomplete length prefix: wait for more data
        };

        if len == 0 {
            let clen = match file.read_u32().await {
                Ok(clen) => clen,
                Err(_) => return Ok((offset, false)),
            };
            if clen == 0 || clen > MAX_CONTROL_LEN {
                return Ok((offset, false));
            }
            let mut cbuf = vec![0u8; clen as usize];
            if file.read_exact(&mut cbuf).await.is_err() {
                return Ok((offset, false));
            }
            offset += 8 + clen as u64;
            let control = ControlFrame::decode_payload(&cbuf)?;
            if control.control_type == CONTROL_STOP {
                return Ok((offset, true));
            }
            continue;
        }

        anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds sanity limit in {path}");
        let mut data = vec![0u8; len as usize];
        if file.read_exact(&mut data).await.is_err() {
            return Ok((offset, false)); // incomplete frame body: wait for more data
        }
        offset += 4 + len as u64;
        buffer.write(bytes::Bytes::from(data));
    }
}
