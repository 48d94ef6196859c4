//! TCP and Unix listener inputs: accept connections, run each one through
//! the bidirectional FrameStream handshake as the reader, and push every
//! decoded frame onto the shared buffer.
//!
//! Grounded in `dnstap_fstrm_socket_input.go`/
//! `dnstap_fstrm_unix_socket_input.go`'s accept loop, and in
//! `dns_server.rs`'s spawn-a-task-per-connection shape.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::buffer::RingBuffer;
use crate::frame_stream::BidirectionalDecoder;

/// Sent when an input hits an error it cannot run past: a bind failure, or
/// an accept error that didn't come from the listener being torn down for
/// shutdown. Whoever holds the receiving end treats this as fatal.
pub type FatalSender = UnboundedSender<anyhow::Error>;

pub async fn run_tcp(addr: String, buffer: Arc<RingBuffer>, cancel: CancellationToken, fatal: FatalSender) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(err) => {
            tracing::error!(%addr, %err, "failed to bind tcp input");
            let _ = fatal.send(anyhow::anyhow!("binding tcp input {addr}: {err}"));
            return;
        }
    };
    tracing::info!(%addr, "tcp input listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let buffer = buffer.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            tracing::debug!(%peer, "tcp input accepted connection");
                            handle_tcp(stream, &buffer, cancel).await;
                        });
                    }
                    Err(err) if cancel.is_cancelled() => {
                        tracing::debug!(%err, "tcp input accept error during shutdown, ignoring");
                    }
                    Err(err) => {
                        tracing::error!(%addr, %err, "tcp input accept failed fatally");
                        let _ = fatal.send(anyhow::anyhow!("tcp input {addr} accept failed: {err}"));
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

async fn handle_tcp(stream: TcpStream, buffer: &RingBuffer, cancel: CancellationToken) {
    let mut decoder = match BidirectionalDecoder::handshake(stream).await {
        Ok(d) => d,
        Err(err) => {
            tracing::debug!(%err, "tcp input handshake failed");
            return;
        }
    };
    loop {
        tokio::select! {
            frame = decoder.next_frame() => {
                match frame {
                    Ok(Some(frame)) => buffer.write(frame),
                    Ok(None) => return,
                    Err(err) => {
                        tracing::debug!(%err, "tcp input decode error");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

pub async fn run_unix(path: PathBuf, user: Option<String>, buffer: Arc<RingBuffer>, cancel: CancellationToken, fatal: FatalSender) {
    let _ = std::fs::remove_file(&path);
    let listener = match UnixListener::bind(&path) {
        Ok(l) => l,
        Err(err) => {
            tracing::error!(path = %path.display(), %err, "failed to bind unix input");
            let _ = fatal.send(anyhow::anyhow!("binding unix input {}: {err}", path.display()));
            return;
        }
    };
    if let Some(user) = &user {
        if let Err(err) = chown_to_user(&path, user) {
            tracing::error!(path = %path.display(), %user, %err, "failed to chown unix socket");
        }
    }
    tracing::info!(path = %path.display(), "unix input listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let buffer = buffer.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            handle_unix(stream, &buffer, cancel).await;
                        });
                    }
                    Err(err) if cancel.is_cancelled() => {
                        tracing::debug!(%err, "unix input accept error during shutdown, ignoring");
                    }
                    Err(err) => {
                        tracing::error!(path = %path.display(), %err, "unix input accept failed fatally");
                        let _ = fatal.send(anyhow::anyhow!("unix input {} accept failed: {err}", path.display()));
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

async fn handle_unix(stream: UnixStream, buffer: &RingBuffer, cancel: CancellationToken) {
    let mut decoder = match BidirectionalDecoder::handshake(stream).await {
        Ok(d) => d,
        Err(err) => {
            tracing::debug!(%err, "unix input handshake failed");
            return;
        }
    };
    loop {
        tokio::select! {
            frame = decoder.next_frame() => {
                match frame {
                    Ok(Some(frame)) => buffer.write(frame),
                    Ok(None) => return,
                    Err(err) => {
                        tracing::debug!(%err, "unix input decode error");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

pub(crate) fn chown_to_user(path: &std::path::Path, user: &str) -> anyhow::Result<()> {
    use nix::unistd::{chown, User};

    let entry = User::from_name(user)?.ok_or_else(|| anyhow::anyhow!("no such user: {user}"))?;
    chown(path, Some(entry.uid), Some(entry.gid))?;
    Ok(())
}
