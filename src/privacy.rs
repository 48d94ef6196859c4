//! Hot-reloaded salt for IP address hashing.
//!
//! Lazily loads the salt from a configured path on first access, or
//! generates a random one if no path is configured. When a path is given,
//! a `notify` watcher task reloads the salt on `WRITE` events and swaps it
//! in behind a mutex, so concurrent hashers observe either the prior or
//! the next full salt, never a torn value.
//!
//! This replaces `plugin::reload`'s poll-and-hash-compare loop with an
//! actual filesystem watch, since this salt needs a prompt reload rather
//! than a periodic one.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use rand::RngCore;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const SALT_LEN: usize = 32;

struct Inner {
    salt: Mutex<Vec<u8>>,
    path: Option<PathBuf>,
}

/// Shared handle to the current salt. Cheaply cloneable; every clone sees
/// the same underlying value and the same reloads.
#[derive(Clone)]
pub struct SaltManager {
    inner: Arc<Inner>,
}

impl SaltManager {
    /// Loads the salt from `path` if given, otherwise generates one
    /// cryptographically at random. Spawns a watcher task when `path` is
    /// `Some`; the returned `JoinHandle` should be held by the caller so
    /// the watcher is cancelled with everything else on shutdown.
    pub fn start(path: Option<PathBuf>) -> Result<(Self, Option<tokio::task::JoinHandle<()>>)> {
        let salt = match &path {
            Some(p) => load_salt_file(p).with_context(|| format!("loading salt file {}", p.display()))?,
            None => random_salt(),
        };

        let manager = Self { inner: Arc::new(Inner { salt: Mutex::new(salt), path: path.clone() }) };

        let watcher_handle = match path {
            Some(p) => Some(manager.clone().spawn_watcher(p)?),
            None => None,
        };

        Ok((manager, watcher_handle))
    }

    /// A snapshot of the current salt, taken under the lock. Callers
    /// should take one snapshot per record and hash with it, rather than
    /// re-reading mid-computation.
    pub fn current(&self) -> Vec<u8> {
        self.inner.salt.lock().unwrap().clone()
    }

    fn spawn_watcher(self, path: PathBuf) -> Result<tokio::task::JoinHandle<()>> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .context("constructing salt file watcher")?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching salt file {}", path.display()))?;

        let handle = tokio::spawn(async move {
            // keep the watcher alive for the lifetime of the task
            let _watcher = watcher;
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Modify(_)) {
                    continue;
                }
                match load_salt_file(&path) {
                    Ok(new_salt) => {
                        *self.inner.salt.lock().unwrap() = new_salt;
                        tracing::info!(path = %path.display(), "reloaded privacy salt");
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "failed to reload privacy salt");
                    }
                }
            }
        });
        Ok(handle)
    }
}

fn load_salt_file(path: &std::path::Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn generates_random_salt_without_path() {
        let (a, handle) = SaltManager::start(None).unwrap();
        assert!(handle.is_none());
        assert_eq!(a.current().len(), SALT_LEN);

        let (b, _) = SaltManager::start(None).unwrap();
        assert_ne!(a.current(), b.current(), "two independent random salts should not collide");
    }

    #[tokio::test]
    async fn loads_salt_from_file() {
        let dir = std::env::temp_dir().join(format!("dnstap-relay-salt-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("salt.bin");
        std::fs::write(&path, b"\x0a\x14").unwrap();

        let (manager, _handle) = SaltManager::start(Some(path.clone())).unwrap();
        assert_eq!(manager.current(), b"\x0a\x14");

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"\x14\x1e\x28").unwrap();
        drop(file);

        for _ in 0..50 {
            if manager.current() == b"\x14\x1e\x28" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(manager.current(), b"\x14\x1e\x28");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
