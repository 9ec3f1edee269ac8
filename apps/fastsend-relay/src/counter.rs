use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Number of successful pairings, optionally mirrored to a file.
#[derive(Clone)]
pub struct TransferCounter {
    inner: Arc<CounterInner>,
}

struct CounterInner {
    count: AtomicU64,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl TransferCounter {
    pub fn in_memory() -> Self {
        Self::with_state(0, None)
    }

    /// Reads the stored count, creating the file with `0` when it is missing
    /// or unreadable.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let initial = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(count) => Some(count),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "transfer count unreadable; resetting");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read transfer count {}", path.display()))
            }
        };

        let counter = Self::with_state(initial.unwrap_or(0), Some(path));
        if initial.is_none() {
            counter.persist().await?;
        }
        Ok(counter)
    }

    fn with_state(count: u64, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                count: AtomicU64::new(count),
                path,
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn get(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    /// Bumps the count and schedules a write of the new value.
    pub fn increment(&self) -> u64 {
        let value = self.inner.count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.inner.path.is_some() {
            if let Ok(handle) = Handle::try_current() {
                let counter = self.clone();
                handle.spawn(async move {
                    if let Err(err) = counter.persist().await {
                        warn!(error = %err, "failed to persist transfer count");
                    }
                });
            }
        }
        value
    }

    /// Writes the current value. Writers are serialized so the file never
    /// regresses to an older count.
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let _guard = self.inner.write_lock.lock().await;
        let value = self.get();
        tokio::fs::write(path, format!("{value}\n"))
            .await
            .with_context(|| format!("failed to write transfer count {}", path.display()))?;
        debug!(value, path = %path.display(), "transfer count persisted");
        Ok(())
    }
}
