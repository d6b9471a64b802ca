//! JSON snapshot files shared by the file-backed state store and the ledger

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::error::{EngineError, EngineResult};

/// Distinguishes temp files of concurrent writers to the same path
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write `value` to `path` atomically through a temp file and rename
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_vec_pretty(value)?;

    let temp_path = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;
    let written = file
        .write_all(&json)
        .and_then(|()| file.sync_all())
        .and_then(|()| std::fs::rename(&temp_path, path));
    if written.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    written?;
    Ok(())
}

/// Take the write lock on a snapshot's in-memory view within `timeout`
///
/// This is the only point at which a commit may time out: once the lock is
/// held, the write always runs to completion.
pub async fn lock_for_commit<T: Send + Sync + 'static>(
    view: &Arc<RwLock<T>>,
    timeout: Duration,
) -> EngineResult<OwnedRwLockWriteGuard<T>> {
    tokio::time::timeout(timeout, view.clone().write_owned())
        .await
        .map_err(|_| EngineError::PersistenceTimeout(timeout))
}

/// Write `payload` to `path` (if any) and then publish `next` through `guard`
///
/// Runs on its own task that owns the guard, so a caller dropped mid-write
/// cannot leave the file and the in-memory view disagreeing. On a failed
/// write the view keeps its old value.
pub async fn save_and_publish<T, P>(
    path: Option<PathBuf>,
    payload: P,
    mut guard: OwnedRwLockWriteGuard<T>,
    next: T,
) -> EngineResult<()>
where
    T: Send + Sync + 'static,
    P: Serialize + Send + 'static,
{
    let writer = tokio::spawn(async move {
        if let Some(path) = path {
            tokio::task::spawn_blocking(move || save_json(&path, &payload))
                .await
                .map_err(|e| EngineError::Persistence(format!("snapshot writer failed: {e}")))??;
        }
        *guard = next;
        Ok::<(), EngineError>(())
    });
    writer
        .await
        .map_err(|e| EngineError::Persistence(format!("snapshot writer failed: {e}")))?
}

/// Read a snapshot, returning `None` if the file does not exist
pub fn load_json<T: DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    Ok(Some(serde_json::from_slice(&data)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Vec<u32>> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_creates_parent_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut value = BTreeMap::new();
        value.insert("tower-001".to_string(), 480u32);
        save_json(&path, &value).unwrap();

        assert!(path.exists());
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);

        let loaded: BTreeMap<String, u32> = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_concurrent_saves_do_not_share_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let writers: Vec<_> = (0..8u32)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || save_json(&path, &vec![i; 64]))
            })
            .collect();
        for writer in writers {
            writer.join().unwrap().unwrap();
        }

        let loaded: Vec<u32> = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 64);
        assert!(loaded.iter().all(|v| *v == loaded[0]));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_held_lock_times_out_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let view = Arc::new(RwLock::new(1u32));

        let reader = view.read().await;
        let err = lock_for_commit(&view, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        drop(reader);

        assert!(!path.exists());
        assert_eq!(*view.read().await, 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_still_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let view = Arc::new(RwLock::new(1u32));

        let guard = lock_for_commit(&view, Duration::from_secs(1)).await.unwrap();
        let commit = save_and_publish(Some(path.clone()), 2u32, guard, 2u32);
        // Abandon the commit almost immediately
        let _ = tokio::time::timeout(Duration::from_micros(1), commit).await;

        // The next writer waits for the abandoned one to finish
        let guard = lock_for_commit(&view, Duration::from_secs(5)).await.unwrap();
        let on_disk: u32 = load_json(&path).unwrap().unwrap();
        assert_eq!(*guard, on_disk);
        assert_eq!(on_disk, 2);
    }
}
