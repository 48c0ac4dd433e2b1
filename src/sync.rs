// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers shared by the job store and the progress bus.
//!
//! Two families live here:
//!
//! - In-process `RwLock`/`Mutex` acquisition that recovers from poisoning
//!   instead of panicking. A worker that panics while publishing must not take
//!   every SSE stream down with it.
//! - Cross-process advisory file locks (`fs2`) with a bounded wait, used by
//!   the file-backed store and bus so an HTTP process and a worker process can
//!   share one data directory.
//!
//! The file-backed callers wrap their work in [`off_runtime`], so a lock held
//! by another process parks one blocking section instead of a runtime worker.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Default timeout for acquiring file locks.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for a file lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Acquire a read lock, recovering the guard if the lock was poisoned.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "pullbus::sync",
                event = "LOCK_POISONED_READ",
                "RwLock poisoned during read; recovering. A thread panicked while holding it."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering the guard if the lock was poisoned.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "pullbus::sync",
                event = "LOCK_POISONED_WRITE",
                "RwLock poisoned during write; recovering. A thread panicked while holding it."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering the guard if the mutex was poisoned.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "pullbus::sync",
                event = "LOCK_POISONED_MUTEX",
                "Mutex poisoned; recovering. A thread panicked while holding it."
            );
            poisoned.into_inner()
        }
    }
}

/// Run blocking file work from sync code that may be called on the runtime.
///
/// On a multi-threaded runtime the current worker hands its queued tasks to
/// another thread first (`block_in_place`). Off the runtime, on a blocking
/// pool thread, or on a current-thread runtime, `f` runs inline.
pub fn off_runtime<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))
}

/// Acquire an exclusive lock on `path` (created if missing) within `timeout`.
///
/// The lock is released when the returned file handle is dropped.
pub fn lock_exclusive(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another process may be writing.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

/// Acquire a shared lock on `path` (created if missing) within `timeout`.
///
/// Any number of readers may hold the shared lock; writers wait for them.
pub fn lock_shared(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match FileExt::try_lock_shared(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for shared lock on {:?} after {:?}.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire shared lock on {:?}", path));
            }
        }
    }
}
