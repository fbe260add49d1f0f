//! Advisory leases on lock files.
//!
//! A lease holds an exclusive `flock` on `<locks_dir>/<key>.lock` for as long as it lives.
//! The kernel drops the lock when the holder's file handle closes, including when the
//! holder crashes, so a leftover lock file never needs to be broken by hand. Lock files
//! are never unlinked: removing a locked path would let a second caller lock a fresh
//! inode under the same name while the first still believes it is exclusive.
//!
//! Each acquisition rewrites the file with a holder record (`pid`, timestamp, nonce) so
//! an operator can see who holds a contended lease.

use crate::core::config::LockConfig;
use crate::core::error::CarapaceError;
use crate::core::time;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use ulid::Ulid;

#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    nonce: String,
    _file: File,
}

impl Lease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unique token written into the lock file by this holder.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }
}

pub fn lease_path(locks_dir: &Path, key: &str) -> PathBuf {
    let safe: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    locks_dir.join(format!("{}.lock", safe))
}

/// Acquire the exclusive lease for `key`, retrying with capped exponential backoff.
///
/// Gives up with `LockContention`, or with `StaleLock` when the current holder has kept
/// the lease longer than `stale_after_secs` (a hung process rather than a busy one).
pub fn acquire_lease(
    locks_dir: &Path,
    key: &str,
    config: &LockConfig,
) -> Result<Lease, CarapaceError> {
    fs::create_dir_all(locks_dir)?;
    let path = lease_path(locks_dir, key);

    for attempt in 0..config.max_attempts.max(1) {
        if let Some(lease) = try_acquire(&path)? {
            debug!(key, attempt, "lease acquired");
            return Ok(lease);
        }
        let delay = config
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(config.max_delay_ms);
        thread::sleep(Duration::from_millis(delay));
    }

    let stale_after = Duration::from_secs(config.stale_after_secs);
    if lock_age(&path).is_some_and(|age| age > stale_after) {
        let holder = fs::read_to_string(&path).unwrap_or_default();
        warn!(key, holder = holder.trim(), "lease held past the stale window");
        return Err(CarapaceError::StaleLock(format!("{} ({})", key, holder.trim())));
    }
    Err(CarapaceError::LockContention(key.to_string()))
}

fn try_acquire(lock_path: &Path) -> Result<Option<Lease>, CarapaceError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    if let Err(err) = file.try_lock_exclusive() {
        if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            return Ok(None);
        }
        return Err(CarapaceError::IoError(err));
    }

    let nonce = Ulid::new().to_string();
    file.set_len(0)?;
    writeln!(
        file,
        "pid={} ts={} nonce={}",
        std::process::id(),
        time::now_epoch_z(),
        nonce
    )?;

    Ok(Some(Lease {
        path: lock_path.to_path_buf(),
        nonce,
        _file: file,
    }))
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}
