//! Maildir-compatible unique names and locked-file helpers.
//!
//! A spooled file's name must never collide with one chosen by a concurrent
//! session or an earlier incarnation of the process. Names combine the
//! clock, a start sequence number persisted across restarts, fresh random
//! bytes, the pid, a per-process counter and the hostname.

use fs2::FileExt;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static SEQ_NO: AtomicU64 = AtomicU64::new(0);
static START_SEQ_NO: OnceLock<u64> = OnceLock::new();
static HOSTNAME: OnceLock<String> = OnceLock::new();

/// Returns a name unique across concurrent sessions, co-running processes
/// and process restarts.
pub(crate) fn unique_name() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut random = [0u8; 16];
    OsRng.fill_bytes(&mut random);
    let seq_no = SEQ_NO.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}.X{:x}R{}M{}P{}Q{}.{}",
        now.as_secs(),
        start_seq_no(),
        hex::encode(random),
        now.as_micros(),
        std::process::id(),
        seq_no,
        hostname(),
    )
}

fn hostname() -> &'static str {
    HOSTNAME.get_or_init(|| gethostname::gethostname().to_string_lossy().into_owned())
}

fn start_seq_no() -> u64 {
    *START_SEQ_NO.get_or_init(|| match fetch_and_incr_start_seq_no() {
        Ok(seq) => seq,
        Err(e) => {
            // Without a home directory the persisted counter is unavailable;
            // a random start sequence preserves uniqueness across restarts.
            tracing::warn!("cannot persist start sequence number: {e}");
            OsRng.next_u64()
        }
    })
}

/// Reads, increments and writes back the start sequence number in
/// `~/.ternseq`, under an exclusive lock so co-running instances cannot
/// hand out the same value.
fn fetch_and_incr_start_seq_no() -> io::Result<u64> {
    let home = std::env::var_os("HOME")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME is not set"))?;
    let path = PathBuf::from(home).join(".ternseq");
    let mut file = open_locked(&path)?;
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    let text = text.trim();
    let seq: u64 = if text.is_empty() {
        0
    } else {
        text.parse().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad sequence file: {e}"))
        })?
    };
    let seq = seq + 1;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{seq}")?;
    Ok(seq)
}

/// Opens (creating if needed) `path` read-write and takes an exclusive
/// advisory lock, blocking until it is available. The lock is released when
/// the file handle closes.
pub(crate) fn open_locked(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn unique_names_do_not_repeat() {
        let names: HashSet<String> = (0..1000).map(|_| unique_name()).collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn unique_names_carry_pid_and_hostname() {
        let name = unique_name();
        assert!(name.contains(&format!("P{}", std::process::id())));
        assert!(name.ends_with(&format!(".{}", hostname())));
    }

    #[test]
    fn open_locked_creates_and_locks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockme");
        let file = open_locked(&path).unwrap();
        assert!(path.exists());
        // A second handle must not be able to take the lock concurrently.
        let second = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        assert!(second.try_lock_exclusive().is_err());
        drop(file);
        assert!(second.try_lock_exclusive().is_ok());
    }
}
