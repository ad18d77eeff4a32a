//! Crash-safe maildir-style spool.
//!
//! A spool is a directory with `tmp/`, `new/` and `cur/` stages. Inbound
//! transfers land in `tmp/` under a unique name, are hard-linked into `new/`
//! on publication, and move to `cur/` when the transmit queue folds them in.
//! Each stage may carry a `Queue` file (a JSON array of [`SpoolKey`]) and a
//! `Mutex` lockfile that serializes queue mutation across processes.
//!
//! Durability rests on two primitives: queue files are always staged in
//! `tmp/`, fsynced and atomically renamed over their destination, and every
//! multi-step operation is ordered so that rerunning it after a crash at any
//! step either completes the operation or is a safe no-op.

use crate::error::NodeError;
use crate::maildir;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tern_proto::frame::FileId;
use tracing::{debug, warn};

/// How many fresh names to try before giving up on creating a temp file.
const MAX_NAME_COLLISIONS: usize = 1000;

/// Identity of a file in the spool: the maildir name of the payload, when
/// it was spooled, and the wire identity ([`FileId`]) it was offered under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolKey {
    /// Unique maildir name of the payload file.
    pub name: String,
    /// When the payload entered the spool.
    pub spool_time: DateTime<Utc>,
    /// Wire identity the file travels under.
    pub file: FileId,
}

/// An ordered queue of spooled files awaiting processing.
pub type Queue = Vec<SpoolKey>;

/// A maildir-style spool rooted at a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spool {
    base_dir: PathBuf,
}

impl<'de> Deserialize<'de> for Spool {
    /// Spools appear in the configuration as their base directory string.
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::new(String::deserialize(deserializer)?))
    }
}

/// Holds `Mutex` locked for the duration of a queue mutation; the file is
/// truncated and unlocked on drop. The pid of the holder is recorded for
/// post-mortem inspection.
struct MutexGuard {
    file: File,
}

impl MutexGuard {
    fn lock(path: &Path) -> io::Result<Self> {
        let mut file = maildir::open_locked(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { file })
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

/// Removes a file, treating "already gone" as success.
fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Spool {
    /// Creates a handle to the spool rooted at `base_dir`. Nothing is
    /// touched on disk until an operation runs.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Provisions the `tmp/`, `new/` and `cur/` stage directories.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if a directory cannot be created.
    pub fn create_dirs(&self) -> io::Result<()> {
        for dir in ["tmp", "new", "cur"] {
            fs::create_dir_all(self.base_dir.join(dir))?;
        }
        Ok(())
    }

    /// The path of `name` within stage `dir` of this spool.
    #[must_use]
    pub fn file_name(&self, dir: &str, name: &str) -> PathBuf {
        self.base_dir.join(dir).join(name)
    }

    /// Creates a fresh, exclusively-locked file in `tmp/` to receive the
    /// contents of `file`, retrying on name collision. The lock is held
    /// until the returned handle closes, so concurrent sessions cannot
    /// clobber an in-flight transfer.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if creation fails, or if every tried name
    /// collided.
    pub fn temp_file_for(&self, file: &FileId) -> io::Result<(SpoolKey, File)> {
        for _ in 0..MAX_NAME_COLLISIONS {
            let name = maildir::unique_name();
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(self.file_name("tmp", &name))
            {
                Ok(handle) => {
                    handle.lock_exclusive()?;
                    let key = SpoolKey {
                        name,
                        spool_time: Utc::now(),
                        file: file.clone(),
                    };
                    return Ok((key, handle));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not find an unused spool temp file name",
        ))
    }

    /// Publishes a completed temp file into `new/` and appends it to the
    /// `new/Queue`.
    ///
    /// The ordering here is what makes the spool crash-safe:
    ///
    /// 1. remove any `new/<name>` left by an earlier failed attempt,
    /// 2. hard-link `tmp/<name>` to `new/<name>`,
    /// 3. lock `new/Mutex`,
    /// 4. read `new/Queue`,
    /// 5. append this key, write the queue to a `tmp/` staging file, fsync,
    ///    and atomically rename it over `new/Queue`,
    /// 6. unlink `tmp/<name>`,
    /// 7. truncate and unlock the mutex.
    ///
    /// A crash before step 5 leaves the payload present but unreferenced
    /// (harmless garbage); a crash after it leaves a stale temp file whose
    /// removal is retried next time. Rerunning the whole operation is also
    /// safe: once the temp payload is gone the link steps are skipped, and a
    /// key already present in the queue is not appended twice.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] if any step fails; the spool is left in a
    /// state from which `publish` can be rerun.
    pub fn publish(&self, key: &SpoolKey) -> Result<(), NodeError> {
        let tmp_name = self.file_name("tmp", &key.name);
        let pub_name = self.file_name("new", &key.name);

        if tmp_name.exists() {
            remove_if_present(&pub_name)?;
            fs::hard_link(&tmp_name, &pub_name)?;
        } else if !pub_name.exists() {
            return Err(NodeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("spool payload {:?} missing from tmp and new", key.name),
            )));
        }

        let _mutex = MutexGuard::lock(&self.file_name("new", "Mutex"))?;

        let mut queue = self.read_queue("new", "Queue")?;
        if !queue.iter().any(|entry| entry.name == key.name) {
            queue.push(key.clone());
        }
        self.save_queue("new", "Queue", &queue)?;

        remove_if_present(&tmp_name)?;
        Ok(())
    }

    /// Discards the temp file of an aborted transfer. Never fails; at worst
    /// the file lingers in `tmp/` as garbage.
    pub fn abort(&self, key: &SpoolKey) {
        if let Err(e) = remove_if_present(&self.file_name("tmp", &key.name)) {
            debug!("ignoring error removing aborted temp file {:?}: {e}", key.name);
        }
    }

    /// Reads the queue file `dir/name`. An absent or empty file is an empty
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] on I/O failure or malformed JSON.
    pub fn read_queue(&self, dir: &str, name: &str) -> Result<Queue, NodeError> {
        let data = match fs::read(self.file_name(dir, name)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Queue::new()),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Queue::new());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    /// Writes `queue` to `dir/name` by staging into an exclusively-created
    /// `tmp/` file, fsyncing, and atomically renaming over the destination.
    /// A failed write removes the staging file.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] on I/O failure; the destination is untouched.
    pub fn save_queue(&self, dir: &str, name: &str, queue: &[SpoolKey]) -> Result<(), NodeError> {
        let data = serde_json::to_vec_pretty(queue)?;
        let staging = self.file_name("tmp", &format!("{}.Queue", maildir::unique_name()));

        let write_result = (|| -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&staging)?;
            file.write_all(&data)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = remove_if_present(&staging);
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&staging, self.file_name(dir, name)) {
            let _ = remove_if_present(&staging);
            return Err(e.into());
        }
        Ok(())
    }

    /// Folds a published queue into a working queue: consumes
    /// `from_dir/from_name` and concatenates it onto `to_dir/to_name`,
    /// moving each referenced payload from `new/` to `cur/`. This is the
    /// queue handoff at the start of every transmit session.
    ///
    /// A missing source queue is a no-op. Every intermediate state is
    /// recoverable: the consumed queue survives as `to_dir/Incoming` until
    /// the combined queue is safely staged and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] on I/O failure or malformed queue JSON.
    pub fn consume_and_concat_queues(
        &self,
        from_dir: &str,
        from_name: &str,
        to_dir: &str,
        to_name: &str,
    ) -> Result<(), NodeError> {
        match self.consume(from_dir, from_name, to_dir, "Incoming") {
            Ok(()) => {}
            Err(NodeError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
        self.concat_queues(to_dir, "Incoming", to_name)
    }

    /// Atomically moves a published queue out of its directory, under the
    /// publisher-side mutex so no writer is mid-append.
    fn consume(
        &self,
        from_dir: &str,
        from_name: &str,
        to_dir: &str,
        to_name: &str,
    ) -> Result<(), NodeError> {
        let _mutex = MutexGuard::lock(&self.file_name(from_dir, "Mutex"))?;
        fs::rename(
            self.file_name(from_dir, from_name),
            self.file_name(to_dir, to_name),
        )?;
        Ok(())
    }

    /// Concatenates the consumed `in_name` queue onto `to_dir/name`,
    /// moving each new entry's payload from `new/` to `cur/`. A payload
    /// that cannot be moved is logged and dropped from the queue.
    fn concat_queues(&self, to_dir: &str, in_name: &str, name: &str) -> Result<(), NodeError> {
        let mut queue = self.read_queue(to_dir, name)?;
        let incoming = self.read_queue(to_dir, in_name)?;
        for entry in incoming {
            let from = self.file_name("new", &entry.name);
            let to = self.file_name("cur", &entry.name);
            if let Err(e) = fs::rename(&from, &to) {
                warn!("error moving spooled file {:?}: {e}", entry.name);
                continue;
            }
            queue.push(entry);
        }

        // Staging exists iff the concatenation is safely stored; only then
        // may Incoming disappear.
        self.save_queue(to_dir, "Staging", &queue)?;
        let _ = remove_if_present(&self.file_name(to_dir, in_name));
        let staging = self.file_name(to_dir, "Staging");
        if let Err(e) = fs::rename(&staging, self.file_name(to_dir, name)) {
            let _ = remove_if_present(&staging);
            return Err(e.into());
        }
        Ok(())
    }

    /// Deletes the payload of `key` from stage `dir`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error, including for a missing payload.
    pub fn remove(&self, dir: &str, key: &SpoolKey) -> io::Result<()> {
        fs::remove_file(self.file_name(dir, &key.name))
    }
}
