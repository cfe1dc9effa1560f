//! Host-local run lock.
//!
//! The lock is a directory created with a single atomic `mkdir`; the owning
//! process id is written to `pid` inside it. A lock whose recorded process is
//! gone (or whose pid file is missing or unreadable) is stale and is
//! reclaimed once.
//!
//! Every acquisition holds an exclusive `flock` on the sibling
//! `<lock>.guard` file from the first look at the directory until its own pid
//! is written. Two runs can therefore never both judge the same lock stale, and
//! a directory without a pid seen under the guard belongs to a crashed run.

use crate::error::RunError;
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PID_FILE: &str = "pid";

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

enum Owner {
    Alive(u32),
    Dead(u32),
    Unknown,
}

impl RunLock {
    /// Take the lock at `path` for the current process.
    ///
    /// Fails with [`RunError::LockBusy`] when a live process owns it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pid = std::process::id();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create lock parent: {}", parent.display()))?;
            }
        }

        let _guard = take_guard(path)?;
        for attempt in 0..2 {
            match fs::create_dir(path) {
                Ok(()) => {
                    let lock = Self {
                        path: path.to_path_buf(),
                        pid,
                        released: false,
                    };
                    if let Err(err) = fs::write(path.join(PID_FILE), format!("{pid}\n")) {
                        drop(lock);
                        return Err(err)
                            .with_context(|| format!("failed to record pid in {}", path.display()));
                    }
                    debug!(lock = %path.display(), pid, "run lock acquired");
                    return Ok(lock);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    match read_owner(path)? {
                        Owner::Alive(owner) => return Err(RunError::LockBusy { pid: owner }.into()),
                        Owner::Dead(owner) if attempt == 0 => {
                            warn!(lock = %path.display(), pid = owner, "reclaiming stale run lock");
                            remove_lock_dir(path)?;
                        }
                        Owner::Unknown if attempt == 0 => {
                            warn!(lock = %path.display(), "run lock has no readable owner, reclaiming");
                            remove_lock_dir(path)?;
                        }
                        Owner::Dead(_) | Owner::Unknown => break,
                    }
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create run lock: {}", path.display()))
                }
            }
        }
        Err(anyhow!("could not reclaim run lock: {}", path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the lock. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match remove_lock_dir(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "run lock released"),
            Err(err) => warn!(lock = %self.path.display(), error = %err, "failed to remove run lock"),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Pid recorded in the lock at `path`, if any.
pub fn lock_owner(path: impl AsRef<Path>) -> Option<u32> {
    read_pid(path.as_ref()).ok().flatten()
}

fn guard_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("run.lock"));
    name.push(".guard");
    path.with_file_name(name)
}

/// Blocks until no other acquisition is in progress. Released on drop, or by
/// the kernel if the process dies.
fn take_guard(path: &Path) -> Result<File> {
    let guard = guard_path(path);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&guard)
        .with_context(|| format!("failed to open lock guard: {}", guard.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("failed to lock {}", guard.display()))?;
    Ok(file)
}

fn read_owner(path: &Path) -> Result<Owner> {
    Ok(match read_pid(path)? {
        Some(pid) if is_pid_alive(pid) => Owner::Alive(pid),
        Some(pid) => Owner::Dead(pid),
        None => Owner::Unknown,
    })
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path.join(PID_FILE)) {
        Ok(text) => Ok(text.trim().parse::<u32>().ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        // A plain file left by an older layout.
        Err(_) if path.is_file() => Ok(fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok())),
        Err(err) => Err(err).with_context(|| format!("failed to read run lock: {}", path.display())),
    }
}

fn remove_lock_dir(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).exists()
}
