//! Revision history of flatfile documents.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{NodecladError, Result};

/// One archived revision of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub number: u32,
    pub time: DateTime<Utc>,
    pub host: String,
    pub comment: String,
}

pub trait VersionArchive: Send + Sync {
    /// Locks `path` for an upcoming checkin.
    fn checkout(&self, path: &Path) -> Result<()>;
    /// Records the current content of `path` and releases the lock. Returns
    /// the new revision, or `None` when the content did not change.
    fn checkin(&self, path: &Path, comment: &str) -> Result<Option<u32>>;
    /// Drops the lock of a checkout that will not be checked in.
    fn release(&self, path: &Path) -> Result<()>;
    fn revisions(&self, path: &Path) -> Result<Vec<u32>>;
    fn head(&self, path: &Path) -> Result<Option<u32>>;
    fn log(&self, path: &Path) -> Result<Vec<Revision>>;
    /// Content of one revision, the head when `version` is `None`.
    fn fetch(&self, path: &Path, version: Option<u32>) -> Result<Option<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    number: u32,
    time_ms: i64,
    host: String,
    comment: String,
}

const LOG: &str = "log.json";
const LOCK: &str = "lock";

/// Keeps the revisions of `<dir>/<file>` as numbered files under
/// `<dir>/RCS/<file>,v/`, next to a JSON log.
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    dir_name: String,
    host: String,
}

impl DirectoryArchive {
    pub fn new(dir_name: &str, host: &str) -> Self {
        Self { dir_name: dir_name.to_string(), host: host.to_string() }
    }

    fn history_dir(&self, path: &Path) -> Result<PathBuf> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| NodecladError::Archive(format!("{} is not a file", path.display())))?;
        Ok(parent.join(&self.dir_name).join(format!("{},v", file_name.to_string_lossy())))
    }

    fn read_log(&self, history: &Path) -> Result<Vec<LogEntry>> {
        let log = history.join(LOG);
        match fs::read_to_string(&log) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(NodecladError::file(log, e)),
        }
    }

    fn write_atomically(&self, dir: &Path, target: &Path, content: &[u8]) -> Result<()> {
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| NodecladError::file(dir, e))?;
        temp.write_all(content).map_err(|e| NodecladError::file(temp.path(), e))?;
        temp.persist(target).map_err(|e| NodecladError::file(target, e.error))?;
        Ok(())
    }

    fn unlock(&self, history: &Path) -> Result<()> {
        let lock = history.join(LOCK);
        match fs::remove_file(&lock) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NodecladError::file(lock, e)),
        }
    }
}

impl VersionArchive for DirectoryArchive {
    fn checkout(&self, path: &Path) -> Result<()> {
        let history = self.history_dir(path)?;
        fs::create_dir_all(&history).map_err(|e| NodecladError::file(&history, e))?;
        let lock = history.join(LOCK);
        match fs::OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(mut file) => file.write_all(self.host.as_bytes()).map_err(|e| NodecladError::file(&lock, e)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&lock).unwrap_or_default();
                if holder.trim() == self.host {
                    Ok(())
                } else {
                    Err(NodecladError::Archive(format!("{} is locked by {}", path.display(), holder.trim())))
                }
            }
            Err(e) => Err(NodecladError::file(lock, e)),
        }
    }

    fn checkin(&self, path: &Path, comment: &str) -> Result<Option<u32>> {
        let history = self.history_dir(path)?;
        fs::create_dir_all(&history).map_err(|e| NodecladError::file(&history, e))?;
        let content = fs::read(path).map_err(|e| NodecladError::file(path, e))?;
        let mut log = self.read_log(&history)?;
        let head = log.last().map(|entry| entry.number);
        if let Some(head) = head {
            let current = history.join(head.to_string());
            if fs::read(&current).map_err(|e| NodecladError::file(&current, e))? == content {
                debug!(path = %path.display(), revision = head, "unchanged, nothing to check in");
                self.unlock(&history)?;
                return Ok(None);
            }
        }
        let number = head.map_or(1, |n| n + 1);
        self.write_atomically(&history, &history.join(number.to_string()), &content)?;
        log.push(LogEntry {
            number,
            time_ms: Utc::now().timestamp_millis(),
            host: self.host.clone(),
            comment: comment.to_string(),
        });
        self.write_atomically(&history, &history.join(LOG), serde_json::to_string_pretty(&log)?.as_bytes())?;
        self.unlock(&history)?;
        debug!(path = %path.display(), revision = number, "checked in");
        Ok(Some(number))
    }

    fn release(&self, path: &Path) -> Result<()> {
        self.unlock(&self.history_dir(path)?)
    }

    fn revisions(&self, path: &Path) -> Result<Vec<u32>> {
        Ok(self.read_log(&self.history_dir(path)?)?.iter().map(|entry| entry.number).collect())
    }

    fn head(&self, path: &Path) -> Result<Option<u32>> {
        Ok(self.revisions(path)?.last().copied())
    }

    fn log(&self, path: &Path) -> Result<Vec<Revision>> {
        self.read_log(&self.history_dir(path)?)?
            .into_iter()
            .map(|entry| {
                let time = DateTime::<Utc>::from_timestamp_millis(entry.time_ms).ok_or_else(|| {
                    NodecladError::Archive(format!("revision {} has a bad timestamp", entry.number))
                })?;
                Ok(Revision { number: entry.number, time, host: entry.host, comment: entry.comment })
            })
            .collect()
    }

    fn fetch(&self, path: &Path, version: Option<u32>) -> Result<Option<String>> {
        let history = self.history_dir(path)?;
        let Some(number) = (match version {
            Some(number) => Some(number),
            None => self.head(path)?,
        }) else {
            return Ok(None);
        };
        let revision = history.join(number.to_string());
        match fs::read_to_string(&revision) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NodecladError::file(revision, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_checkins_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("abc.yaml");
        let archive = DirectoryArchive::new("RCS", "host-a");

        fs::write(&file, "name: one\n").unwrap();
        archive.checkout(&file).unwrap();
        assert_eq!(archive.checkin(&file, "first").unwrap(), Some(1));
        archive.checkout(&file).unwrap();
        assert_eq!(archive.checkin(&file, "again").unwrap(), None);
        fs::write(&file, "name: two\n").unwrap();
        assert_eq!(archive.checkin(&file, "second").unwrap(), Some(2));

        assert_eq!(archive.revisions(&file).unwrap(), vec![1, 2]);
        assert_eq!(archive.fetch(&file, Some(1)).unwrap().as_deref(), Some("name: one\n"));
        assert_eq!(archive.fetch(&file, None).unwrap().as_deref(), Some("name: two\n"));
        let log = archive.log(&file).unwrap();
        assert_eq!(log[1].comment, "second");
        assert_eq!(log[1].host, "host-a");
        assert!(dir.path().join("RCS").join("abc.yaml,v").join("2").is_file());
    }

    #[test]
    fn a_lock_held_elsewhere_blocks_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("abc.json");
        fs::write(&file, "{}").unwrap();
        DirectoryArchive::new("RCS", "host-a").checkout(&file).unwrap();
        let err = DirectoryArchive::new("RCS", "host-b").checkout(&file).unwrap_err();
        assert!(matches!(err, NodecladError::Archive(_)));
    }

    #[test]
    fn released_checkouts_can_be_taken_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("abc.json");
        fs::write(&file, "{}").unwrap();
        let first = DirectoryArchive::new("RCS", "host-a");
        first.checkout(&file).unwrap();
        first.release(&file).unwrap();
        DirectoryArchive::new("RCS", "host-b").checkout(&file).unwrap();
        assert!(first.revisions(&file).unwrap().is_empty());
    }
}
