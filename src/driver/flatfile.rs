//! One document per object under a per-entity directory.
//!
//! Objects of `Shop::Person` configured for YAML live in
//! `<root>/shop/person/<escaped id>.yaml`. Writes go to a temporary file in
//! the same directory which is then renamed over the target, so a reader
//! never sees a half-written document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value as Json;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::entity::Entity;
use crate::error::{NodecladError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlatfileFormat {
    Yaml,
    Json,
}

impl FlatfileFormat {
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }
    pub fn encode(self, document: &Json) -> Result<String> {
        match self {
            Self::Yaml => Ok(serde_yaml::to_string(document)?),
            Self::Json => Ok(serde_json::to_string_pretty(document)?),
        }
    }
    pub fn decode(self, text: &str) -> Result<Json> {
        match self {
            Self::Yaml => Ok(serde_yaml::from_str(text)?),
            Self::Json => Ok(serde_json::from_str(text)?),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlatfileStore {
    dir: PathBuf,
    format: FlatfileFormat,
}

impl FlatfileStore {
    pub fn new(dir: impl Into<PathBuf>, format: FlatfileFormat) -> Self {
        Self { dir: dir.into(), format }
    }
    pub fn for_entity(root: &Path, entity: &Entity, format: FlatfileFormat) -> Self {
        Self::new(root.join(entity.database()).join(entity.table()), format)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
    pub fn format(&self) -> FlatfileFormat {
        self.format
    }
    pub fn file_name(&self, id: &str) -> String {
        format!("{}.{}", escape(id), self.format.extension())
    }
    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(self.file_name(id))
    }
    pub fn exists(&self, id: &str) -> bool {
        self.path(id).is_file()
    }

    pub fn read(&self, id: &str) -> Result<Option<Json>> {
        let path = self.path(id);
        debug!(path = %path.display(), "reading flatfile");
        match fs::read_to_string(&path) {
            Ok(text) => self.format.decode(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NodecladError::file(path, e)),
        }
    }

    /// Atomically replaces the document of `id`.
    pub fn write(&self, id: &str, document: &Json) -> Result<PathBuf> {
        let path = self.path(id);
        let text = self.format.encode(document)?;
        fs::create_dir_all(&self.dir).map_err(|e| NodecladError::file(&self.dir, e))?;
        let mut temp = NamedTempFile::new_in(&self.dir).map_err(|e| NodecladError::file(&self.dir, e))?;
        temp.write_all(text.as_bytes()).map_err(|e| NodecladError::file(temp.path(), e))?;
        temp.as_file().sync_all().map_err(|e| NodecladError::file(temp.path(), e))?;
        temp.persist(&path).map_err(|e| NodecladError::file(&path, e.error))?;
        debug!(path = %path.display(), "wrote flatfile");
        Ok(path)
    }

    /// Unlinks the document of `id`; false when there was none.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let path = self.path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed flatfile");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(NodecladError::file(path, e)),
        }
    }

    /// Ids of every stored document, sorted.
    pub fn ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(NodecladError::file(&self.dir, e)),
        };
        let suffix = format!(".{}", self.format.extension());
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| NodecladError::file(&self.dir, e))?;
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = file_name.strip_suffix(&suffix) {
                ids.push(unescape(stem)?);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Percent-escapes everything but `[A-Za-z0-9_.-]`, plus a leading dot so
/// ids never produce hidden files.
pub fn escape(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for (i, byte) in id.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' || (byte == b'.' && i > 0);
        if plain {
            escaped.push(char::from(byte));
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }
    escaped
}

pub fn unescape(name: &str) -> Result<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name
                .get(i + 1..i + 3)
                .ok_or_else(|| NodecladError::DataConversionFailed(format!("truncated escape in '{name}'")))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|e| NodecladError::DataConversionFailed(format!("bad escape in '{name}': {e}")))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|e| NodecladError::DataConversionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_keeps_file_names_flat() {
        assert_eq!(escape("abc-123_x.y"), "abc-123_x.y");
        assert_eq!(escape("a/b c"), "a%2Fb%20c");
        assert_eq!(escape(".hidden"), "%2Ehidden");
        assert_eq!(escape("100%"), "100%25");
        assert_eq!(unescape(&escape("ünï/code")).unwrap(), "ünï/code");
    }

    #[test]
    fn truncated_escapes_are_rejected() {
        assert!(unescape("abc%2").is_err());
    }

    #[test]
    fn writes_replace_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatfileStore::new(dir.path().join("shop").join("person"), FlatfileFormat::Yaml);
        store.write("a/1", &serde_json::json!({"name": "first"})).unwrap();
        store.write("a/1", &serde_json::json!({"name": "second"})).unwrap();
        store.write("b", &serde_json::json!({"name": "other"})).unwrap();
        assert_eq!(store.ids().unwrap(), vec!["a/1".to_string(), "b".to_string()]);
        assert_eq!(store.read("a/1").unwrap().unwrap()["name"], "second");
        assert!(store.remove("b").unwrap());
        assert!(!store.remove("b").unwrap());
        assert_eq!(store.read("b").unwrap(), None);
    }
}
