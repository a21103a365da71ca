//! The upstream seam for client-side config sync.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ClientResult;
use crate::types::{ConfigSourceType, Properties};

/// Upstream source of raw property snapshots.
///
/// May fail transiently; the repository keeps its last-good snapshot on
/// failure. Implementations: a properties file on disk (`FileSource`),
/// the remote poll endpoint (out of tree), fakes in tests.
pub trait ConfigSource: Send + Sync {
    /// Fetch the current snapshot.
    fn fetch(&self) -> ClientResult<Properties>;

    /// What kind of source this is.
    fn source_type(&self) -> ConfigSourceType;
}

/// A `key=value` properties file on local disk.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Create a source reading from the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this source reads.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileSource {
    fn fetch(&self) -> ClientResult<Properties> {
        let content = fs::read_to_string(&self.path)?;
        Ok(parse_properties(&content))
    }

    fn source_type(&self) -> ConfigSourceType {
        ConfigSourceType::Local
    }
}

/// Parse `key=value` lines. Blank lines and `#` comments are skipped;
/// a line without `=` is a key with an empty value; whitespace around
/// keys and values is trimmed.
fn parse_properties(content: &str) -> Properties {
    let mut properties = Properties::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                properties.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => {
                properties.insert(line.to_string(), String::new());
            }
        }
    }
    properties
}
