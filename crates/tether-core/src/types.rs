//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Longest container id read from an identity file
pub const MAX_ID_FILE_BYTES: usize = 64;

/// Opaque, non-empty container identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Read an id from the first 64 bytes of `path`
    ///
    /// Surrounding whitespace and NUL padding are trimmed; an empty result
    /// yields `None`.
    pub fn from_file(path: &Path) -> std::io::Result<Option<Self>> {
        let file = std::fs::File::open(path)?;
        let mut buf = Vec::with_capacity(MAX_ID_FILE_BYTES);
        file.take(MAX_ID_FILE_BYTES as u64).read_to_end(&mut buf)?;

        let id = String::from_utf8_lossy(&buf)
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string();
        Ok((!id.is_empty()).then(|| Self(id)))
    }

    /// Host name of this machine, used when no id is configured
    pub fn from_hostname() -> Self {
        Self(gethostname::gethostname().to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContainerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_container_id_display() {
        let id = ContainerId::new("c1");
        assert_eq!(format!("{}", id), "c1");
        assert_eq!(id, ContainerId::from("c1"));
    }

    #[test]
    fn test_id_file_is_truncated_and_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let long = "a".repeat(80);
        writeln!(file, "{}", long).unwrap();

        let id = ContainerId::from_file(file.path()).unwrap().unwrap();
        assert_eq!(id.as_str().len(), MAX_ID_FILE_BYTES);

        let mut short = tempfile::NamedTempFile::new().unwrap();
        write!(short, "  4f2c9e\n").unwrap();
        assert_eq!(
            ContainerId::from_file(short.path()).unwrap().unwrap().as_str(),
            "4f2c9e"
        );
    }

    #[test]
    fn test_empty_id_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(ContainerId::from_file(file.path()).unwrap().is_none());
    }

    #[test]
    fn test_hostname_fallback_not_empty() {
        assert!(!ContainerId::from_hostname().is_empty());
    }
}
