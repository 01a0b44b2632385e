//! OVF manifest (`.mf`) checksums.
//!
//! A manifest is a JSON object of file name to SHA-1 hex digest:
//! `{"disk-0.vmdk": "3f786850e387550fdab836ed7e6dc881de23001b"}`.
//! Plain OVF `SHA1(name)= hex` lines are accepted on read.
//! Files are named `<base>-brkt.mf`; the older `<base>.mf` name is still
//! read when the new one is absent.

use crate::error::{VcenterError, VcenterResult};

use log::debug;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

const READ_BUF: usize = 64 * 1024;

/// File name -> lowercase hex SHA-1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestChecksums {
    entries: BTreeMap<String, String>,
}

impl ManifestChecksums {
    pub fn parse(text: &str) -> VcenterResult<Self> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            let raw: BTreeMap<String, String> = serde_json::from_str(trimmed)
                .map_err(|e| VcenterError::parse(format!("Malformed manifest: {e}")))?;
            let entries = raw
                .into_iter()
                .map(|(name, digest)| (name, digest.trim().to_ascii_lowercase()))
                .collect();
            return Ok(Self { entries });
        }
        Self::parse_lines(text)
    }

    fn parse_lines(text: &str) -> VcenterResult<Self> {
        let mut entries = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let bad = || VcenterError::parse(format!("Malformed manifest line {}: '{line}'", n + 1));
            let rest = line.strip_prefix("SHA1(").ok_or_else(bad)?;
            let (name, digest) = rest.split_once(")=").ok_or_else(bad)?;
            entries.insert(name.to_string(), digest.trim().to_ascii_lowercase());
        }
        Ok(Self { entries })
    }

    pub async fn load(path: &Path) -> VcenterResult<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| VcenterError::from(e).context(format!("Failed to read manifest {}", path.display())))?;
        Self::parse(&text)
    }

    /// Manifest for `<dir>/<base>.ovf`, new naming first.
    pub fn locate(dir: &Path, base: &str) -> Option<PathBuf> {
        [format!("{base}-brkt.mf"), format!("{base}.mf")]
            .into_iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, digest: impl Into<String>) {
        self.entries.insert(name.into(), digest.into().to_ascii_lowercase());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every name in `files` must have an entry.
    pub fn ensure_covers<'n>(&self, files: impl IntoIterator<Item = &'n str>) -> VcenterResult<()> {
        let missing: Vec<&str> = files.into_iter().filter(|f| !self.entries.contains_key(*f)).collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(VcenterError::checksum(format!(
            "No checksum entry for {}",
            missing.join(", ")
        )))
    }

    /// Hash `path` and compare it with the entry for its file name.
    pub async fn verify_file(&self, path: &Path) -> VcenterResult<()> {
        let name = file_name(path)?;
        let expected = self
            .get(&name)
            .ok_or_else(|| VcenterError::checksum(format!("No checksum entry for {name}")))?;
        let actual = sha1_file(path).await?;
        if actual != expected {
            return Err(VcenterError::checksum(format!(
                "Disk file {name} checksum does not match manifest (expected {expected}, got {actual})"
            )));
        }
        debug!("Checksum ok for {name}");
        Ok(())
    }

    /// Hash every file; entries are keyed by file name.
    pub async fn generate(files: &[PathBuf]) -> VcenterResult<Self> {
        let mut mf = Self::default();
        for path in files {
            mf.insert(file_name(path)?, sha1_file(path).await?);
        }
        Ok(mf)
    }

    pub async fn write(&self, path: &Path) -> VcenterResult<()> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

impl fmt::Display for ManifestChecksums {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(&self.entries).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

fn file_name(path: &Path) -> VcenterResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VcenterError::config(format!("Not a file path: {}", path.display())))
}

/// Lowercase hex SHA-1 of a file, hashed off the async runtime.
pub async fn sha1_file(path: &Path) -> VcenterResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> VcenterResult<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await?
}
