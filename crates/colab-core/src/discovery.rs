//! Discovery record: a small JSON file advertising where this server listens.
//!
//! Local tooling lists `nbserver-*.json` in the security directory to find running
//! servers. The record is written once after binding and removed on shutdown.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DiscoveryError;
use crate::ports::BoundEndpoint;

/// Field order here is the on-disk key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub url: String,
    pub hostname: String,
    pub port: u16,
    pub secure: bool,
}

impl From<&BoundEndpoint> for DiscoveryRecord {
    fn from(endpoint: &BoundEndpoint) -> Self {
        Self {
            url: endpoint.connection_url(),
            hostname: endpoint.hostname(),
            port: endpoint.port,
            secure: endpoint.secure,
        }
    }
}

/// Write `record` to `path` as two-space indented JSON, creating the parent directory.
pub fn write(record: &DiscoveryRecord, path: &Path) -> Result<(), DiscoveryError> {
    let write_err = |source| DiscoveryError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        ensure_private_dir(parent).map_err(write_err)?;
    }
    let content = serde_json::to_string_pretty(record)?;
    fs::write(path, content).map_err(write_err)?;
    debug!(path = %path.display(), "wrote discovery record");
    Ok(())
}

/// Remove the record at `path`. A missing file is not an error.
pub fn remove(path: &Path) -> Result<(), DiscoveryError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DiscoveryError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn read(path: &Path) -> Result<DiscoveryRecord, DiscoveryError> {
    let content = fs::read_to_string(path).map_err(|source| DiscoveryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Records of the servers advertised in `dir`, sorted by port. Unreadable files are skipped.
pub fn list(dir: &Path) -> Result<Vec<DiscoveryRecord>, DiscoveryError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(DiscoveryError::Read {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut records = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("nbserver-") && name.ends_with(".json")) {
            continue;
        }
        match read(&entry.path()) {
            Ok(record) => records.push(record),
            Err(e) => debug!("skipping {}: {}", name, e),
        }
    }
    records.sort_by_key(|r| r.port);
    Ok(records)
}

fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
