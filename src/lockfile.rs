use std::path::{Path, PathBuf};

use tracing::debug;

use crate::digest::compute_sha256;
use crate::error::{PipelineError, Result};

pub const LOCKFILE_NAME: &str = "Cargo.lock";
/// Cache key component used when the workspace has no lockfile.
pub const NO_LOCKFILE: &str = "no-lockfile";

pub fn lockfile_path(manifest_path: &Path) -> PathBuf {
    manifest_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.join(LOCKFILE_NAME))
        .unwrap_or_else(|| PathBuf::from(LOCKFILE_NAME))
}

pub fn lockfile_hash(manifest_path: &Path) -> Result<String> {
    let path = lockfile_path(manifest_path);
    if !path.is_file() {
        debug!(lockfile = %path.display(), "No lockfile found");
        return Ok(NO_LOCKFILE.to_string());
    }
    compute_sha256(&path).map_err(|err| {
        PipelineError::configuration(format!("Failed to hash {}: {err:#}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_hex;
    use tempfile::tempdir;

    #[test]
    fn lockfile_sits_next_to_manifest() {
        assert_eq!(
            lockfile_path(Path::new("app/Cargo.toml")),
            Path::new("app/Cargo.lock")
        );
        assert_eq!(lockfile_path(Path::new("Cargo.toml")), Path::new("Cargo.lock"));
    }

    #[test]
    fn hash_changes_with_lockfile_content() {
        let temp = tempdir().unwrap();
        let manifest = temp.path().join("Cargo.toml");
        let lock = temp.path().join("Cargo.lock");

        assert_eq!(lockfile_hash(&manifest).unwrap(), NO_LOCKFILE);

        std::fs::write(&lock, "version = 3\n").unwrap();
        let first = lockfile_hash(&manifest).unwrap();
        assert_eq!(first, sha256_hex(b"version = 3\n"));

        std::fs::write(&lock, "version = 4\n").unwrap();
        assert_ne!(lockfile_hash(&manifest).unwrap(), first);
    }
}
