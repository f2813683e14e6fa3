use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tracing::debug;

use crate::error::Result;

const HASH_PREFIX_LEN: usize = 16;

static STAGING_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// `(host OS, platform, lockfile hash)`. Jobs only share a cache entry when
/// all three agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub operating_system: String,
    pub platform_id: String,
    pub lockfile_hash: String,
}

impl CacheKey {
    pub fn new(operating_system: &str, platform_id: &str, lockfile_hash: &str) -> Self {
        Self {
            operating_system: operating_system.to_string(),
            platform_id: platform_id.to_string(),
            lockfile_hash: lockfile_hash.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.lockfile_hash.len().min(HASH_PREFIX_LEN);
        write!(
            f,
            "{}-{}-{}",
            self.operating_system,
            self.platform_id,
            &self.lockfile_hash[..end]
        )
    }
}

/// Filters a platform directory down to third-party dependency output. Final
/// binaries at the top of the profile directory and every entry cargo derives
/// from a local package are left out; the lockfile hash does not cover them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheScope {
    local_packages: Vec<String>,
}

impl CacheScope {
    pub fn new<I, S>(local_packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local_packages: local_packages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn keep(&self, relative: &Path) -> bool {
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        match parts.as_slice() {
            [] => true,
            [_top] => true,
            // `release/<file>`: final binaries and their dep-info.
            [_profile, file] if !is_profile_dir(file) => false,
            [_profile, dir, ..] if dir == "incremental" || dir == "examples" => false,
            [_profile, dir, name, ..] if dir == ".fingerprint" || dir == "build" => {
                !self.owns(name, |package| package.to_string())
            }
            [_profile, dir, name, ..] if dir == "deps" => {
                !self.owns(name, crate_name) && !self.owns(name, |p| format!("lib{}", crate_name(p)))
            }
            _ => true,
        }
    }

    /// `name` is `<stem>-<hex hash>[.<ext>]` for one of the local packages.
    fn owns(&self, name: &str, stem: impl Fn(&str) -> String) -> bool {
        self.local_packages.iter().any(|package| {
            name.strip_prefix(&stem(package))
                .and_then(|rest| rest.strip_prefix('-'))
                .map(|rest| rest.split('.').next().unwrap_or_default())
                .is_some_and(|hash| !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit()))
        })
    }
}

fn is_profile_dir(name: &str) -> bool {
    matches!(name, "deps" | "build" | ".fingerprint" | "incremental" | "examples")
}

fn crate_name(package: &str) -> String {
    package.replace('-', "_")
}

pub trait DependencyCache: Send + Sync {
    /// Populate `target` from the entry for `key`, copying only what `scope`
    /// keeps. Returns whether it was a hit.
    fn restore(&self, key: &CacheKey, target: &Path, scope: &CacheScope) -> Result<bool>;

    fn save(&self, key: &CacheKey, source: &Path, scope: &CacheScope) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl DependencyCache for NoCache {
    fn restore(&self, _key: &CacheKey, _target: &Path, _scope: &CacheScope) -> Result<bool> {
        Ok(false)
    }

    fn save(&self, _key: &CacheKey, _source: &Path, _scope: &CacheScope) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.to_string())
    }

    fn staging_path(&self, key: &CacheKey) -> PathBuf {
        let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!(".{key}.staging-{}-{n}", std::process::id()))
    }
}

impl DependencyCache for DirectoryCache {
    fn restore(&self, key: &CacheKey, target: &Path, scope: &CacheScope) -> Result<bool> {
        let entry = self.entry_path(key);
        if !entry.is_dir() {
            debug!(key = %key, "Cache miss");
            return Ok(false);
        }
        fs::create_dir_all(target)?;
        copy_tree(&entry, target, Path::new(""), scope)?;
        debug!(key = %key, target = %target.display(), "Cache restored");
        Ok(true)
    }

    fn save(&self, key: &CacheKey, source: &Path, scope: &CacheScope) -> Result<bool> {
        let entry = self.entry_path(key);
        if entry.exists() || !source.is_dir() {
            return Ok(false);
        }

        fs::create_dir_all(&self.root)?;
        let staging = self.staging_path(key);
        fs::create_dir_all(&staging)?;
        if let Err(err) = copy_tree(source, &staging, Path::new(""), scope) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err.into());
        }

        // Another writer may have published the same key meanwhile.
        if fs::rename(&staging, &entry).is_err() {
            let _ = fs::remove_dir_all(&staging);
            return Ok(false);
        }
        debug!(key = %key, "Cache saved");
        Ok(true)
    }
}

fn copy_tree(from: &Path, to: &Path, relative: &Path, scope: &CacheScope) -> std::io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let relative = relative.join(entry.file_name());
        if !scope.keep(&relative) {
            continue;
        }
        let file_type = entry.file_type()?;
        let destination = to.join(entry.file_name());
        if file_type.is_dir() {
            fs::create_dir_all(&destination)?;
            copy_tree(&entry.path(), &destination, &relative, scope)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key() -> CacheKey {
        CacheKey::new(
            "ubuntu-latest",
            "x86_64-unknown-linux-gnu",
            "0123456789abcdef0123456789abcdef",
        )
    }

    #[test]
    fn key_renders_short_hash() {
        assert_eq!(
            key().to_string(),
            "ubuntu-latest-x86_64-unknown-linux-gnu-0123456789abcdef"
        );
        let short = CacheKey::new("windows-latest", "i686-pc-windows-msvc", "no-lockfile");
        assert_eq!(short.to_string(), "windows-latest-i686-pc-windows-msvc-no-lockfile");
    }

    fn scope() -> CacheScope {
        CacheScope::new(["slsk-rs", "slsk-proto"])
    }

    #[test]
    fn scope_drops_workspace_outputs() {
        let scope = scope();
        for dropped in [
            "release/slsk-rs",
            "release/slsk-rs.exe",
            "release/slsk-rs.d",
            "release/slsk_rs.pdb",
            "release/.fingerprint/slsk-rs-0123456789abcdef",
            "release/.fingerprint/slsk-proto-00ff/lib-slsk_proto",
            "release/build/slsk-rs-0a1b2c3d",
            "release/deps/slsk_rs-0123456789abcdef",
            "release/deps/slsk_rs-0123456789abcdef.d",
            "release/deps/libslsk_proto-00ff.rlib",
            "release/incremental/slsk_rs-1x2y",
            "release/examples/demo",
        ] {
            assert!(!scope.keep(Path::new(dropped)), "{dropped} should not be cached");
        }
    }

    #[test]
    fn scope_keeps_third_party_outputs() {
        let scope = scope();
        for kept in [
            "release",
            "release/deps",
            "release/.fingerprint",
            "release/deps/libserde-5f3e2a.rlib",
            "release/deps/libslsk_rs_macros-0123.rlib",
            "release/.fingerprint/slsk-rs-extra-0a1b/lib",
            "release/.fingerprint/tokio-9abc/lib-tokio",
            "release/build/ring-77aa/out/libring_core.a",
            ".rustc_info.json",
        ] {
            assert!(scope.keep(Path::new(kept)), "{kept} should be cached");
        }
    }

    #[test]
    fn save_then_restore_round_trips_tree() {
        let temp = tempdir().unwrap();
        let cache = DirectoryCache::new(temp.path().join("cache"));
        let source = temp.path().join("build");
        fs::create_dir_all(source.join("release/deps")).unwrap();
        fs::write(source.join("release/deps/libfoo-abcd.rlib"), b"rlib").unwrap();
        fs::write(source.join("release/deps/slsk_rs-abcd"), b"product").unwrap();
        fs::write(source.join("release/slsk-rs"), b"product").unwrap();

        assert!(!cache.restore(&key(), &temp.path().join("empty"), &scope()).unwrap());
        assert!(cache.save(&key(), &source, &scope()).unwrap());
        let entry = cache.entry_path(&key());
        assert!(!entry.join("release/slsk-rs").exists());
        assert!(!entry.join("release/deps/slsk_rs-abcd").exists());

        let restored = temp.path().join("restored");
        assert!(cache.restore(&key(), &restored, &scope()).unwrap());
        assert_eq!(
            fs::read(restored.join("release/deps/libfoo-abcd.rlib")).unwrap(),
            b"rlib"
        );
    }

    #[test]
    fn restore_filters_entries_written_without_scope() {
        let temp = tempdir().unwrap();
        let cache = DirectoryCache::new(temp.path().join("cache"));
        let entry = cache.entry_path(&key());
        fs::create_dir_all(entry.join("release/deps")).unwrap();
        fs::write(entry.join("release/slsk-rs"), b"stale").unwrap();
        fs::write(entry.join("release/deps/libfoo-abcd.rlib"), b"rlib").unwrap();

        let restored = temp.path().join("restored");
        assert!(cache.restore(&key(), &restored, &scope()).unwrap());
        assert!(!restored.join("release/slsk-rs").exists());
        assert!(restored.join("release/deps/libfoo-abcd.rlib").is_file());
    }

    #[test]
    fn existing_entry_is_not_overwritten() {
        let temp = tempdir().unwrap();
        let cache = DirectoryCache::new(temp.path().join("cache"));
        let source = temp.path().join("build");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a"), b"first").unwrap();
        assert!(cache.save(&key(), &source, &scope()).unwrap());

        fs::write(source.join("a"), b"second").unwrap();
        assert!(!cache.save(&key(), &source, &scope()).unwrap());
        assert_eq!(fs::read(cache.entry_path(&key()).join("a")).unwrap(), b"first");
    }

    #[test]
    fn no_cache_never_hits() {
        let temp = tempdir().unwrap();
        assert!(!NoCache.restore(&key(), temp.path(), &scope()).unwrap());
        assert!(!NoCache.save(&key(), temp.path(), &scope()).unwrap());
    }
}
