use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const WINDOWS_EXTENSION: &str = ".exe";

const KNOWN_PLATFORMS: &[(&str, OsFamily)] = &[
    ("x86_64-pc-windows-msvc", OsFamily::Windows),
    ("i686-pc-windows-msvc", OsFamily::Windows),
    ("aarch64-pc-windows-msvc", OsFamily::Windows),
    ("x86_64-pc-windows-gnu", OsFamily::Windows),
    ("i686-pc-windows-gnu", OsFamily::Windows),
    ("x86_64-unknown-linux-gnu", OsFamily::Linux),
    ("i686-unknown-linux-gnu", OsFamily::Linux),
    ("aarch64-unknown-linux-gnu", OsFamily::Linux),
    ("armv7-unknown-linux-gnueabihf", OsFamily::Linux),
    ("x86_64-unknown-linux-musl", OsFamily::Linux),
    ("aarch64-unknown-linux-musl", OsFamily::Linux),
    ("x86_64-apple-darwin", OsFamily::Macos),
    ("aarch64-apple-darwin", OsFamily::Macos),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
    Macos,
}

impl OsFamily {
    /// Family of a runner label such as `windows-latest` or `ubuntu-22.04`.
    pub fn from_runner_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        if label.starts_with("windows") {
            Some(OsFamily::Windows)
        } else if label.starts_with("ubuntu") || label.starts_with("linux") {
            Some(OsFamily::Linux)
        } else if label.starts_with("macos") {
            Some(OsFamily::Macos)
        } else {
            None
        }
    }

    pub fn current() -> Option<Self> {
        match std::env::consts::OS {
            "windows" => Some(OsFamily::Windows),
            "linux" => Some(OsFamily::Linux),
            "macos" => Some(OsFamily::Macos),
            _ => None,
        }
    }

    pub fn executable_extension(self) -> &'static str {
        match self {
            OsFamily::Windows => WINDOWS_EXTENSION,
            OsFamily::Linux | OsFamily::Macos => "",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OsFamily::Windows => "windows",
            OsFamily::Linux => "linux",
            OsFamily::Macos => "macos",
        };
        f.write_str(label)
    }
}

pub fn platform_family(platform_id: &str) -> Option<OsFamily> {
    KNOWN_PLATFORMS
        .iter()
        .find(|(triple, _)| *triple == platform_id)
        .map(|(_, family)| *family)
}

pub fn known_platforms() -> impl Iterator<Item = &'static str> {
    KNOWN_PLATFORMS.iter().map(|(triple, _)| *triple)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MatrixEntry {
    #[serde(rename = "target")]
    pub platform_id: String,
    #[serde(rename = "os")]
    pub operating_system: String,
    #[serde(rename = "toolchain", default = "default_toolchain")]
    pub toolchain_id: String,
    #[serde(rename = "suffix")]
    pub artifact_suffix: String,
    #[serde(rename = "extension", default)]
    pub file_extension: String,
}

fn default_toolchain() -> String {
    "stable".to_string()
}

impl MatrixEntry {
    pub fn new(
        platform_id: &str,
        operating_system: &str,
        toolchain_id: &str,
        artifact_suffix: &str,
        file_extension: &str,
    ) -> Self {
        Self {
            platform_id: platform_id.to_string(),
            operating_system: operating_system.to_string(),
            toolchain_id: toolchain_id.to_string(),
            artifact_suffix: artifact_suffix.to_string(),
            file_extension: file_extension.to_string(),
        }
    }

    pub fn os_family(&self) -> Option<OsFamily> {
        OsFamily::from_runner_label(&self.operating_system)
    }

    pub fn binary_file_name(&self, product: &str) -> String {
        format!("{product}{}", self.file_extension)
    }

    /// `<build_root>/<platform_id>/release/<product><ext>`
    pub fn output_path(&self, build_root: &Path, product: &str) -> PathBuf {
        build_root
            .join(&self.platform_id)
            .join("release")
            .join(self.binary_file_name(product))
    }

    fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let label = format!("Matrix entry '{}'", self.artifact_suffix);

        if self.artifact_suffix.trim().is_empty() {
            issues.push(format!(
                "Matrix entry for '{}' has an empty suffix",
                self.platform_id
            ));
        }
        if self.toolchain_id.trim().is_empty() {
            issues.push(format!("{label} has an empty toolchain"));
        }

        let host = self.os_family();
        if host.is_none() {
            issues.push(format!(
                "{label} uses unknown runner '{}'",
                self.operating_system
            ));
        }

        match platform_family(&self.platform_id) {
            None => issues.push(format!(
                "{label} targets unknown platform '{}' (known: {})",
                self.platform_id,
                known_platforms().collect::<Vec<_>>().join(", ")
            )),
            Some(target) => {
                if let Some(host) = host
                    && host != target
                {
                    issues.push(format!(
                        "{label} builds {} target '{}' on a {} runner",
                        target, self.platform_id, host
                    ));
                }
            }
        }

        if let Some(host) = host {
            let expected = host.executable_extension();
            if self.file_extension != expected {
                issues.push(format!(
                    "{label} has extension '{}' but {} binaries use '{}'",
                    self.file_extension, host, expected
                ));
            }
        }

        issues
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TargetMatrix {
    pub entries: Vec<MatrixEntry>,
}

impl TargetMatrix {
    pub fn new(entries: Vec<MatrixEntry>) -> Self {
        Self { entries }
    }

    pub fn slsk_default() -> Self {
        Self::new(vec![
            MatrixEntry::new(
                "x86_64-pc-windows-msvc",
                "windows-latest",
                "stable",
                "windows-x86_64",
                WINDOWS_EXTENSION,
            ),
            MatrixEntry::new(
                "i686-pc-windows-msvc",
                "windows-latest",
                "stable",
                "windows-i686",
                WINDOWS_EXTENSION,
            ),
            MatrixEntry::new(
                "x86_64-unknown-linux-gnu",
                "ubuntu-latest",
                "stable",
                "linux-x86_64",
                "",
            ),
        ])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MatrixEntry> {
        self.entries.iter()
    }

    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.entries.is_empty() {
            issues.push("Matrix must contain at least one target".to_string());
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            issues.extend(entry.issues());
            if !seen.insert(entry.artifact_suffix.as_str()) {
                issues.push(format!(
                    "Suffix '{}' is used by more than one matrix entry",
                    entry.artifact_suffix
                ));
            }
        }
        issues
    }

    pub fn validate(&self) -> Result<()> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::configuration(issues.join("; ")))
        }
    }

    /// Keep entries whose suffix or platform matches any of `patterns`.
    /// No patterns keeps the full matrix.
    pub fn select(&self, patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(self.clone());
        }

        let compiled = patterns
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern).map_err(|err| {
                    PipelineError::configuration(format!(
                        "Target filter '{pattern}' is not a valid glob: {err}"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let entries: Vec<MatrixEntry> = self
            .entries
            .iter()
            .filter(|entry| {
                compiled.iter().any(|pattern| {
                    pattern.matches(&entry.artifact_suffix) || pattern.matches(&entry.platform_id)
                })
            })
            .cloned()
            .collect();

        if entries.is_empty() {
            return Err(PipelineError::configuration(format!(
                "No matrix entries match {}",
                patterns.join(", ")
            )));
        }
        Ok(Self::new(entries))
    }
}

impl<'a> IntoIterator for &'a TargetMatrix {
    type Item = &'a MatrixEntry;
    type IntoIter = std::slice::Iter<'a, MatrixEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
