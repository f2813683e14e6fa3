use serde::Serialize;

use crate::manifest::{MANIFEST_VERSION, PipelineManifest};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_manifest(manifest: &PipelineManifest) -> ValidationReport {
    let mut report = ValidationReport::default();

    if manifest.version != MANIFEST_VERSION {
        report
            .errors
            .push(format!("Unsupported manifest version: {}", manifest.version));
    }

    let product = manifest.product.trim();
    if product.is_empty() {
        report.errors.push("Product name cannot be empty".into());
    } else if product.contains(['/', '\\']) || product.chars().any(char::is_whitespace) {
        report.errors.push(format!(
            "Product name '{}' must not contain path separators or whitespace",
            manifest.product
        ));
    }

    report.errors.extend(manifest.matrix.include.issues());
    report.merge(validate_scheduling(manifest));

    if manifest.triggers.branch.trim().is_empty() {
        report.errors.push("Trigger branch cannot be empty".into());
    }
    if !manifest.triggers.push && !manifest.triggers.pull_request {
        report
            .warnings
            .push("Both push and pull_request triggers are disabled".into());
    }

    if manifest.build.root.as_os_str().is_empty() {
        report.errors.push("Build root cannot be empty".into());
    }
    if manifest.cache.enabled && manifest.cache.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Cache directory cannot be empty when caching is enabled".into());
    }
    if manifest.publish.directory.as_os_str().is_empty() {
        report.errors.push("Publish directory cannot be empty".into());
    }

    report
}

fn validate_scheduling(manifest: &PipelineManifest) -> ValidationReport {
    let mut report = ValidationReport::default();
    let matrix = &manifest.matrix;

    if matrix.max_parallel == Some(0) {
        report.errors.push("max_parallel must be at least 1".into());
    }
    if matrix.job_timeout_secs == 0 {
        report
            .errors
            .push("job_timeout_secs must be greater than zero".into());
    }
    if matrix.fail_fast {
        report.warnings.push(
            "fail_fast is enabled: one failing target cancels the others".into(),
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::TargetMatrix;

    #[test]
    fn default_slsk_manifest_is_clean() {
        let manifest = PipelineManifest::with_matrix("slsk-rs", TargetMatrix::slsk_default());
        let report = validate_manifest(&manifest);
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn scheduling_limits_are_checked() {
        let mut manifest = PipelineManifest::with_matrix("slsk-rs", TargetMatrix::slsk_default());
        manifest.matrix.max_parallel = Some(0);
        manifest.matrix.job_timeout_secs = 0;
        manifest.matrix.fail_fast = true;
        let report = validate_manifest(&manifest);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn product_name_must_be_a_plain_word() {
        let manifest = PipelineManifest::with_matrix("slsk rs", TargetMatrix::slsk_default());
        assert!(!validate_manifest(&manifest).is_ok());
    }
}
