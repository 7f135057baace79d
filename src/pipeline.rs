//! Pipeline Orchestrator (C7): sequences scan -> relocate -> patch -> trace
//! map -> garbage sweep, handles idempotence, dry-run, and restore.

use crate::config::{self, DeepCleanConfig};
use crate::garbage::{self, GarbageReport};
use crate::paths::{self, Manifest, ProjectRoot};
use crate::patcher::{self, DynamicPathWarning, PatchedFile};
use crate::relocator::{self, RelocateResult, RestoreResult};
use crate::scanner::{self, ScanResult};
use crate::tracemap;
use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct DeepCleanSummary {
    pub before_tokens: u64,
    pub after_tokens: u64,
    pub files_moved: usize,
    pub files_patched: usize,
    pub symlinks_created: usize,
    pub dynamic_warnings: Vec<DynamicPathWarning>,
    pub patch_errors: Vec<(String, String)>,
    pub move_errors: Vec<(String, String)>,
    pub trace_map_path: Option<PathBuf>,
    pub garbage: GarbageReport,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct ReportSummary {
    pub scan: ScanResult,
    pub moveable_count: usize,
    pub already_moved: usize,
}

/// `doctor <path> --report`: scan-only, never mutates the project.
pub fn report(root: &Path) -> Result<ReportSummary> {
    let project = ProjectRoot::resolve(root)?;
    let cfg = config::load_config(project.path());
    let manifest = paths::try_load_manifest(&project.manifest_path())?;
    let already_moved = manifest
        .as_ref()
        .map(|m| m.already_moved())
        .unwrap_or_default();

    let scan = scanner::scan_project(
        project.path(),
        &project.external_root(),
        &project.garbage_root(),
        &cfg,
    )?;
    let moveable = scanner::get_moveable(&scan, &already_moved, &cfg);

    Ok(ReportSummary {
        moveable_count: moveable.len(),
        already_moved: already_moved.len(),
        scan,
    })
}

#[derive(Debug, Default)]
pub struct FixSummary {
    pub garbage: GarbageReport,
    pub ignore_file_touched: bool,
}

/// `doctor <path> --fix`: safe local fixes only — garbage sweep and ensuring
/// the ignore file exists. Never relocates or patches anything.
pub fn fix(root: &Path) -> Result<FixSummary> {
    let project = ProjectRoot::resolve(root)?;
    let cfg = config::load_config(project.path());
    let garbage_report = garbage::sweep_garbage(&project);

    let ignore_path = project.path().join(&cfg.ignore_file_name);
    let ignore_file_touched = if !ignore_path.exists() {
        std::fs::write(&ignore_path, "")?;
        true
    } else {
        false
    };

    Ok(FixSummary {
        garbage: garbage_report,
        ignore_file_touched,
    })
}

/// `doctor <path> --full [--dry-run]`: the full sequence described in
/// the orchestrator's design — scan, relocate, patch, trace map, sweep.
pub fn deep_clean(root: &Path, dry_run: bool) -> Result<DeepCleanSummary> {
    let project = ProjectRoot::resolve(root)?;
    let cfg = config::load_config(project.path());

    let mut manifest = paths::try_load_manifest(&project.manifest_path())?
        .unwrap_or_else(|| Manifest::new(project.name(), project.path().to_path_buf(), project.external_root()));
    let already_moved = manifest.already_moved();

    let scan = scanner::scan_project(
        project.path(),
        &project.external_root(),
        &project.garbage_root(),
        &cfg,
    )?;
    let moveable = scanner::get_moveable(&scan, &already_moved, &cfg);

    let mut summary = DeepCleanSummary {
        before_tokens: scan.total_tokens,
        dry_run,
        ..Default::default()
    };

    if dry_run {
        summary.files_moved = moveable.len();
        summary.after_tokens = scan.total_tokens - moveable.iter().map(|f| f.estimated_tokens).sum::<u64>();
        return Ok(summary);
    }

    let RelocateResult {
        moved,
        failed,
        symlinks_created,
        ..
    } = relocator::relocate(&project, &moveable, &mut manifest, &cfg, false)?;
    summary.files_moved = moved.len();
    summary.move_errors = failed;
    summary.symlinks_created = symlinks_created.len();

    let patch_result = patcher::patch_project(&project, &manifest, &cfg)?;
    summary.files_patched = patch_result
        .patched
        .iter()
        .map(|p: &PatchedFile| p.substitutions)
        .sum();
    summary.patch_errors = patch_result.errors;
    summary.dynamic_warnings = patch_result.dynamic_warnings;

    summary.trace_map_path = Some(tracemap::emit_trace_map(&project, &manifest)?);

    summary.garbage = garbage::sweep_garbage(&project);

    summary.after_tokens = scanner::scan_project(
        project.path(),
        &project.external_root(),
        &project.garbage_root(),
        &cfg,
    )
    .map(|s| s.total_tokens)
    .unwrap_or(summary.before_tokens);

    Ok(summary)
}

/// `doctor <path> --restore`: delegates to the relocator's restore, then the
/// patcher's revert. A missing manifest is a hard error; nothing is touched.
pub fn restore(root: &Path) -> Result<(RestoreResult, usize)> {
    let project = ProjectRoot::resolve(root)?;
    let cfg: DeepCleanConfig = config::load_config(project.path());
    let restore_result = relocator::restore(&project, &cfg)?;
    let reverted = patcher::revert(&project)?;
    Ok((restore_result, reverted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn deep_clean_then_deep_clean_is_idempotent() {
        let dir = tempdir().unwrap();
        let project_dir = dir.path().join("proj");
        fs::create_dir_all(project_dir.join("data")).unwrap();
        fs::write(
            project_dir.join("data/products.json"),
            "x".repeat(5000).as_bytes(),
        )
        .unwrap();
        fs::write(
            project_dir.join("main.py"),
            "with open(\"data/products.json\") as f:\n    pass\n",
        )
        .unwrap();

        let first = deep_clean(&project_dir, false).unwrap();
        assert_eq!(first.files_moved, 1);
        assert!(!project_dir.join("data/products.json").exists());
        assert!(project_dir.join("config_paths.py").exists());

        let second = deep_clean(&project_dir, false).unwrap();
        assert_eq!(second.files_moved, 0);
        assert_eq!(second.files_patched, 0);
    }

    #[test]
    fn restore_after_deep_clean_recovers_original_tree() {
        let dir = tempdir().unwrap();
        let project_dir = dir.path().join("proj");
        fs::create_dir_all(project_dir.join("data")).unwrap();
        let original_bytes = "x".repeat(5000);
        fs::write(project_dir.join("data/products.json"), &original_bytes).unwrap();
        fs::write(
            project_dir.join("main.py"),
            "with open(\"data/products.json\") as f:\n    pass\n",
        )
        .unwrap();

        deep_clean(&project_dir, false).unwrap();
        let (restore_result, reverted) = restore(&project_dir).unwrap();
        assert_eq!(restore_result.restored_files, 1);
        assert_eq!(reverted, 1);

        let restored_bytes = fs::read_to_string(project_dir.join("data/products.json")).unwrap();
        assert_eq!(restored_bytes, original_bytes);
        assert!(!project_dir.join("config_paths.py").exists());

        let data_meta = fs::symlink_metadata(project_dir.join("data")).unwrap();
        assert!(!data_meta.file_type().is_symlink());
        assert!(data_meta.is_dir());

        let external_root = dir.path().join("proj_data");
        assert!(
            !external_root.exists() || fs::read_dir(&external_root).unwrap().next().is_none()
        );
    }
}
