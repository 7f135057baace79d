//! Garbage sweep (C11): a best-effort move of trivial, regenerable artifacts
//! into the project's garbage sibling. Never allowed to fail the pipeline —
//! every error is collected into the report instead of propagated.

use crate::paths::ProjectRoot;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const GARBAGE_DIR_NAMES: &[&str] = &["__pycache__"];
const GARBAGE_EXTENSIONS: &[&str] = &["pyc", "pyo"];
const GARBAGE_FILE_NAMES: &[&str] = &[".DS_Store"];

fn is_garbage_file(path: &Path) -> bool {
    if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
        if GARBAGE_FILE_NAMES.contains(&name.as_str()) {
            return true;
        }
        if name.ends_with(".log.tmp") {
            return true;
        }
    }
    if let Some(ext) = path.extension().map(|e| e.to_string_lossy().into_owned()) {
        if GARBAGE_EXTENSIONS.contains(&ext.as_str()) {
            return true;
        }
    }
    false
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GarbageReport {
    pub moved_paths: Vec<String>,
    pub errors: Vec<String>,
}

/// Sweeps `root` for trivial regenerable artifacts and relocates them under
/// `root`'s garbage sibling, preserving relative structure. Never returns an
/// error; anything that goes wrong lands in `GarbageReport::errors`.
pub fn sweep_garbage(project: &ProjectRoot) -> GarbageReport {
    let mut report = GarbageReport::default();
    let garbage_root = project.garbage_root();
    walk(project.path(), project.path(), &garbage_root, &mut report);
    report
}

fn walk(dir: &Path, project_root: &Path, garbage_root: &Path, report: &mut GarbageReport) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.starts_with(garbage_root) {
                continue;
            }
            if GARBAGE_DIR_NAMES.contains(&name.as_str()) {
                move_into_garbage(&path, project_root, garbage_root, report);
                continue;
            }
            walk(&path, project_root, garbage_root, report);
            continue;
        }

        if file_type.is_file() && is_garbage_file(&path) {
            move_into_garbage(&path, project_root, garbage_root, report);
        }
    }
}

fn move_into_garbage(
    src: &Path,
    project_root: &Path,
    garbage_root: &Path,
    report: &mut GarbageReport,
) {
    let rel = match src.strip_prefix(project_root) {
        Ok(r) => r,
        Err(_) => return,
    };
    let dest: PathBuf = garbage_root.join(rel);
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, &dest)
    })();
    match result {
        Ok(()) => report.moved_paths.push(rel.to_string_lossy().replace('\\', "/")),
        Err(e) => report
            .errors
            .push(format!("{}: {e}", rel.to_string_lossy())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sweeps_pycache_and_ds_store_without_touching_real_files() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("proj");
        fs::create_dir_all(project.join("__pycache__")).unwrap();
        fs::write(project.join("__pycache__/mod.cpython-311.pyc"), b"x").unwrap();
        fs::write(project.join(".DS_Store"), b"x").unwrap();
        fs::write(project.join("main.py"), b"print(1)").unwrap();

        let root = ProjectRoot::resolve(&project).unwrap();
        let report = sweep_garbage(&root);

        assert!(report.errors.is_empty());
        assert!(!project.join("__pycache__").exists());
        assert!(!project.join(".DS_Store").exists());
        assert!(project.join("main.py").exists());
        assert!(root.garbage_root().join("__pycache__").exists());
    }
}
