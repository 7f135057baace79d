//! Project-local configuration (`.deepclean.json` or `.deepclean.toml`), merged over defaults.
//!
//! Mirrors the teacher's `#[serde(default)]`-over-`Default` pattern: a missing
//! or malformed config file never aborts the tool, it just falls back.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GetPathMode {
    Strict,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepCleanConfig {
    /// Estimated-token threshold at/above which a file is "heavy". Unit is
    /// `bytes/4`, same as the scanner's estimator (see DESIGN.md Open Question #3).
    pub heavy_token_threshold: u64,
    /// Whether `Code`-category files count toward the heavy list at all.
    pub include_code_in_scan: bool,
    /// Recursion depth cap for JSON/YAML structural schema extraction.
    pub max_schema_depth: usize,
    /// Max sample rows embedded in a CSV schema.
    pub csv_sample_rows: usize,
    /// Glob patterns for source files the patcher must never touch.
    pub test_file_excludes: Vec<String>,
    /// Glob patterns for file names layered on top of the scanner's built-in
    /// protected set.
    pub protected_names: Vec<String>,
    /// Extra directory names to skip during the scan, beyond the fixed skip-set.
    pub scanner_exclude_dirs: Vec<String>,
    /// Resolution of DESIGN.md Open Question #1: what `get_path` does on a miss.
    pub get_path_mode: GetPathMode,
    /// Name of the indexer-ignore file the relocator maintains a managed section in.
    pub ignore_file_name: String,
}

impl Default for DeepCleanConfig {
    fn default() -> Self {
        Self {
            heavy_token_threshold: 1000,
            include_code_in_scan: false,
            max_schema_depth: 3,
            csv_sample_rows: 5,
            test_file_excludes: vec![
                "test_*.py".to_string(),
                "*_test.py".to_string(),
                "conftest.py".to_string(),
                "setup.py".to_string(),
            ],
            protected_names: Vec::new(),
            scanner_exclude_dirs: Vec::new(),
            get_path_mode: GetPathMode::Strict,
            ignore_file_name: ".cursorignore".to_string(),
        }
    }
}

/// Loads project-local config, preferring `.deepclean.json`, then
/// `.deepclean.toml`. Any failure to read or parse either silently falls
/// back to defaults — config is never a fatal precondition.
pub fn load_config(project_root: &Path) -> DeepCleanConfig {
    let json_path = project_root.join(".deepclean.json");
    if let Ok(text) = std::fs::read_to_string(&json_path) {
        if let Ok(cfg) = serde_json::from_str::<DeepCleanConfig>(&text) {
            return cfg;
        }
        return DeepCleanConfig::default();
    }

    let toml_path = project_root.join(".deepclean.toml");
    if let Ok(text) = std::fs::read_to_string(&toml_path) {
        return toml::from_str::<DeepCleanConfig>(&text).unwrap_or_else(|_| DeepCleanConfig::default());
    }

    DeepCleanConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.heavy_token_threshold, 1000);
        assert_eq!(cfg.get_path_mode, GetPathMode::Strict);
    }

    #[test]
    fn malformed_config_file_falls_back_without_panicking() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".deepclean.json"), "{ not json").unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.heavy_token_threshold, 1000);
    }

    #[test]
    fn toml_config_is_used_when_json_config_is_absent() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(".deepclean.toml"),
            "heavy_token_threshold = 2000\n",
        )
        .unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.heavy_token_threshold, 2000);
        assert_eq!(cfg.get_path_mode, GetPathMode::Strict);
    }

    #[test]
    fn json_config_takes_precedence_over_toml_config() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".deepclean.toml"), "heavy_token_threshold = 2000\n").unwrap();
        std::fs::write(
            dir.path().join(".deepclean.json"),
            r#"{"heavy_token_threshold": 700}"#,
        )
        .unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.heavy_token_threshold, 700);
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(".deepclean.json"),
            r#"{"heavy_token_threshold": 500}"#,
        )
        .unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.heavy_token_threshold, 500);
        assert_eq!(cfg.csv_sample_rows, 5);
    }
}
