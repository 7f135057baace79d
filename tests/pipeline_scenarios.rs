//! Black-box scenarios for the Deep-Clean pipeline, covering the concrete
//! end-to-end cases: JSON relocation, dynamic-path warnings, idempotent
//! re-runs, restore round-trips, protected files, and CSV schema extraction.

use deepclean::pipeline;
use std::fs;
use tempfile::tempdir;

fn write_heavy_json(path: &std::path::Path) {
    let mut body = String::from("[");
    for i in 0..60 {
        body.push_str(&format!(r#"{{"id":{i},"name":"item-{i}"}},"#));
    }
    body.push(']');
    fs::write(path, body).unwrap();
}

#[test]
fn s1_json_relocation_with_static_open() {
    let dir = tempdir().unwrap();
    let project = dir.path().join("P");
    fs::create_dir_all(project.join("data")).unwrap();
    fs::create_dir_all(project.join("src")).unwrap();
    write_heavy_json(&project.join("data/products.json"));
    let main_py_original = "with open(\"data/products.json\") as f:\n    pass\n";
    fs::write(project.join("src/main.py"), main_py_original).unwrap();

    let summary = pipeline::deep_clean(&project, false).unwrap();
    assert_eq!(summary.files_moved, 1);

    assert!(!project.join("data/products.json").exists());
    let external = dir.path().join("P_data/data/products.json");
    assert!(external.exists());

    assert!(project.join("config_paths.py").exists());
    let bridge = fs::read_to_string(project.join("config_paths.py")).unwrap();
    assert!(bridge.contains("\"data/products.json\""));

    let patched_main = fs::read_to_string(project.join("src/main.py")).unwrap();
    assert!(patched_main.contains("open(get_path(\"data/products.json\"))"));
    assert!(patched_main.contains("from config_paths import get_path"));

    let backup = fs::read_to_string(project.join("src/main.py.bak")).unwrap();
    assert_eq!(backup, main_py_original);
}

#[test]
fn s2_dynamic_path_warning_does_not_touch_fstring_line() {
    let dir = tempdir().unwrap();
    let project = dir.path().join("P");
    fs::create_dir_all(project.join("data")).unwrap();
    write_heavy_json(&project.join("data/seed.json"));
    let app_py = "user = \"abc\"\nopen(f\"data/{user}.json\")\n";
    fs::write(project.join("app.py"), app_py).unwrap();

    let summary = pipeline::deep_clean(&project, false).unwrap();
    assert_eq!(summary.files_moved, 1);
    assert!(!project.join("app.py.bak").exists());

    let content = fs::read_to_string(project.join("app.py")).unwrap();
    assert!(content.contains("open(f\"data/{user}.json\")"));

    assert_eq!(summary.dynamic_warnings.len(), 1);
    assert_eq!(summary.dynamic_warnings[0].kind, "interp_string");
}

#[test]
fn s3_idempotent_rerun_moves_nothing_new() {
    let dir = tempdir().unwrap();
    let project = dir.path().join("P");
    fs::create_dir_all(project.join("data")).unwrap();
    write_heavy_json(&project.join("data/products.json"));
    fs::write(
        project.join("main.py"),
        "with open(\"data/products.json\") as f:\n    pass\n",
    )
    .unwrap();

    pipeline::deep_clean(&project, false).unwrap();
    let bridge_before = fs::read_to_string(project.join("config_paths.py")).unwrap();

    let second = pipeline::deep_clean(&project, false).unwrap();
    assert_eq!(second.files_moved, 0);
    assert_eq!(second.files_patched, 0);

    let bridge_after = fs::read_to_string(project.join("config_paths.py")).unwrap();
    let strip_header = |s: &str| {
        s.lines()
            .filter(|l| !l.starts_with("Generated:"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    assert_eq!(strip_header(&bridge_before), strip_header(&bridge_after));
}

#[test]
fn s4_restore_round_trip_recovers_original_tree() {
    let dir = tempdir().unwrap();
    let project = dir.path().join("P");
    fs::create_dir_all(project.join("data")).unwrap();
    fs::create_dir_all(project.join("src")).unwrap();
    write_heavy_json(&project.join("data/products.json"));
    let original_json = fs::read(project.join("data/products.json")).unwrap();
    let original_main = "with open(\"data/products.json\") as f:\n    pass\n";
    fs::write(project.join("src/main.py"), original_main).unwrap();

    pipeline::deep_clean(&project, false).unwrap();
    let (restore_result, reverted) = pipeline::restore(&project).unwrap();
    assert_eq!(restore_result.restored_files, 1);
    assert_eq!(reverted, 1);

    assert_eq!(fs::read(project.join("data/products.json")).unwrap(), original_json);
    assert_eq!(
        fs::read_to_string(project.join("src/main.py")).unwrap(),
        original_main
    );
    assert!(!project.join("config_paths.py").exists());
    assert!(!project.join("src/main.py.bak").exists());

    // `data` was fully vacated and replaced with a symlink during relocation;
    // restore must turn it back into a real directory holding the real file,
    // not leave it resolving through to external storage.
    let data_dir_meta = fs::symlink_metadata(project.join("data")).unwrap();
    assert!(!data_dir_meta.file_type().is_symlink());
    assert!(data_dir_meta.is_dir());

    // External storage must be gone (or empty) after a full restore.
    let external_root = dir.path().join("P_data");
    let external_is_empty_or_absent = !external_root.exists()
        || fs::read_dir(&external_root).unwrap().next().is_none();
    assert!(external_is_empty_or_absent);
}

#[test]
fn s5_protected_code_file_stays_in_project() {
    let dir = tempdir().unwrap();
    let project = dir.path().join("P");
    fs::create_dir_all(&project).unwrap();
    fs::write(project.join("config.py"), "x = 1\n".repeat(2000)).unwrap();

    let summary = pipeline::deep_clean(&project, false).unwrap();
    assert_eq!(summary.files_moved, 0);
    assert!(project.join("config.py").exists());
}

#[test]
fn s6_csv_schema_renders_as_markdown_table() {
    let dir = tempdir().unwrap();
    let project = dir.path().join("P");
    fs::create_dir_all(project.join("data")).unwrap();

    let mut csv = String::from("id,name,email\n");
    for i in 0..200 {
        csv.push_str(&format!("{i},user-{i},user{i}@example.com\n"));
    }
    fs::write(project.join("data/users.csv"), csv).unwrap();

    let summary = pipeline::deep_clean(&project, false).unwrap();
    assert_eq!(summary.files_moved, 1);

    let trace = fs::read_to_string(summary.trace_map_path.unwrap()).unwrap();
    assert!(trace.contains("| `id` | `int` |"));
    assert!(trace.contains("| `name` | `str` |"));
    assert!(trace.contains("| `email` | `str` |"));
}
