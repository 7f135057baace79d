use anyhow::{Context, Result};
use clap::{Args, Parser};
use deepclean::pipeline;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "deepclean")]
#[command(version)]
#[command(about = "Keeps a project's on-disk token footprint small for AI coding assistants")]
struct Cli {
    /// Project root to operate on.
    path: PathBuf,

    #[command(flatten)]
    mode: Mode,

    /// No writes; report what would happen. Only meaningful with --full.
    #[arg(long)]
    dry_run: bool,

    /// Print per-file progress as the pipeline runs.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct Mode {
    /// Diagnose only: scan and list issues, touch nothing.
    #[arg(long)]
    report: bool,
    /// Apply safe local fixes: garbage sweep, ensure the ignore file exists.
    #[arg(long)]
    fix: bool,
    /// Run the full Deep-Clean pipeline (scan, relocate, patch, trace map, sweep).
    #[arg(long)]
    full: bool,
    /// Invert a prior Deep-Clean: restore moved files and revert patches.
    #[arg(long)]
    restore: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let root = cli
        .path
        .canonicalize()
        .with_context(|| format!("project path does not exist: {}", cli.path.display()))?;

    if cli.mode.report {
        let report = pipeline::report(&root)?;
        println!(
            "scanned {} files, {} tokens total, {} already moved, {} moveable now",
            report.scan.total_files_scanned,
            report.scan.total_tokens,
            report.already_moved,
            report.moveable_count,
        );
        if !report.scan.errors.is_empty() {
            eprintln!("{} scan errors:", report.scan.errors.len());
            for e in &report.scan.errors {
                eprintln!("  {e}");
            }
        }
        return Ok(());
    }

    if cli.mode.fix {
        let fix = pipeline::fix(&root)?;
        println!(
            "swept {} garbage items ({} errors); ignore file {}",
            fix.garbage.moved_paths.len(),
            fix.garbage.errors.len(),
            if fix.ignore_file_touched { "created" } else { "already present" },
        );
        return Ok(());
    }

    if cli.mode.restore {
        let (restored, reverted) = pipeline::restore(&root)?;
        println!(
            "restored {} file(s), reverted {} patched source file(s)",
            restored.restored_files, reverted
        );
        return Ok(());
    }

    // --full
    let summary = pipeline::deep_clean(&root, cli.dry_run)?;
    if cli.dry_run {
        println!(
            "dry run: {} file(s) would move, estimated tokens {} -> {}",
            summary.files_moved, summary.before_tokens, summary.after_tokens
        );
        return Ok(());
    }

    println!(
        "moved {} file(s), estimated tokens {} -> {}",
        summary.files_moved, summary.before_tokens, summary.after_tokens
    );
    println!(
        "patched {} reference(s) ({} error(s)), {} symlink(s) created, {} dynamic-path warning(s)",
        summary.files_patched,
        summary.patch_errors.len(),
        summary.symlinks_created,
        summary.dynamic_warnings.len(),
    );
    if let Some(path) = &summary.trace_map_path {
        println!("wrote {}", path.display());
    }
    if cli.verbose {
        for w in &summary.dynamic_warnings {
            eprintln!(
                "  dynamic path ({}): {}:{}: {}",
                w.kind, w.project_relative_path, w.line, w.snippet
            );
        }
        for (path, err) in &summary.patch_errors {
            eprintln!("  patch error: {path}: {err}");
        }
        for (path, err) in &summary.move_errors {
            eprintln!("  move error: {path}: {err}");
        }
    }
    if !summary.garbage.errors.is_empty() {
        eprintln!("{} garbage-sweep error(s) (non-fatal)", summary.garbage.errors.len());
    }

    Ok(())
}
