//! Startup housekeeping for the results directory
//!
//! Caps the number of historical result files sharing a prefix. The latest
//! result, the cache document and log files are never touched.

use crate::cache::CACHE_FILE_NAME;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix shared by result files
pub const RESULT_PREFIX: &str = "XFI_RESULT";

/// Default number of historical result files kept
pub const DEFAULT_MAX_RESULT_FILES: usize = 10;

/// Cleanup options
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    /// File name prefix of historical results
    pub prefix: String,
    /// Historical files to keep
    pub max_files: usize,
    /// Report without deleting
    pub dry_run: bool,
    /// Extra file names never deleted
    pub protected: Vec<String>,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            prefix: RESULT_PREFIX.to_string(),
            max_files: DEFAULT_MAX_RESULT_FILES,
            dry_run: false,
            protected: Vec::new(),
        }
    }
}

impl CleanupOptions {
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn protect(mut self, name: &str) -> Self {
        self.protected.push(name.to_string());
        self
    }

    /// Name of the always-kept latest result
    pub fn latest_name(&self) -> String {
        format!("{}.json", self.prefix)
    }

    fn is_protected(&self, name: &str) -> bool {
        name == self.latest_name()
            || name == CACHE_FILE_NAME
            || name.ends_with(".log")
            || self.protected.iter().any(|p| p == name)
    }
}

/// What a cleanup pass did (or would do)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Historical result files found
    pub candidates: usize,
    /// Files kept
    pub kept: Vec<PathBuf>,
    /// Files deleted, or that would be deleted in a dry run
    pub deleted: Vec<PathBuf>,
    /// Deletions that failed
    pub failed: Vec<(PathBuf, String)>,
    pub dry_run: bool,
}

/// Delete the oldest result files in `dir` beyond `options.max_files`.
///
/// The newest historical file is always kept, even with a limit of zero.
/// A missing directory is not an error.
pub fn perform_startup_cleanup(dir: &Path, options: &CleanupOptions) -> CleanupReport {
    let mut report = CleanupReport {
        dry_run: options.dry_run,
        ..Default::default()
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Skipping cleanup of {}: {}", dir.display(), e);
            return report;
        }
    };

    let mut candidates: Vec<(SystemTime, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.starts_with(&options.prefix) && !options.is_protected(&name)
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            (modified, entry.path())
        })
        .collect();

    // newest first
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    report.candidates = candidates.len();

    let keep = options.max_files.max(1);
    for (index, (_, path)) in candidates.into_iter().enumerate() {
        if index < keep {
            report.kept.push(path);
            continue;
        }

        if options.dry_run {
            report.deleted.push(path);
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => report.deleted.push(path),
            Err(e) => {
                warn!("Failed to remove {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
            }
        }
    }

    if !report.deleted.is_empty() {
        if options.dry_run {
            info!(
                "Cleanup dry run: would remove {} of {} result files in {}",
                report.deleted.len(),
                report.candidates,
                dir.display()
            );
        } else {
            info!(
                "Removed {} old result files from {}",
                report.deleted.len(),
                dir.display()
            );
        }
    }

    report
}
