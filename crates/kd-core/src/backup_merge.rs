//! Node backup merging
//!
//! A node writes persistent-volume snapshots into directories named
//! `local_pv_backup_<timestamp>`. Snapshots taken within `precision` hours
//! of a group's first snapshot are folded into that first directory and
//! removed. The newest group is left alone unless asked for, since its
//! backup may still be running.
//!
//! Every group is checked for overlapping files before any directory is
//! touched, so a conflict aborts the merge with the tree unchanged.

use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// `strftime` pattern of snapshot directory names; the microseconds are required
pub const SNAPSHOT_NAME_FORMAT: &str = "local_pv_backup_%Y-%m-%dT%H:%M:%S.%6f";

/// Errors that stop a merge
#[derive(Debug, Error)]
pub enum MergeError {
    /// The backups root is empty
    #[error("Nothing found in `{}`", .0.display())]
    NothingFound(PathBuf),

    /// An entry is not a snapshot directory name
    #[error("File `{0}` has unrecognized name format")]
    UnrecognizedName(String),

    /// Two snapshots of one group hold the same file
    #[error(
        "Group `{}` contains overlapping files (`{}`). \
         May be precision was bigger then backup periodicity",
        .group.join(", "),
        .path.display()
    )]
    OverlappingFiles {
        /// Snapshot names of the group
        group: Vec<String>,
        /// First file found twice, relative to its snapshot
        path: PathBuf,
    },

    /// Filesystem error
    #[error("I/O error on `{}`: {}", .path.display(), .source)]
    Io {
        /// Path being read or written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> MergeError + '_ {
    move |source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// How to merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// Group window, in hours from the group's first snapshot
    pub precision_hours: u32,
    /// Log what would happen without touching anything
    pub dry_run: bool,
    /// Merge the newest group too
    pub include_latest: bool,
    /// Skip entries with unrecognized names instead of failing
    pub skip_errors: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            precision_hours: 1,
            dry_run: false,
            include_latest: false,
            skip_errors: false,
        }
    }
}

/// One group folded into its first snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedGroup {
    /// Snapshot that received the files
    pub target: String,
    /// Snapshots folded into `target` and removed
    pub sources: Vec<String>,
}

/// Outcome of [`BackupMerger::do_merge`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeReport {
    /// Groups merged (or, on a dry run, that would be)
    pub merged: Vec<MergedGroup>,
    /// Newest group, left in place
    pub skipped_latest: Option<Vec<String>>,
    /// Nothing was changed on disk
    pub dry_run: bool,
}

/// Time a snapshot was taken, from its directory name
pub fn parse_timestamp(name: &str) -> Result<NaiveDateTime, MergeError> {
    NaiveDateTime::parse_from_str(name, SNAPSHOT_NAME_FORMAT)
        .map_err(|_| MergeError::UnrecognizedName(name.to_string()))
}

/// Split sorted snapshot names into groups whose members are at most
/// `precision` after the group's first member.
pub fn group_by_timestamp(
    names: &[String],
    precision: chrono::Duration,
    skip_errors: bool,
) -> Result<Vec<Vec<String>>, MergeError> {
    let mut groups: Vec<(NaiveDateTime, Vec<String>)> = Vec::new();
    for name in names {
        let timestamp = match parse_timestamp(name) {
            Ok(timestamp) => timestamp,
            Err(e) if skip_errors => {
                warn!("{}, skipping", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        match groups.last_mut() {
            Some((first, members)) if timestamp - *first <= precision => {
                members.push(name.clone());
            }
            _ => groups.push((timestamp, vec![name.clone()])),
        }
    }
    Ok(groups.into_iter().map(|(_, members)| members).collect())
}

/// Files below `dir`, relative to it. Symlinked directories are not entered.
fn relative_files(dir: &Path) -> Result<Vec<PathBuf>, MergeError> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), MergeError> {
        for entry in fs::read_dir(dir).map_err(io_error(dir))? {
            let entry = entry.map_err(io_error(dir))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(io_error(&path))?;
            if file_type.is_dir() {
                walk(base, &path, out)?;
            } else if file_type.is_symlink() && path.is_dir() {
                continue;
            } else if let Ok(relative) = path.strip_prefix(base) {
                out.push(relative.to_path_buf());
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    if dir.is_dir() {
        walk(dir, dir, &mut files)?;
    }
    Ok(files)
}

/// First relative path present in more than one member of `group`
pub fn find_overlap(root: &Path, group: &[String]) -> Result<Option<PathBuf>, MergeError> {
    let mut seen = HashSet::new();
    for member in group {
        for file in relative_files(&root.join(member))? {
            if !seen.insert(file.clone()) {
                return Ok(Some(file));
            }
        }
    }
    Ok(None)
}

/// Recursively copy `src` into `dst`, overwriting files. Symlinked files
/// are copied by content; symlinked directories are skipped, as in
/// [`find_overlap`].
fn copy_tree(src: &Path, dst: &Path) -> Result<(), MergeError> {
    fs::create_dir_all(dst).map_err(io_error(dst))?;
    for entry in fs::read_dir(src).map_err(io_error(src))? {
        let entry = entry.map_err(io_error(src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(io_error(&from))?;
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() && from.is_dir() {
            warn!("Not following symlinked directory {}", from.display());
        } else {
            debug!("{} -> {}", from.display(), to.display());
            fs::copy(&from, &to).map_err(io_error(&from))?;
        }
    }
    Ok(())
}

/// Merges the snapshots below one root directory
#[derive(Debug, Clone)]
pub struct BackupMerger {
    root: PathBuf,
    options: MergeOptions,
}

impl BackupMerger {
    /// Merger for the snapshots directly below `root`
    pub fn new(root: impl Into<PathBuf>, options: MergeOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    /// Backups root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_names(&self) -> Result<Vec<String>, MergeError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_error(&self.root))? {
            let entry = entry.map_err(io_error(&self.root))?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => {
                    let name = raw.to_string_lossy().into_owned();
                    if !self.options.skip_errors {
                        return Err(MergeError::UnrecognizedName(name));
                    }
                    warn!("File `{}` has unrecognized name format, skipping", name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Group, check, then fold every eligible group into its first snapshot
    pub fn do_merge(&self) -> Result<MergeReport, MergeError> {
        let names = self.snapshot_names()?;
        if names.is_empty() {
            return Err(MergeError::NothingFound(self.root.clone()));
        }

        let precision = chrono::Duration::hours(i64::from(self.options.precision_hours));
        let mut groups = group_by_timestamp(&names, precision, self.options.skip_errors)?;

        let mut report = MergeReport {
            dry_run: self.options.dry_run,
            ..Default::default()
        };
        if !self.options.include_latest
            && let Some(latest) = groups.pop()
        {
            info!(
                "Skipping latest group `{}`, it can be still in backup process",
                latest.join(", ")
            );
            report.skipped_latest = Some(latest);
        }

        groups.retain(|group| group.len() > 1);
        for group in &groups {
            if let Some(path) = find_overlap(&self.root, group)? {
                return Err(MergeError::OverlappingFiles {
                    group: group.clone(),
                    path,
                });
            }
        }

        for group in groups {
            let Some((target, sources)) = group.split_first() else {
                continue;
            };
            let target_dir = self.root.join(target);
            for source in sources {
                let source_dir = self.root.join(source);
                if self.options.dry_run {
                    info!("Would merge `{}` into `{}`", source, target);
                    continue;
                }
                info!("Merging `{}` into `{}`", source, target);
                copy_tree(&source_dir, &target_dir)?;
                fs::remove_dir_all(&source_dir).map_err(io_error(&source_dir))?;
            }
            report.merged.push(MergedGroup {
                target: target.clone(),
                sources: sources.to_vec(),
            });
        }

        Ok(report)
    }
}
