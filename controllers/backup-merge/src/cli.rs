//! Command line

use clap::Parser;
use kd_core::MergeOptions;
use std::path::PathBuf;

/// Merge node backups taken within a time window into one snapshot
#[derive(Debug, Parser)]
#[command(name = "kd-backup-merge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding `local_pv_backup_*` snapshots (defaults to the configured root)
    pub backups: Option<PathBuf>,

    /// YAML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Debug output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Warnings and errors only
    #[arg(short, long)]
    pub quiet: bool,

    /// Skip entries with unrecognized names instead of failing
    #[arg(short, long = "skip")]
    pub skip_errors: bool,

    /// Show what would be merged without changing anything
    #[arg(short, long)]
    pub dry_run: bool,

    /// Group window in hours
    #[arg(short, long)]
    pub precision: Option<u32>,

    /// Merge the newest group too, even if its backup may still be running
    #[arg(short, long)]
    pub include_latest: bool,
}

impl Cli {
    /// Default `EnvFilter` directive for the chosen verbosity
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    /// Merge options, taking the precision from `default_precision` unless given
    pub fn merge_options(&self, default_precision: u32) -> MergeOptions {
        MergeOptions {
            precision_hours: self.precision.unwrap_or(default_precision),
            dry_run: self.dry_run,
            include_latest: self.include_latest,
            skip_errors: self.skip_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_flags() {
        let args = ["kd-backup-merge", "-v", "-s", "-d", "-i", "-p", "6", "/backups"];
        let cli = Cli::try_parse_from(args).unwrap();

        assert_eq!(cli.backups, Some(PathBuf::from("/backups")));
        assert_eq!(cli.log_filter(), "debug");
        assert_eq!(
            cli.merge_options(1),
            MergeOptions {
                precision_hours: 6,
                dry_run: true,
                include_latest: true,
                skip_errors: true,
            }
        );
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["kd-backup-merge"]).unwrap();

        assert!(cli.backups.is_none());
        assert_eq!(cli.log_filter(), "info");
        assert_eq!(cli.merge_options(2).precision_hours, 2);
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["kd-backup-merge", "-v", "-q"]).is_err());
    }
}
