//! CLI configuration. Grounded on `original_source/include/utils/config.h`'s
//! `Config` singleton (field names, `argparse` flag set) with `clap::Parser`
//! replacing `argparse::ArgumentParser`, per `wcygan-sql-database`'s
//! `repl`/`server`/`client-cli` crates.

use std::path::PathBuf;

use clap::Parser;

/// A single-node relational storage and execution engine.
#[derive(Debug, Parser)]
#[command(name = "scapedb", version, about)]
pub struct Config {
    /// Run without an interactive prompt, emitting CSV rows instead of
    /// tabulated output.
    #[arg(short, long)]
    pub batch: bool,

    /// Preset current database on startup.
    #[arg(short, long, value_name = "NAME")]
    pub database: Option<String>,

    /// Preset focus table on startup.
    #[arg(short, long, value_name = "NAME")]
    pub table: Option<String>,

    /// Read statements from this file instead of stdin.
    #[arg(short, long, value_name = "PATH")]
    pub filepath: Option<PathBuf>,

    /// Purge every database under the data root before starting.
    #[arg(long)]
    pub init: bool,

    /// Override the data root (defaults to `<binary_dir>/data`).
    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Resolves the effective data root: `--data-dir` if given, else
    /// `<binary_dir>/data` (spec §6 "Environment").
    pub fn data_root(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
        let binary_dir = exe.parent().unwrap_or_else(|| std::path::Path::new(".")).to_path_buf();
        binary_dir.join("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_flags_together() {
        let cfg = Config::parse_from(["scapedb", "-b", "--database", "school", "-t", "students", "--init"]);
        assert!(cfg.batch);
        assert_eq!(cfg.database.as_deref(), Some("school"));
        assert_eq!(cfg.table.as_deref(), Some("students"));
        assert!(cfg.init);
        assert!(cfg.filepath.is_none());
    }

    #[test]
    fn data_dir_override_wins_over_default() {
        let cfg = Config::parse_from(["scapedb", "--data-dir", "/tmp/scapedb-data"]);
        assert_eq!(cfg.data_root(), PathBuf::from("/tmp/scapedb-data"));
    }
}
