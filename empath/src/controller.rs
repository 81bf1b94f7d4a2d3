use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use empath_common::{internal, logging, signal, tracing};
use empath_scheduler::{Config, Options, Scheduler, dirqueue::ScanLimits, process::ForkLauncher};

/// Places searched for a configuration when none is named
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./empath.config.ron", "/etc/empath/empath.config.ron"];

/// Transport scheduler for the empath MTA
#[derive(Parser, Debug, Default, PartialEq, Eq)]
#[command(name = "empath", version)]
pub struct Args {
    /// Configuration file (defaults to `EMPATH_CONFIG`, then the usual locations)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Start with worker creation frozen
    #[arg(short = 'F', long)]
    pub freeze: bool,

    /// Absorb the whole spool before starting any transport agent
    #[arg(short = 'S', long)]
    pub sync_start: bool,

    /// Maximum transport agent starts per second
    #[arg(short = 'R', long, value_parser = clap::value_parser!(u32).range(1..))]
    pub fork_rate: Option<u32>,

    /// Only start agents for destinations matching `channel/host`
    #[arg(short = 'p', long)]
    pub select: Option<String>,

    /// Directory scan budget as `entries,seconds`
    #[arg(short = 'E', long, value_parser = parse_scan_limits)]
    pub scan_limits: Option<ScanLimits>,
}

impl Args {
    /// Scheduler options for a configuration loaded from `config_path`
    #[must_use]
    pub fn options(&self, config_path: &Path) -> Options {
        Options {
            config_path: Some(config_path.to_path_buf()),
            freeze: self.freeze,
            sync_start: self.sync_start,
            fork_rate: self.fork_rate,
            select: self.select.clone(),
            scan_limits: self.scan_limits,
        }
    }
}

/// Parse `entries,seconds`, clamped to limits that keep the loop responsive
///
/// # Errors
///
/// If either half is missing or not a number.
pub fn parse_scan_limits(text: &str) -> Result<ScanLimits, String> {
    let (entries, seconds) = text
        .split_once(',')
        .ok_or_else(|| format!("expected `entries,seconds`, got {text:?}"))?;

    let entries = entries
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("bad entry limit {entries:?}: {e}"))?;
    let seconds = seconds
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("bad time limit {seconds:?}: {e}"))?;

    Ok(ScanLimits::clamped(entries, seconds))
}

/// Find the configuration file using the following precedence:
/// 1. an explicitly named file
/// 2. `EMPATH_CONFIG` environment variable
/// 3. ./empath.config.ron (current working directory)
/// 4. /etc/empath/empath.config.ron (system-wide config)
///
/// # Errors
///
/// If the chosen file does not exist, or none of the defaults do.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    locate_config(
        explicit,
        std::env::var_os("EMPATH_CONFIG").map(PathBuf::from),
        &DEFAULT_CONFIG_PATHS.map(PathBuf::from),
    )
}

fn locate_config(
    explicit: Option<&Path>,
    from_env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.exists(), "Config file {} does not exist", path.display());
        return Ok(path.to_path_buf());
    }

    if let Some(path) = from_env {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "EMPATH_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - EMPATH_CONFIG environment variable\n{paths_tried}"
    )
}

/// Load a configuration, naming the file in any error
///
/// # Errors
///
/// If the file cannot be read or is not a valid configuration.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load config from {}", path.display()))
}

pub struct Empath {
    config: Config,
    options: Options,
}

impl Empath {
    /// Resolve and load the configuration named by `args`
    ///
    /// # Errors
    ///
    /// If no configuration can be found or loaded.
    pub fn new(args: &Args) -> anyhow::Result<Self> {
        let path = find_config_file(args.config.as_deref())?;
        let config = load_config(&path)?;

        Ok(Self {
            options: args.options(&path),
            config,
        })
    }

    /// Run the scheduler until it is told to stop
    ///
    /// # Errors
    ///
    /// If signal handlers cannot be installed or the scheduler cannot start.
    pub fn run(self) -> anyhow::Result<()> {
        logging::init();
        signal::install().context("Failed to install signal handlers")?;

        internal!("Controller running");

        let mut scheduler = Scheduler::new(self.config, self.options, Box::new(ForkLauncher))
            .context("Failed to start the scheduler")?;
        scheduler.run()?;

        tracing::info!("Shutting down...");

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{fs, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_scan_limits() {
        let limits = parse_scan_limits("500, 10").unwrap();
        assert_eq!(limits.entries, 500);
        assert_eq!(limits.time, Duration::from_secs(10));

        assert_eq!(parse_scan_limits("1,60").unwrap(), ScanLimits::clamped(1, 60));
        assert!(parse_scan_limits("500").is_err());
        assert!(parse_scan_limits("many,10").is_err());
    }

    #[test]
    fn test_explicit_config_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("mine.ron");
        let fallback = dir.path().join("fallback.ron");
        fs::write(&explicit, "").unwrap();
        fs::write(&fallback, "").unwrap();

        let found = locate_config(
            Some(&explicit),
            Some(fallback.clone()),
            std::slice::from_ref(&fallback),
        )
        .unwrap();
        assert_eq!(found, explicit);

        assert!(locate_config(Some(&dir.path().join("gone.ron")), None, &[fallback]).is_err());
    }

    #[test]
    fn test_environment_before_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("env.ron");
        let fallback = dir.path().join("fallback.ron");
        fs::write(&fallback, "").unwrap();

        // A dangling EMPATH_CONFIG is an error, not a reason to fall back
        assert!(locate_config(None, Some(env.clone()), std::slice::from_ref(&fallback)).is_err());

        fs::write(&env, "").unwrap();
        assert_eq!(
            locate_config(None, Some(env.clone()), std::slice::from_ref(&fallback)).unwrap(),
            env
        );
    }

    #[test]
    fn test_first_existing_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.ron");
        let present = dir.path().join("present.ron");
        fs::write(&present, "").unwrap();

        assert_eq!(
            locate_config(None, None, &[missing.clone(), present.clone()]).unwrap(),
            present
        );

        let error = locate_config(None, None, &[missing]).unwrap_err();
        assert!(error.to_string().contains("missing.ron"));
    }
}
