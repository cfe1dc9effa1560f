use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Override the level chosen by -v/-q, e.g. `DOCKVAULT_LOG=dockvault_core=trace`.
/// The first one set wins.
const FILTER_ENVS: [&str; 2] = ["DOCKVAULT_LOG", "RUST_LOG"];

pub struct LogOptions<'a> {
    pub verbose: u8,
    pub quiet: bool,
    pub color: bool,
    pub file: Option<&'a Path>,
}

fn default_level(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    }
}

fn filter(level: &str) -> EnvFilter {
    FILTER_ENVS
        .iter()
        .find_map(|var| EnvFilter::try_from_env(var).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

/// Human-readable events on stderr, plus an append-only copy without colour
/// when a log file is configured. `--quiet` does not thin out the file.
pub fn init(options: &LogOptions<'_>) -> Result<()> {
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(options.color && std::io::stderr().is_terminal())
        .with_filter(filter(default_level(options.verbose, options.quiet)));
    let file = match options.file {
        Some(path) => {
            let handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(handle))
                    .with_ansi(false)
                    .with_filter(filter(default_level(options.verbose, false))),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init()
        .context("failed to install logger")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(default_level(0, false), "info");
        assert_eq!(default_level(1, false), "debug");
        assert_eq!(default_level(3, false), "trace");
        assert_eq!(default_level(2, true), "error");
    }
}
