//! Command-line interface: run the gateway, validate a config file, or test
//! how a single URL would be resolved against it.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Edge gateway fronting an HTML rendering service with a fresh/stale cache"
)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config", value_name = "FILE", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Test mode: bare `-t` validates the config and exits; `-t <url>` prints
    /// how that URL resolves against every configured host without starting
    /// a server.
    #[arg(short = 't', long = "test", value_name = "URL", num_args = 0..=1, default_missing_value = "")]
    pub test: Option<String>,
}

impl Cli {
    /// `-t` passed with no URL argument: validate-only mode.
    pub fn is_validate_only(&self) -> bool {
        matches!(self.test.as_deref(), Some(""))
    }

    /// `-t <url>` passed with a non-empty URL: URL-tester mode.
    pub fn test_url(&self) -> Option<&str> {
        match self.test.as_deref() {
            Some(url) if !url.is_empty() => Some(url),
            _ => None,
        }
    }
}
