//! Compiles per-host glob patterns once at startup and matches normalized
//! paths against them in declared order.
//!
//! `*` matches any byte sequence not containing `/` (i.e. within one path
//! segment); `**` matches across segments, including empty. A glob with
//! neither is a literal and matches only on full-path equality — which,
//! since the compiled regex is anchored with `^...$`, falls out of the same
//! matching path rather than needing a separate equality check.

use crate::config::HostConfig;
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;

/// The action selected by a matched pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Invoke the render client, consulting/writing the cache.
    Render,
    /// Forward without any cache interaction.
    Bypass,
    /// Emit a static response with the given status code.
    Status(u16),
}

/// Whether a pattern's cache entries pass through a stale window after
/// expiry, or are treated as gone the instant they expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleStrategy {
    ServeStale,
    Delete,
}

/// A compiled glob-and-policy pair.
#[derive(Debug, Clone)]
pub struct Pattern {
    /// The original glob text, kept for diagnostics and the CLI tester.
    pub glob: String,
    pub action: Action,
    pub cache_ttl: Duration,
    pub stale_ttl: Duration,
    pub stale_strategy: StaleStrategy,
    pub cached_status_codes: Vec<u16>,
    /// Extra headers applied to a `Status` action's static response.
    /// Unused by `Render`/`Bypass` actions.
    pub headers: HashMap<String, String>,
    matcher: Regex,
}

impl Pattern {
    /// Compile a glob into a `Pattern`. Called once at config-load time —
    /// never per request.
    pub fn compile(
        glob: String,
        action: Action,
        cache_ttl: Duration,
        stale_ttl: Duration,
        stale_strategy: StaleStrategy,
        cached_status_codes: Vec<u16>,
        headers: HashMap<String, String>,
    ) -> Result<Self> {
        let matcher = compile_glob(&glob)?;
        Ok(Pattern {
            glob,
            action,
            cache_ttl,
            stale_ttl,
            stale_strategy,
            cached_status_codes,
            headers,
            matcher,
        })
    }

    /// Whether the given normalized path matches this pattern's glob.
    pub fn matches(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }

    /// Whether `stale_ttl` is effectively disabled, either because the
    /// strategy is `delete` or the configured duration is zero.
    pub fn stale_disabled(&self) -> bool {
        matches!(self.stale_strategy, StaleStrategy::Delete)
            || self.stale_ttl.is_zero()
    }

    /// `true` if this policy never treats any render status as cacheable —
    /// an empty allowlist means nothing is ever written to the cache.
    pub fn is_cacheable_status(&self, status: u16) -> bool {
        !self.cached_status_codes.is_empty()
            && self.cached_status_codes.contains(&status)
    }
}

fn compile_glob(glob: &str) -> Result<Regex> {
    // Split on the `**` token first so it can match across `/`, then escape
    // and translate each literal-or-`*` chunk.
    let mut pattern = String::from("^");
    for (i, segment) in glob.split("**").enumerate() {
        if i > 0 {
            pattern.push_str(".*");
        }
        for (j, literal) in segment.split('*').enumerate() {
            if j > 0 {
                pattern.push_str("[^/]*");
            }
            pattern.push_str(&regex::escape(literal));
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| {
        Error::ConfigInvalid(format!("invalid glob \"{glob}\": {e}"))
    })
}

/// The outcome of matching a host's patterns against a path: either a
/// declared pattern, by position, or the host's synthetic default.
pub struct Matched<'a> {
    pub name: &'a str,
    pub pattern: &'a Pattern,
}

/// Match a normalized path against a host's patterns, first-match-wins, in
/// declared order. Falls back to the host's `(default)` policy.
pub fn match_path<'a>(host: &'a HostConfig, path: &str) -> Matched<'a> {
    for pattern in &host.patterns {
        if pattern.matches(path) {
            return Matched { name: pattern.glob.as_str(), pattern };
        }
    }
    Matched { name: "(default)", pattern: &host.default_action }
}
