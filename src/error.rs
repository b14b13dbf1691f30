use thiserror::Error;

/// A `Result` typedef to use with the [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// The kinds of failure a render invocation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFailureKind {
    /// Connection refused, timed out, or otherwise never reached the renderer.
    Transport,
    /// The renderer answered with a 5xx status.
    ServerError,
    /// The renderer answered, but with a status outside the pattern's
    /// `cached_status_codes` allowlist.
    NonCacheableStatus,
    /// The response body or headers could not be parsed.
    InvalidResponse,
}

impl std::fmt::Display for RenderFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RenderFailureKind::Transport => "transport",
            RenderFailureKind::ServerError => "server_error",
            RenderFailureKind::NonCacheableStatus => "non_cacheable_status",
            RenderFailureKind::InvalidResponse => "invalid_response",
        };
        f.write_str(s)
    }
}

/// The gateway's error type.
///
/// Only [`Error::BadRequest`] and [`Error::ConfigInvalid`] are surfaced to
/// callers as errors. Every other variant is absorbed by the orchestrator
/// and turned into a response (possibly a 502 bypass) rather than
/// propagated.
#[derive(Error, Debug)]
pub enum Error {
    /// The raw request URL could not be parsed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No host in the configuration matches the request's `Host` header.
    #[error("host \"{0}\" not found")]
    HostNotFound(String),

    /// The KV store or blob store was unreachable or returned an I/O error.
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),

    /// The render client failed to produce a usable response.
    #[error("render failed: {0}")]
    RenderFailure(RenderFailureKind),

    /// The configuration file is invalid.
    #[error("{0}")]
    ConfigInvalid(String),

    /// Error from the `url` crate.
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    /// Error constructing or reading an `http` type.
    #[error(transparent)]
    Http(#[from] http::Error),

    /// Error converting a header value to a string.
    #[error(transparent)]
    HeaderToStr(#[from] http::header::ToStrError),

    /// Error from the Redis client.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// Error from filesystem operations on the blob store.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Error from the reqwest client used to call the renderer.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// Error parsing the YAML configuration.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
