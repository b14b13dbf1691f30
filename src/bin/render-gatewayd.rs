use clap::Parser;
use render_gateway::cli::Cli;
use render_gateway::config;
use render_gateway::key::CacheKey;
use render_gateway::normalize;
use render_gateway::pattern::{self, Action};
use render_gateway::server;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let loaded = config::load(&cli.config);

    if cli.is_validate_only() {
        return validate_only(loaded);
    }

    if let Some(url) = cli.test_url() {
        return test_url(loaded, url);
    }

    let (raw, hosts) = match loaded {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Configuration validation FAILED: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = config::ensure_storage_dir(&raw) {
        eprintln!("failed to prepare storage directory: {e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = server::run(raw, hosts).await {
        eprintln!("server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn validate_only(loaded: render_gateway::error::Result<(config::RawConfig, config::HostTable)>) -> ExitCode {
    match loaded {
        Ok(_) => {
            println!("syntax is ok");
            println!("configuration test is successful");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("Configuration validation FAILED: {e}");
            ExitCode::FAILURE
        }
    }
}

fn test_url(
    loaded: render_gateway::error::Result<(config::RawConfig, config::HostTable)>,
    url: &str,
) -> ExitCode {
    let (_, hosts) = match loaded {
        Ok(v) => v,
        Err(e) => {
            println!("Configuration validation FAILED: {e}");
            return ExitCode::FAILURE;
        }
    };

    let normalized = match normalize::normalize(url, "", "https") {
        Ok(n) => n,
        Err(e) => {
            println!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };

    let host = match hosts.lookup(normalized.host()) {
        Ok(h) => h,
        Err(_) => {
            println!("ERROR: Host \"{}\" not found", normalized.host());
            println!("Available hosts:");
            for domain in hosts.domains() {
                println!("  - {domain}");
            }
            return ExitCode::FAILURE;
        }
    };

    let matched = pattern::match_path(host, normalized.path());
    println!("URL: {url}");
    println!("Normalized: {}", normalized.as_str());
    println!("Pattern: {}", matched.name);

    match matched.pattern.action {
        Action::Render => {
            let dimension = host.dimensions.keys().next().map(String::as_str).unwrap_or("default");
            let key = CacheKey::derive(&normalized, dimension);
            println!("Action: render");
            println!("Key: {key}");
            println!("cache_ttl: {}s", matched.pattern.cache_ttl.as_secs());
            println!("stale_ttl: {}s", matched.pattern.stale_ttl.as_secs());
            println!("render_timeout: {}s", host.default_timeout.as_secs());
        }
        Action::Bypass => println!("Action: bypass"),
        Action::Status(code) => println!("Action: status_{code}"),
    }

    ExitCode::SUCCESS
}
