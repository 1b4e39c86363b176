//! Common utilities
//!
//! Logging setup and cache directory helpers.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Initialize logging with an explicit filter directive.
///
/// This is the only place the crate touches global state, and it only happens
/// when the host application asks for it. Pass e.g. `"t5qg=info"`, or an
/// empty string to defer to `RUST_LOG`.
pub fn init_logging(directives: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if directives.is_empty() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new(directives)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

/// Get the default cache directory for preprocessed features
/// (`~/.cache/t5qg`).
pub fn get_cache_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE"))?;
    cache_dir_under(Path::new(&home))
}

fn cache_dir_under(base: &Path) -> Result<PathBuf> {
    let cache_dir = base.join(".cache/t5qg");
    fs::create_dir_all(&cache_dir)
        .context(format!("Failed to create cache directory: {:?}", cache_dir))?;
    Ok(cache_dir)
}
