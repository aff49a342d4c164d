//! `tracing` subscriber setup.
//!
//! `RUST_LOG` wins over the configured level, which only sets the default
//! for the `murmur*` targets.

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. Call once, early in `main`.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(format!("murmur={level}").parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_level() {
        assert!(init("bogus").is_err());
    }
}
