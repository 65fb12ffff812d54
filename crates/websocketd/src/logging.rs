//! Process-wide logging setup.
//!
//! The directives below are the defaults. `RUST_LOG` is appended after
//! them, so it wins for any target it names.

use tracing_subscriber::filter::{EnvFilter, ParseError};

/// Targets of this workspace.
const OWN_TARGETS: &[&str] = &[
    "accent_websocketd",
    "websocketd",
    "websocketd_core",
    "websocketd_protocol",
];

/// Third-party targets that are far too chatty at info level.
pub const NOISY_TARGETS: &[&str] = &[
    "lapin",
    "amq_protocol",
    "tungstenite",
    "tokio_tungstenite",
    "hyper",
    "reqwest",
];

/// Builds the filter used by the daemon.
pub fn build_filter(debug: bool) -> Result<EnvFilter, ParseError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    build_filter_with(debug, env.as_deref())
}

/// Builds the filter from the defaults followed by the `env` directives.
pub fn build_filter_with(debug: bool, env: Option<&str>) -> Result<EnvFilter, ParseError> {
    let level = if debug { "debug" } else { "info" };

    let mut directives: Vec<String> = OWN_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .chain(NOISY_TARGETS.iter().map(|target| format!("{target}=warn")))
        .collect();

    // Later directives replace earlier ones for the same target
    if let Some(env) = env.map(str::trim).filter(|env| !env.is_empty()) {
        directives.push(env.to_string());
    }

    EnvFilter::try_new(directives.join(","))
}

/// Installs the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init(debug: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(debug)?)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directives(filter: EnvFilter) -> Vec<String> {
        filter.to_string().split(',').map(|d| d.trim().to_string()).collect()
    }

    #[test]
    fn test_filter_silences_noisy_targets() {
        let filter = directives(build_filter_with(false, None).unwrap());
        for target in NOISY_TARGETS {
            assert!(filter.contains(&format!("{target}=warn")), "{filter:?}");
        }
        assert!(filter.contains(&"websocketd=info".to_string()));
    }

    #[test]
    fn test_debug_raises_own_targets() {
        let filter = directives(build_filter_with(true, None).unwrap());
        assert!(filter.contains(&"websocketd=debug".to_string()));
        assert!(filter.contains(&"lapin=warn".to_string()));
    }

    #[test]
    fn test_rust_log_overrides_defaults() {
        let filter = directives(build_filter_with(false, Some("websocketd=trace,lapin=info")).unwrap());
        let has = |directive: &str| filter.iter().any(|d| d == directive);
        assert!(has("websocketd=trace"), "{filter:?}");
        assert!(!has("websocketd=info"), "{filter:?}");
        assert!(has("lapin=info"), "{filter:?}");
        assert!(!has("lapin=warn"), "{filter:?}");
        // Targets it does not name keep their default
        assert!(has("reqwest=warn"), "{filter:?}");
        assert!(has("accent_websocketd=info"), "{filter:?}");
    }

    #[test]
    fn test_blank_rust_log_keeps_defaults() {
        let filter = directives(build_filter_with(false, Some("  ")).unwrap());
        assert!(filter.contains(&"websocketd=info".to_string()), "{filter:?}");
    }

    #[test]
    fn test_invalid_rust_log_is_an_error() {
        assert!(build_filter_with(false, Some("websocketd=loud")).is_err());
    }
}
