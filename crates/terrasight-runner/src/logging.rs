//! Console logging setup.

use tracing_subscriber::EnvFilter;

const CRATES: [&str; 4] = [
    "terrasight_dem",
    "terrasight_analysis",
    "terrasight_jobs",
    "terrasight_runner",
];

/// Filter applied when `RUST_LOG` is unset: `level` for this workspace's
/// crates, warnings for everything else.
pub fn default_filter(level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(CRATES.iter().map(|c| format!("{}={}", c, level)));
    directives.join(",")
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable.
pub fn init_logging(level: &str) -> Result<(), String> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter(level))
            .map_err(|e| format!("invalid log level '{}': {}", level, e))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_scopes_workspace_crates() {
        let f = default_filter("debug");
        assert!(f.starts_with("warn,"));
        assert!(f.contains("terrasight_jobs=debug"));
        assert!(EnvFilter::try_new(f).is_ok());
    }
}
