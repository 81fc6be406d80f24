//! Tracing subscriber setup for the `hostprobe` binaries.
//!
//! Logs always go to stderr; stdout carries the collected results.

use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSettings;

/// Crates whose events pass the default filter.
pub const LOG_TARGETS: &[&str] = &["hostprobe", "hostprobe_core", "hostprobe_exec"];

/// Install the global subscriber described by `settings`.
///
/// `RUST_LOG`, when set and valid, replaces the level from `settings`.
pub fn init_tracing(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(LOG_TARGETS, &settings.level)));

    let output = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let output = if settings.json {
        output.json().boxed()
    } else {
        output.boxed()
    };

    tracing_subscriber::registry().with(filter).with(output).init();
}

/// `target=level` directives for each of `targets`, comma separated.
pub fn default_filter(targets: &[&str], level: &str) -> String {
    targets
        .iter()
        .map(|t| format!("{t}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_joins_targets() {
        assert_eq!(
            default_filter(&["hostprobe", "hostprobe_exec"], "debug"),
            "hostprobe=debug,hostprobe_exec=debug"
        );
    }

    #[test]
    fn default_filter_empty_targets() {
        assert_eq!(default_filter(&[], "info"), "");
    }

    #[test]
    fn configured_level_builds_a_valid_filter() {
        let directives = default_filter(LOG_TARGETS, &LoggingSettings::default().level);
        assert!(directives.starts_with("hostprobe=info,"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }
}
