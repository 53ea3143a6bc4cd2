//! Structured logging support for the guard.
//!
//! Builds `tracing` filter directives from a [`crate::config::LoggingConfig`],
//! so a host application can wire `tracing_subscriber::EnvFilter` to the same
//! knobs that drive everything else in [`crate::config`].

/// Build filter directives string from LoggingConfig
///
/// Constructs a tracing filter string that includes the base log level
/// and any component-specific log levels configured in the LoggingConfig.
///
/// # Arguments
///
/// * `config` - The logging configuration
///
/// # Returns
///
/// A filter string in the format: "base_level,strand_cost_guard::component1=level1,..."
///
/// # Examples
///
/// ```no_run
/// use strand_cost_guard::config::logging::LoggingConfig;
/// use strand_cost_guard::logging::build_filter_directives;
/// use std::collections::HashMap;
///
/// let mut component_levels = HashMap::new();
/// component_levels.insert("routing".to_string(), "debug".to_string());
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: strand_cost_guard::config::logging::LogFormat::Pretty,
///     component_levels: Some(component_levels),
/// };
///
/// let filter_str = build_filter_directives(&config);
/// assert_eq!(filter_str, "info,strand_cost_guard::routing=debug");
/// ```
pub fn build_filter_directives(config: &crate::config::LoggingConfig) -> String {
    let mut filter_str = config.level.clone();

    if let Some(component_levels) = &config.component_levels {
        for (component, level) in component_levels {
            filter_str.push_str(&format!(",strand_cost_guard::{}={}", component, level));
        }
    }

    filter_str
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogFormat, LoggingConfig};
    use std::collections::HashMap;

    #[test]
    fn base_level_with_no_component_overrides() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
            component_levels: None,
        };
        assert_eq!(build_filter_directives(&config), "warn");
    }

    #[test]
    fn component_overrides_are_appended() {
        let mut component_levels = HashMap::new();
        component_levels.insert("budget".to_string(), "debug".to_string());
        let config = LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Json,
            component_levels: Some(component_levels),
        };
        assert_eq!(build_filter_directives(&config), "info,strand_cost_guard::budget=debug");
    }
}
