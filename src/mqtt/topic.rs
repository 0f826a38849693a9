//! Topic templates and subscription filter matching

use crate::error::ConfigError;

/// Placeholder substituted with the gateway MAC
pub const PLACEHOLDER: &str = "%s";

/// Resolve a topic template such as `gateway/%s/event/up`
///
/// The template must contain the placeholder exactly once.
pub fn resolve_topic(template: &str, gateway_mac: &str) -> Result<String, ConfigError> {
    if template.matches(PLACEHOLDER).count() != 1 {
        return Err(ConfigError::InvalidTopicTemplate(template.to_string()));
    }
    Ok(template.replacen(PLACEHOLDER, gateway_mac, 1))
}

/// Whether `topic` is covered by the subscription `filter` (`+` and `#` wildcards)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
