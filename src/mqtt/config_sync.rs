use crate::config::{parse_document, ConfigError, ConfigStore, Identity};

/// Topic filter for configuration updates. A gateway that knows who it
/// is listens on its own topic; a factory-fresh one does not, so it
/// falls back to a wildcard and takes the first config that arrives.
pub fn config_topic(identity: &Identity) -> String {
    if identity.gw.is_empty() {
        "config/+/meters".to_string()
    } else {
        format!("config/{}/meters", identity.gw)
    }
}

/// Match a concrete topic against a subscription filter, honoring the
/// `+` single level and `#` multi level wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Handle one inbound config payload: parse, validate, persist. On
/// success the identity re-read from disk comes back for the log line.
/// On any failure the previous configuration stays untouched.
pub fn apply_config_message(
    store: &ConfigStore,
    payload: &[u8],
) -> Result<Identity, ConfigError> {
    let document = parse_document(payload)?;
    store.replace(&document)?;
    Ok(store.current_identity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigValidationError;
    use serde_json::json;
    use tempfile::tempdir;

    fn identity(site: &str, gw: &str) -> Identity {
        Identity {
            site: site.to_string(),
            gw: gw.to_string(),
        }
    }

    #[test]
    fn test_config_topic_uses_gw_when_known() {
        assert_eq!(config_topic(&identity("plant-a", "gw-7")), "config/gw-7/meters");
        assert_eq!(config_topic(&identity("", "")), "config/+/meters");
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("config/gw-7/meters", "config/gw-7/meters"));
        assert!(!topic_matches("config/gw-7/meters", "config/gw-8/meters"));
        assert!(!topic_matches("config/gw-7/meters", "config/gw-7/meters/extra"));
        assert!(!topic_matches("config/gw-7/meters", "config/gw-7"));

        assert!(topic_matches("config/+/meters", "config/anything/meters"));
        assert!(!topic_matches("config/+/meters", "config/a/b/meters"));
        assert!(!topic_matches("config/+/meters", "config/meters"));

        assert!(topic_matches("config/#", "config/gw-7/meters"));
        assert!(topic_matches("config/#", "config"));
    }

    #[test]
    fn test_apply_persists_valid_config() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let payload = json!({
            "site": "plant-a",
            "gw": "gw-7",
            "meters": [
                { "meter": "m1", "ip": "10.0.0.8", "unitId": 1, "model": "acme-300" }
            ]
        });
        let applied = apply_config_message(&store, payload.to_string().as_bytes()).unwrap();
        assert_eq!(applied, identity("plant-a", "gw-7"));
        assert_eq!(store.read_current().unwrap().meters.len(), 1);
    }

    #[test]
    fn test_apply_rejects_bad_payloads_without_side_effects() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let err = apply_config_message(&store, b"definitely not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let invalid = json!({ "site": "plant-a", "meters": [] });
        let err = apply_config_message(&store, invalid.to_string().as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation(ConfigValidationError::MissingGw)
        ));

        assert_eq!(store.read_current(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_bootstrap_flow_switches_topics() {
        /* fresh gateway: wildcard first, own topic after the first
         * accepted config, exactly what a reconnect would derive */
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert_eq!(config_topic(&store.current_identity()), "config/+/meters");

        let payload = json!({
            "site": "plant-a",
            "gw": "gw-7",
            "meters": []
        });
        apply_config_message(&store, payload.to_string().as_bytes()).unwrap();

        assert_eq!(
            config_topic(&store.current_identity()),
            "config/gw-7/meters"
        );
    }
}
