use super::*;
use crate::connection::Backoff;
use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| vars.get(key).cloned()
}

fn temp_file(contents: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("velvetpour_client_{suffix}.toml"));
    fs::write(&path, contents).expect("write settings");
    path
}

#[test]
fn defaults_match_controller_client_behaviour() {
    let settings = load_settings_from(None, env_from(&[])).expect("settings");

    assert_eq!(settings, ClientSettings::default());
    assert_eq!(settings.reconnect_policy(), ReconnectPolicy::default());
    assert_eq!(
        settings.event_channel_url().unwrap().as_str(),
        "ws://127.0.0.1:5000/ws"
    );
    assert_eq!(settings.request_timeout(), Duration::from_secs(10));
}

#[test]
fn file_values_override_defaults() {
    let path = temp_file(
        r#"
server_url = "http://172.16.1.154:5000"
reconnection_attempts = 8
backoff = "exponential"
reconnection_delay_ms = 250
max_reconnection_delay_ms = 4000
"#,
    );

    let settings = load_settings_from(Some(&path), env_from(&[])).expect("settings");
    fs::remove_file(&path).expect("cleanup");

    assert_eq!(settings.server_url, "http://172.16.1.154:5000");
    assert_eq!(settings.request_timeout_ms, 10_000);
    let policy = settings.reconnect_policy();
    assert_eq!(policy.max_attempts, 8);
    assert_eq!(
        policy.backoff,
        Backoff::Exponential {
            max_delay: Duration::from_millis(4000)
        }
    );
}

#[test]
fn app_prefixed_env_wins_over_legacy_name() {
    let settings = load_settings_from(
        None,
        env_from(&[
            ("VELVETPOUR_SERVER_URL", "http://legacy:5000"),
            ("APP__SERVER_URL", "http://bar.local:5000"),
            ("APP__RECONNECTION_ATTEMPTS", "2"),
        ]),
    )
    .expect("settings");

    assert_eq!(settings.server_url, "http://bar.local:5000");
    assert_eq!(settings.reconnection_attempts, 2);
}

#[test]
fn explicit_transport_url_is_used_verbatim() {
    let settings = load_settings_from(
        None,
        env_from(&[("APP__TRANSPORT_URL", "ws://10.0.0.5:9000/events")]),
    )
    .expect("settings");

    assert_eq!(
        settings.event_channel_url().unwrap().as_str(),
        "ws://10.0.0.5:9000/events"
    );
}

#[test]
fn invalid_values_are_reported() {
    let err = load_settings_from(None, env_from(&[("APP__RECONNECTION_ATTEMPTS", "many")]))
        .unwrap_err();
    assert!(matches!(
        err,
        SettingsError::InvalidValue {
            key: "APP__RECONNECTION_ATTEMPTS",
            ..
        }
    ));

    let err = load_settings_from(None, env_from(&[("APP__SERVER_URL", "not a url")])).unwrap_err();
    assert!(matches!(err, SettingsError::InvalidUrl { key: "server_url", .. }));

    let err = load_settings_from(None, env_from(&[("APP__BACKOFF", "random")])).unwrap_err();
    assert!(matches!(err, SettingsError::InvalidValue { .. }));
}

#[test]
fn unreadable_or_malformed_file_is_an_error() {
    let missing = std::env::temp_dir().join("velvetpour_client_missing.toml");
    assert!(matches!(
        load_settings_from(Some(&missing), env_from(&[])),
        Err(SettingsError::Read { .. })
    ));

    let path = temp_file("reconnection_attempts = \"five\"");
    let result = load_settings_from(Some(&path), env_from(&[]));
    fs::remove_file(&path).expect("cleanup");
    assert!(matches!(result, Err(SettingsError::Parse { .. })));
}
