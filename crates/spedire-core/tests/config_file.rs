//! Loading a documented config file from disk and layering env overrides.

use std::collections::HashMap;

use spedire_core::{FailMode, SpedireConfig, SpedireError};

const SAMPLE: &str = r#"
[database]
path = "~/.spedire/automations.db"

[lock]
redis_url = "redis://10.0.0.5:6379"
fail_mode = "closed"
ttl_secs = 600

[dispatcher]
tolerance_minutes = 10

[gateway]
port = 8088
cron_secret = "from-file"

[[webhooks]]
slug = "low-balance-alert"
url = "https://worker.internal/automations/low-balance-alert"

[[webhooks]]
slug = "postpaid-monthly-billing"
url = "https://worker.internal/automations/billing"
bearer_token = "t0k"
timeout_secs = 30
"#;

fn write_sample(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("spedire-config-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.toml");
    std::fs::write(&path, SAMPLE).unwrap();
    path
}

#[test]
fn sample_file_loads() {
    let path = write_sample("load");
    let config = SpedireConfig::load_from(&path).unwrap();

    assert_eq!(config.lock.fail_mode, FailMode::Closed);
    assert_eq!(config.lock.ttl_secs, 600);
    // unspecified keys keep their defaults
    assert_eq!(config.lock.key_prefix, "automation:lock");
    assert_eq!(config.dispatcher.tick_interval_secs, 300);
    assert_eq!(config.gateway.host, "127.0.0.1");

    assert_eq!(config.webhooks.len(), 2);
    assert_eq!(config.webhooks[0].timeout_secs, 120);
    assert!(config.webhooks[0].bearer_token.is_empty());
    assert_eq!(config.webhooks[1].bearer_token, "t0k");

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn env_overrides_win_over_file() {
    let path = write_sample("env");
    let mut config = SpedireConfig::load_from(&path).unwrap();
    let env: HashMap<&str, &str> = HashMap::from([
        ("AUTOMATION_LOCK_FAIL_MODE", "open"),
        ("CRON_SECRET", "from-env"),
        ("REDIS_URL", ""),
    ]);
    config
        .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
        .unwrap();

    assert_eq!(config.lock.fail_mode, FailMode::Open);
    assert_eq!(config.gateway.cron_secret, "from-env");
    // blank values do not clear file settings
    assert_eq!(config.lock.redis_url, "redis://10.0.0.5:6379");

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn missing_file_is_config_error() {
    let path = std::env::temp_dir().join("spedire-does-not-exist/config.toml");
    assert!(matches!(
        SpedireConfig::load_from(&path),
        Err(SpedireError::Config(_))
    ));
}

#[test]
fn webhook_without_url_is_rejected() {
    let toml = "[[webhooks]]\nslug = \"x\"\nurl = \"\"\n";
    assert!(matches!(
        SpedireConfig::from_toml(toml),
        Err(SpedireError::Config(_))
    ));
}
