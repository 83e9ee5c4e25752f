use homedash::config::{Config, StorageBackend};
use serial_test::serial;
use std::fs;
use tempfile::tempdir;

#[tokio::test]
#[serial]
async fn load_missing_config_uses_defaults() {
    let cfg = Config::load("/path/that/does/not/exist/homedash.toml").await.expect("fallback ok");
    assert!(cfg.services.is_empty());
    assert_eq!(cfg.server.port, 9090);
    assert_eq!(cfg.polling.max_concurrency, 5);
    assert_eq!(cfg.probe.default_expected_status, vec![200]);
    assert_eq!(cfg.storage.backend, StorageBackend::Memory);
    assert!(!cfg.telemetry_enabled());
}

#[tokio::test]
#[serial]
async fn load_custom_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("homedash.toml");
    let toml = format!(
        r#"
        secrets_dir = "{secrets}"

        [polling]
        health_interval_seconds = 30
        max_concurrency = 2

        [telemetry]
        base_url = "http://beszel.lan:8090"
        identity = "ops@example.com"
        password = "pw"

        [storage]
        backend = "sqlite"
        database_path = "/var/lib/homedash/history.db"

        [[services]]
        slug = "immich"
        name = "Immich"
        url = "http://arborlon:2283"
        health_url = "http://arborlon:2283/api/server/ping"
        host = "🏠 Arborlon"
        container = "immich_server"
        expected_status = [200, 401]
        timeout_ms = 1000

        [[services]]
        slug = "old"
        name = "Retired"
        url = "http://old"
        enabled = false
    "#,
        secrets = dir.path().display()
    );
    fs::write(&path, toml).unwrap();
    let cfg = Config::load(&path).await.expect("parse custom");
    assert_eq!(cfg.services.len(), 2);
    assert_eq!(cfg.services[0].slug, "immich");
    assert_eq!(cfg.services[0].expected_status.as_deref(), Some(&[200u16, 401][..]));
    assert!(!cfg.services[1].enabled);
    assert_eq!(cfg.polling.health_interval_seconds, 30);
    assert_eq!(cfg.polling.metrics_interval_seconds, 10);
    assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);
    assert!(cfg.telemetry_enabled());
}

#[tokio::test]
#[serial]
async fn secrets_fill_empty_credentials() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("telemetry_identity"), "robot@example.com\n").unwrap();
    fs::write(dir.path().join("telemetry_password"), "  hunter2 ").unwrap();
    fs::write(dir.path().join("encryption_key"), "k3y").unwrap();
    let path = dir.path().join("homedash.toml");
    fs::write(
        &path,
        format!(
            "secrets_dir = \"{}\"\n[telemetry]\nbase_url = \"http://b\"\npassword = \"from-file\"\n",
            dir.path().display()
        ),
    )
    .unwrap();

    let cfg = Config::load(&path).await.unwrap();
    assert_eq!(cfg.telemetry.identity, "robot@example.com");
    // explicit values win over secret files
    assert_eq!(cfg.telemetry.password, "from-file");
    assert_eq!(cfg.vault.encryption_key, "k3y");
}

#[tokio::test]
#[serial]
async fn environment_overrides_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("homedash.toml");
    fs::write(&path, "[server]\nport = 7000\n").unwrap();

    std::env::set_var("HOMEDASH__SERVER__PORT", "8181");
    std::env::set_var("HOMEDASH__TELEMETRY__BASE_URL", "http://telemetry.lan");
    let loaded = Config::load(&path).await;
    std::env::remove_var("HOMEDASH__SERVER__PORT");
    std::env::remove_var("HOMEDASH__TELEMETRY__BASE_URL");

    let cfg = loaded.unwrap();
    assert_eq!(cfg.server.port, 8181);
    assert_eq!(cfg.telemetry.base_url, "http://telemetry.lan");
}

#[tokio::test]
#[serial]
async fn duplicate_slugs_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("homedash.toml");
    fs::write(
        &path,
        r#"
        [[services]]
        slug = "a"
        name = "A"
        url = "http://a"

        [[services]]
        slug = "a"
        name = "A2"
        url = "http://a2"
    "#,
    )
    .unwrap();
    let err = Config::load(&path).await.unwrap_err();
    assert!(err.to_string().contains("duplicate"), "{err}");
}

#[tokio::test]
#[serial]
async fn invalid_toml_errors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "this = not = valid").unwrap();
    assert!(Config::load(&path).await.is_err());
}
