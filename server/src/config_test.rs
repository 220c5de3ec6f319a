use super::*;
use std::sync::Mutex;

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// # Safety
/// Callers hold `ENV_LOCK` so no other test mutates the environment concurrently.
unsafe fn clear_relay_env() {
    unsafe {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("PORT");
        std::env::remove_var("DB_MAX_CONNECTIONS");
        std::env::remove_var("TYPING_TIMEOUT_MS");
        std::env::remove_var("TYPING_SWEEP_INTERVAL_MS");
        std::env::remove_var("CLIENT_CHANNEL_CAPACITY");
    }
}

#[test]
fn from_env_requires_database_url() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    unsafe { clear_relay_env() };

    let err = RelayConfig::from_env().unwrap_err();
    assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
}

#[test]
fn from_env_applies_defaults() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    unsafe {
        clear_relay_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/chat");
    }

    let cfg = RelayConfig::from_env().unwrap();
    assert_eq!(cfg.database_url, "postgres://localhost/chat");
    assert_eq!(cfg.port, DEFAULT_PORT);
    assert_eq!(cfg.typing_timeout, Duration::from_millis(3000));
    assert_eq!(cfg.client_channel_capacity, DEFAULT_CLIENT_CHANNEL_CAPACITY);

    unsafe { clear_relay_env() };
}

#[test]
fn from_env_parses_overrides_and_ignores_garbage() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    unsafe {
        clear_relay_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/chat");
        std::env::set_var("PORT", "8081");
        std::env::set_var("TYPING_TIMEOUT_MS", "1500");
        std::env::set_var("DB_MAX_CONNECTIONS", "not-a-number");
    }

    let cfg = RelayConfig::from_env().unwrap();
    assert_eq!(cfg.port, 8081);
    assert_eq!(cfg.typing_timeout, Duration::from_millis(1500));
    assert_eq!(cfg.db_max_connections, DEFAULT_DB_MAX_CONNECTIONS);

    unsafe { clear_relay_env() };
}

#[test]
fn from_env_rejects_invalid_port() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    unsafe {
        clear_relay_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/chat");
        std::env::set_var("PORT", "eighty");
    }

    let err = RelayConfig::from_env().unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { var: "PORT", .. }));

    unsafe { clear_relay_env() };
}
