use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::config::*;

#[test]
fn config_deserializes_from_empty_env() -> Result<()> {
    let config: Config = envy::prefixed(ENV_PREFIX).from_iter(Vec::<(String, String)>::new())?;

    assert!(
        config.rodeos_binary == "./programs/rodeos/rodeos",
        "unexpected default for RODEOS_BINARY, got {}",
        config.rodeos_binary
    );
    assert!(config.ship_base_port == 9999, "unexpected default for SHIP_BASE_PORT, got {}", config.ship_base_port);
    assert!(config.wql_base_port == 8880, "unexpected default for WQL_BASE_PORT, got {}", config.wql_base_port);
    assert!(config.catchup_max_retries == 60, "unexpected default for CATCHUP_MAX_RETRIES, got {}", config.catchup_max_retries);
    assert!(config.post_start_delay_ms == 1000, "unexpected default for POST_START_DELAY_MS, got {}", config.post_start_delay_ms);
    assert!(config.stop_grace_seconds.is_none(), "expected unbounded stop grace by default, got {:?}", config.stop_grace_seconds);

    Ok(())
}

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::prefixed(ENV_PREFIX).from_iter(vec![
        ("RODEOS_HARNESS_RODEOS_BINARY".into(), "/opt/bin/rodeos".into()),
        ("RODEOS_HARNESS_NODEOS_BINARY".into(), "/opt/bin/nodeos".into()),
        ("RODEOS_HARNESS_WORK_DIR".into(), "/tmp/harness".into()),
        ("RODEOS_HARNESS_LISTEN_HOST".into(), "0.0.0.0".into()),
        ("RODEOS_HARNESS_SHIP_BASE_PORT".into(), "7000".into()),
        ("RODEOS_HARNESS_WQL_BASE_PORT".into(), "7100".into()),
        ("RODEOS_HARNESS_STOP_GRACE_SECONDS".into(), "15".into()),
        ("RODEOS_HARNESS_POLL_INTERVAL_MS".into(), "250".into()),
        ("RODEOS_HARNESS_CATCHUP_MAX_RETRIES".into(), "120".into()),
    ])?;

    assert!(config.rodeos_binary == "/opt/bin/rodeos", "unexpected value parsed for RODEOS_BINARY, got {}", config.rodeos_binary);
    assert!(config.nodeos_binary == "/opt/bin/nodeos", "unexpected value parsed for NODEOS_BINARY, got {}", config.nodeos_binary);
    assert!(config.ship_addr(1) == "0.0.0.0:7000", "unexpected ship 1 address, got {}", config.ship_addr(1));
    assert!(config.ship_addr(3) == "0.0.0.0:7002", "unexpected ship 3 address, got {}", config.ship_addr(3));
    assert!(config.wql_addr(2) == "0.0.0.0:7102", "unexpected replica 2 address, got {}", config.wql_addr(2));
    assert!(
        config.stop_grace() == Some(Duration::from_secs(15)),
        "unexpected value parsed for STOP_GRACE_SECONDS, got {:?}",
        config.stop_grace()
    );
    assert!(
        config.replica_dir(1) == PathBuf::from("/tmp/harness/var/lib/rodeos1"),
        "unexpected replica dir, got {:?}",
        config.replica_dir(1)
    );

    let policy = config.catchup_policy();
    assert!(policy.interval == Duration::from_millis(250), "unexpected catch-up interval, got {:?}", policy.interval);
    assert!(policy.max_retries == 120, "unexpected catch-up retries, got {}", policy.max_retries);

    Ok(())
}

#[test]
fn ready_policy_spans_the_ready_timeout() -> Result<()> {
    let mut config: Config = envy::prefixed(ENV_PREFIX).from_iter(Vec::<(String, String)>::new())?;
    config.poll_interval_ms = 500;
    config.ready_timeout_seconds = 30;

    let policy = config.ready_policy();
    assert!(policy.max_retries == 60, "expected 60 retries of 500ms to span 30s, got {}", policy.max_retries);

    Ok(())
}
