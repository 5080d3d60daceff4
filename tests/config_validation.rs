//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use mux_network::config::{NetworkConfig, SchedulerConfig, StreamConfig};
use mux_network::HandshakeFeatures;
use std::time::Duration;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_reliable_defaults() {
    let stream = StreamConfig::default();
    assert_eq!(stream.retry_interval, Duration::from_millis(500));
    assert_eq!(stream.window, 64);
    assert_eq!(stream.close_timeout, Duration::from_secs(1));

    let scheduler = SchedulerConfig::default();
    assert_eq!(scheduler.workers, 1);
    assert!(scheduler.task_timeout.is_none());
    assert!(!scheduler.auto_scale);
}

#[test]
fn test_zero_window_rejected() {
    let config = NetworkConfig::default_with_overrides(|c| c.stream.window = 0);
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("window")));
}

#[test]
fn test_oversized_chunk_rejected() {
    let config = NetworkConfig::default_with_overrides(|c| c.stream.datagram_chunk_size = 70_000);
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("datagram_chunk_size")));
}

#[test]
fn test_short_handshake_timeout_rejected() {
    let config =
        NetworkConfig::default_with_overrides(|c| c.handshake.timeout = Duration::from_millis(5));
    assert!(config.validate_strict().is_err());
}

#[test]
fn test_multiple_errors_reported_together() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.stream.window = 0;
        c.stream.close_timeout = Duration::ZERO;
        c.scheduler.workers = 0;
    });
    let errors = config.validate();
    assert!(errors.len() >= 3, "expected three errors, got {errors:?}");

    let message = config
        .validate_strict()
        .expect_err("invalid config must fail strict validation")
        .to_string();
    assert!(message.contains("Configuration validation failed"));
}

#[test]
fn test_toml_overrides_only_given_fields() {
    let config = NetworkConfig::from_toml(
        r#"
        [stream]
        retry_interval = 250
        window = 16
        close_timeout = 2000
        max_chunk_size = 8192
        datagram_chunk_size = 1000

        [handshake]
        timeout = 3000
        features = "COMPRESSION | ENCRYPTION"
        "#,
    )
    .expect("valid TOML");

    assert_eq!(config.stream.retry_interval, Duration::from_millis(250));
    assert_eq!(config.stream.window, 16);
    assert_eq!(config.handshake.timeout, Duration::from_secs(3));
    assert_eq!(
        config.handshake.features,
        HandshakeFeatures::COMPRESSION | HandshakeFeatures::ENCRYPTION
    );
    assert_eq!(config.scheduler.workers, 1);
}

#[test]
fn test_example_config_parses_back() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).expect("example config must parse");
    assert!(parsed.validate().is_empty());
}

#[tokio::test]
async fn test_network_refuses_invalid_config() {
    use mux_network::error::ConfigError;
    use mux_network::{Network, Pid};

    let broken = [
        NetworkConfig::default_with_overrides(|c| c.stream.max_chunk_size = 0),
        NetworkConfig::default_with_overrides(|c| c.stream.retry_interval = Duration::ZERO),
        NetworkConfig::default_with_overrides(|c| {
            c.participant.bandwidth_interval = Duration::ZERO
        }),
        NetworkConfig::default_with_overrides(|c| c.stream.max_message_size = 0),
    ];
    for config in broken {
        let err = Network::new(Pid::new(), config).expect_err("invalid config accepted");
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }
    assert!(Network::new(Pid::new(), NetworkConfig::default()).is_ok());
}
