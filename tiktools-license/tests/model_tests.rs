use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use std::path::PathBuf;
use tiktools_license::{
    AuthorityError, DisableReason, LicenseConfig, LicenseError, LicensePatch, LicenseRecord,
    LicenseStatus, UserStatus, parse_timestamp,
};

// ── Records ─────────────────────────────────────────────────────

#[test]
fn license_record_null_fields_take_defaults() {
    let record: LicenseRecord = serde_json::from_value(json!({
        "key": "K",
        "active": null,
        "license_type": null,
        "max_machines": null,
        "features": null,
        "bound_machines": null,
        "email": null,
        "expires_at": "not a date"
    }))
    .unwrap();

    assert!(!record.active);
    assert_eq!(record.license_type, "standard");
    assert_eq!(record.max_machines, 1);
    assert!(record.features.is_empty());
    assert!(record.bound_machines.is_empty());
    assert!(record.email.is_empty());
    assert!(record.expires_at.is_none());
}

#[test]
fn license_record_ignores_unknown_columns() {
    let record: LicenseRecord = serde_json::from_value(json!({
        "key": "K", "active": true, "last_seen": "2026-01-01", "notes": "vip"
    }))
    .unwrap();
    assert!(record.active);
}

#[test]
fn binding_capacity() {
    let mut record: LicenseRecord =
        serde_json::from_value(json!({"key": "K", "active": true, "max_machines": 2})).unwrap();
    assert!(!record.is_full());
    record.bound_machines = vec!["a".to_string(), "b".to_string()];
    assert!(record.is_full());
    assert!(record.is_bound("a"));
    assert!(!record.is_bound("c"));
}

#[test]
fn expiry_is_strictly_after() {
    let expires = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    let record: LicenseRecord = serde_json::from_value(json!({
        "key": "K", "active": true, "expires_at": "2026-03-01T00:00:00Z"
    }))
    .unwrap();

    assert!(!record.is_expired_at(expires));
    assert!(record.is_expired_at(expires + Duration::seconds(1)));

    let entitlement = record.entitlement();
    assert_eq!(entitlement.days_remaining_at(expires - Duration::hours(49)), Some(2));
    assert_eq!(entitlement.days_remaining_at(expires + Duration::days(3)), Some(0));
}

#[test]
fn timestamps_in_authority_formats() {
    let expected = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
    assert_eq!(parse_timestamp("2026-01-31T12:00:00Z"), Some(expected));
    assert_eq!(parse_timestamp("2026-01-31T14:00:00+02:00"), Some(expected));
    assert_eq!(parse_timestamp("2026-01-31T12:00:00"), Some(expected));
    assert_eq!(parse_timestamp("2026-01-31 12:00:00.000"), Some(expected));
    assert_eq!(
        parse_timestamp("2026-01-31"),
        Some(Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap())
    );
    assert_eq!(parse_timestamp(""), None);
    assert_eq!(parse_timestamp("soon"), None);
}

#[test]
fn patches_skip_unset_fields() {
    let patch = serde_json::to_value(LicensePatch::bindings(vec!["a".to_string()])).unwrap();
    assert_eq!(patch, json!({"bound_machines": ["a"]}));

    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let seen = serde_json::to_value(LicensePatch::seen(now, "1.2.0")).unwrap();
    assert_eq!(seen["last_version"], "1.2.0");
    assert!(seen.get("bound_machines").is_none());
}

#[test]
fn user_status_flags() {
    for (raw, flagged) in [
        ("active", false),
        ("visitor", false),
        ("banned", true),
        ("suspicious", true),
        ("hacking", true),
        ("something-new", false),
    ] {
        let status: UserStatus = serde_json::from_value(json!(raw)).unwrap();
        assert_eq!(status.is_flagged(), flagged, "{raw}");
    }
}

// ── Status and reasons ──────────────────────────────────────────

#[test]
fn usable_statuses() {
    assert!(LicenseStatus::Valid.is_usable());
    assert!(LicenseStatus::Offline.is_usable());
    for status in [
        LicenseStatus::Invalid,
        LicenseStatus::Expired,
        LicenseStatus::Disabled,
        LicenseStatus::Revoked,
        LicenseStatus::MaxDevices,
        LicenseStatus::Error,
    ] {
        assert!(!status.is_usable(), "{status}");
    }
}

#[test]
fn status_wire_names() {
    assert_eq!(LicenseStatus::MaxDevices.to_string(), "max_devices");
    assert_eq!(
        serde_json::to_value(LicenseStatus::MaxDevices).unwrap(),
        json!("max_devices")
    );
    assert_eq!(LicenseStatus::Offline.as_str(), "offline");
}

#[test]
fn disable_reasons_are_human_readable() {
    assert_eq!(
        DisableReason::Banned(None).to_string(),
        "Device banned: Your device has been banned by administrator"
    );
    assert_eq!(
        DisableReason::Banned(Some("  ".to_string())).to_string(),
        "Device banned: Your device has been banned by administrator"
    );
    assert_eq!(
        DisableReason::Banned(Some("chargeback".to_string())).to_string(),
        "Device banned: chargeback"
    );
    assert_eq!(
        DisableReason::LicenseDisabled.to_string(),
        "License has been disabled by administrator"
    );
    assert_eq!(DisableReason::LicenseDeleted.to_string(), "License has been deleted");
    assert_eq!(
        DisableReason::MachineRemoved.to_string(),
        "Device has been removed from license"
    );
}

// ── Errors ──────────────────────────────────────────────────────

#[test]
fn error_display() {
    let err = AuthorityError::Status {
        status: 401,
        body: "bad key".to_string(),
    };
    assert_eq!(err.to_string(), "license authority returned 401: bad key");

    let wrapped: LicenseError = err.into();
    assert_eq!(wrapped.to_string(), "license authority returned 401: bad key");
    assert_eq!(LicenseError::NotActivated.to_string(), "license not activated");
}

#[test]
fn only_connection_failures_are_offline_eligible() {
    assert!(AuthorityError::Connection("refused".to_string()).is_connection());
    assert!(!AuthorityError::Decode("eof".to_string()).is_connection());
    assert!(
        !AuthorityError::Status {
            status: 503,
            body: String::new()
        }
        .is_connection()
    );
}

// ── Config ──────────────────────────────────────────────────────

#[test]
fn config_defaults() {
    let config = LicenseConfig::default();
    assert_eq!(config.request_timeout.as_secs(), 10);
    assert_eq!(config.offline_horizon.as_secs(), 24 * 60 * 60);
    assert_eq!(config.heartbeat_interval.as_secs(), 30);
    assert_eq!(config.reconnect_backoff.as_secs(), 5);
    assert_eq!(config.poll_interval.as_secs(), 10);
    assert!(config.realtime_enabled);
    assert!(config.poll_enabled);
    assert!(config.authority_url.is_empty());
    assert!(matches!(config.validate(), Err(LicenseError::Config(_))));

    let configured = LicenseConfig {
        authority_url: "https://auth.example.com".to_string(),
        ..config
    };
    assert!(configured.validate().is_ok());
}

#[test]
fn realtime_endpoint_is_derived() {
    let config = LicenseConfig {
        authority_url: "https://auth.example.com/".to_string(),
        api_key: "anon".to_string(),
        ..Default::default()
    };
    assert_eq!(
        config.realtime_endpoint(),
        "wss://auth.example.com/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
    );

    let local = LicenseConfig {
        authority_url: "http://127.0.0.1:54321".to_string(),
        api_key: "k".to_string(),
        ..Default::default()
    };
    assert!(local.realtime_endpoint().starts_with("ws://127.0.0.1:54321/realtime/v1/websocket"));

    let explicit = LicenseConfig {
        realtime_url: Some("ws://push.local/socket".to_string()),
        ..Default::default()
    };
    assert_eq!(explicit.realtime_endpoint(), "ws://push.local/socket");
}

#[test]
fn cache_path_resolution() {
    let explicit = LicenseConfig {
        cache_path: Some(PathBuf::from("/tmp/lc.enc")),
        ..Default::default()
    };
    assert_eq!(explicit.resolve_cache_path().unwrap(), PathBuf::from("/tmp/lc.enc"));

    if let Ok(path) = LicenseConfig::default().resolve_cache_path() {
        assert!(path.ends_with(".tiktools/license_cache.enc"));
    }
}

#[test]
fn invalid_config_is_rejected() {
    let bad_url = LicenseConfig {
        authority_url: "ftp://nope".to_string(),
        ..Default::default()
    };
    assert!(matches!(bad_url.validate(), Err(LicenseError::Config(_))));

    let base = LicenseConfig {
        authority_url: "https://auth.example.com".to_string(),
        ..Default::default()
    };
    let zero_poll = LicenseConfig {
        poll_interval: std::time::Duration::ZERO,
        ..base.clone()
    };
    assert!(zero_poll.validate().is_err());

    let zero_heartbeat = LicenseConfig {
        heartbeat_interval: std::time::Duration::ZERO,
        ..base.clone()
    };
    assert!(zero_heartbeat.validate().is_err());

    let zero_backoff = LicenseConfig {
        reconnect_backoff: std::time::Duration::ZERO,
        ..base
    };
    let err = zero_backoff.validate().unwrap_err();
    assert!(err.to_string().contains("reconnect_backoff"), "{err}");
}

#[test]
fn config_serde_roundtrip() {
    let config = LicenseConfig {
        poll_interval: std::time::Duration::from_millis(2500),
        ..Default::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    let parsed: LicenseConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.poll_interval, config.poll_interval);
    assert_eq!(parsed.authority_url, config.authority_url);
}
