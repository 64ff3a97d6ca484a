use serde_json::json;
use std::time::Duration;
use tiktools_license::authority::{DeactivateRequest, ValidateRequest};
use tiktools_license::{
    ActivationRecord, Authority, AuthorityClient, AuthorityError, LicenseConfig, LicensePatch,
    NewUser, UserPatch, UserStatus,
};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> AuthorityClient {
    let config = LicenseConfig {
        authority_url: server.uri(),
        api_key: "anon-key".to_string(),
        request_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    AuthorityClient::new(&config).unwrap()
}

// ── Licenses ────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_license_decodes_row_with_defaults() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/licenses"))
        .and(query_param("key", "eq.ABCD-1234"))
        .and(header("apikey", "anon-key"))
        .and(header("authorization", "Bearer anon-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "key": "ABCD-1234",
            "active": true,
            "license_type": null,
            "features": null,
            "expires_at": "2030-01-01T00:00:00",
            "bound_machines": null
        }])))
        .expect(1)
        .mount(&server)
        .await;

    let record = client_for(&server)
        .fetch_license("ABCD-1234")
        .await
        .unwrap()
        .unwrap();

    assert!(record.active);
    assert_eq!(record.license_type, "standard");
    assert!(record.features.is_empty());
    assert!(record.bound_machines.is_empty());
    assert_eq!(record.max_machines, 1);
    assert_eq!(
        record.expires_at.unwrap().to_rfc3339(),
        "2030-01-01T00:00:00+00:00"
    );
}

#[tokio::test]
async fn fetch_license_empty_result_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/licenses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    assert_eq!(client_for(&server).fetch_license("NOPE").await, Ok(None));
}

#[tokio::test]
async fn patch_license_sends_only_set_fields() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/licenses"))
        .and(query_param("key", "eq.ABCD-1234"))
        .and(header("prefer", "return=representation"))
        .and(body_json(json!({"bound_machines": ["aa", "bb"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server)
        .patch_license(
            "ABCD-1234",
            &LicensePatch::bindings(vec!["aa".to_string(), "bb".to_string()]),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn insert_activation_posts_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/activations"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let activation = ActivationRecord {
        id: uuid::Uuid::new_v4(),
        license_key: "ABCD-1234".to_string(),
        machine_hash: "hash".to_string(),
        app_id: "hash".to_string(),
        activated_at: chrono::Utc::now(),
        app_version: "1.2.0".to_string(),
    };
    client_for(&server).insert_activation(&activation).await.unwrap();
}

// ── Users ───────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_user_reads_ban_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .and(query_param("app_id", "eq.hash"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "app_id": "hash",
            "status": "banned",
            "ban_reason": "abuse",
            "total_visits": null
        }])))
        .mount(&server)
        .await;

    let user = client_for(&server).fetch_user("hash").await.unwrap().unwrap();
    assert!(user.is_banned());
    assert_eq!(user.ban_reason.as_deref(), Some("abuse"));
    assert_eq!(user.total_visits, 0);
}

#[tokio::test]
async fn unknown_user_status_is_tolerated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"app_id": "hash", "status": "trial"}])),
        )
        .mount(&server)
        .await;

    let users = client_for(&server).users_by_app_id("hash").await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].status, UserStatus::Unknown);
}

#[tokio::test]
async fn patch_and_insert_user() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/users"))
        .and(query_param("app_id", "eq.hash"))
        .and(body_json(json!({"total_visits": 4, "status": "active"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/users"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .patch_user(
            "hash",
            &UserPatch {
                total_visits: Some(4),
                status: Some(UserStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let now = chrono::Utc::now();
    client
        .insert_user(&NewUser {
            app_id: "hash".to_string(),
            license_key: None,
            status: UserStatus::Active,
            first_seen: now,
            last_seen: now,
            total_visits: 1,
            failed_attempts: 0,
        })
        .await
        .unwrap();
}

// ── License server endpoints ────────────────────────────────────

#[tokio::test]
async fn validate_remote_roundtrip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/validate"))
        .and(body_json(json!({
            "license_key": "ABCD-1234",
            "machine_id": "hash",
            "app_id": "hash",
            "app_version": "1.2.0"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "valid": true,
            "license_type": "pro",
            "features": ["batch"],
            "expires_at": null
        })))
        .mount(&server)
        .await;

    let response = client_for(&server)
        .validate_remote(&ValidateRequest {
            license_key: "ABCD-1234".to_string(),
            machine_id: "hash".to_string(),
            app_id: "hash".to_string(),
            app_version: "1.2.0".to_string(),
        })
        .await
        .unwrap();

    assert!(response.valid);
    assert_eq!(response.license_type.as_deref(), Some("pro"));
    assert_eq!(response.features, Some(vec!["batch".to_string()]));
}

#[tokio::test]
async fn deactivate_remote_roundtrip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/deactivate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&server)
        .await;

    let response = client_for(&server)
        .deactivate_remote(&DeactivateRequest {
            license_key: "ABCD-1234".to_string(),
            machine_id: "hash".to_string(),
        })
        .await
        .unwrap();
    assert!(response.success);
}

// ── Failure classification ──────────────────────────────────────

#[tokio::test]
async fn server_error_is_status_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/licenses"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = client_for(&server).fetch_license("K").await.unwrap_err();
    assert_eq!(
        err,
        AuthorityError::Status {
            status: 500,
            body: "boom".to_string()
        }
    );
    assert!(!err.is_connection());
    assert_eq!(err.status(), Some(500));
}

#[tokio::test]
async fn unreadable_body_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/licenses"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = client_for(&server).fetch_license("K").await.unwrap_err();
    assert!(matches!(err, AuthorityError::Decode(_)));
}

#[tokio::test]
async fn slow_authority_is_connection_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/licenses"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = client_for(&server).fetch_license("K").await.unwrap_err();
    assert!(err.is_connection(), "{err:?}");
}

#[tokio::test]
async fn unreachable_authority_is_connection_error() {
    let config = LicenseConfig {
        authority_url: "http://127.0.0.1:9".to_string(),
        request_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let err = AuthorityClient::new(&config)
        .unwrap()
        .fetch_license("K")
        .await
        .unwrap_err();
    assert!(err.is_connection(), "{err:?}");
}

#[test]
fn base_url_is_trimmed() {
    let config = LicenseConfig {
        authority_url: "https://auth.example.com/".to_string(),
        ..Default::default()
    };
    let client = AuthorityClient::new(&config).unwrap();
    assert_eq!(client.base_url(), "https://auth.example.com");
}
