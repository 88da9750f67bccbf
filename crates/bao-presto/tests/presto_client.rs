//! `PrestoClient` against a mocked coordinator.

use bao_presto::client::{ClientSettings, PrestoClient};
use bao_presto::connection::{EngineConnection, QueryError};
use serde_json::json;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> PrestoClient {
    PrestoClient::new(ClientSettings {
        base_url: server.uri(),
        user: "bench".into(),
        catalog: "tpch".into(),
        schema: "sf10".into(),
        query_max_execution_time: None,
        ..ClientSettings::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_query_follows_next_uri_and_collects_rows() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/statement"))
        .and(header("X-Presto-User", "bench"))
        .and(header("X-Presto-Catalog", "tpch"))
        .and(header("X-Presto-Schema", "sf10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "20240101_000001_00001_abcde",
            "nextUri": format!("{}/v1/statement/20240101_000001_00001_abcde/1", server.uri()),
            "stats": {"state": "QUEUED", "nodes": 0}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/statement/20240101_000001_00001_abcde/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "20240101_000001_00001_abcde",
            "nextUri": format!("{}/v1/statement/20240101_000001_00001_abcde/2", server.uri()),
            "data": [[1, "AFRICA"], [2, "AMERICA"]],
            "stats": {"state": "RUNNING", "nodes": 3}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/statement/20240101_000001_00001_abcde/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "20240101_000001_00001_abcde",
            "data": [[3, "ASIA"]],
            "stats": {"state": "FINISHED", "nodes": 3}
        })))
        .mount(&server)
        .await;

    let mut client = client(&server);
    let output = client.execute("SELECT r_regionkey, r_name FROM region").await.unwrap();
    assert_eq!(output.rows.len(), 3);
    assert_eq!(output.rows[2], vec![json!(3), json!("ASIA")]);
    assert_eq!(output.stats.query_id, "20240101_000001_00001_abcde");
    assert_eq!(output.stats.nodes, 3);
    assert_eq!(output.stats.state, "FINISHED");
}

#[tokio::test]
async fn test_no_nodes_available_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/statement"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "q_no_nodes",
            "stats": {"state": "FAILED", "nodes": 0},
            "error": {
                "message": "No nodes available to run query",
                "errorName": "NO_NODES_AVAILABLE",
                "errorCode": 65549
            }
        })))
        .mount(&server)
        .await;

    let err = client(&server).execute("SELECT 1").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_query_failure_keeps_error_name() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "q_failed",
            "error": {"message": "Required rule disabled", "errorName": "GENERIC_INTERNAL_ERROR"}
        })))
        .mount(&server)
        .await;

    let err = client(&server).execute("SELECT 1").await.unwrap_err();
    assert_eq!(
        err,
        QueryError::Failed {
            error_name: "GENERIC_INTERNAL_ERROR".into(),
            message: "Required rule disabled".into()
        }
    );
}

#[tokio::test]
async fn test_set_session_property_is_sent_with_later_queries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string("SET SESSION bao_disabled_rules = 'ReorderJoins,PruneLimitColumns'"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Presto-Set-Session", "bao_disabled_rules=ReorderJoins%2CPruneLimitColumns")
                .set_body_json(json!({"id": "q_set", "stats": {"state": "FINISHED"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string("SELECT 1"))
        .and(header("X-Presto-Session", "bao_disabled_rules=ReorderJoins%2CPruneLimitColumns"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "q_select",
            "data": [[1]],
            "stats": {"state": "FINISHED", "nodes": 1}
        })))
        .mount(&server)
        .await;

    let mut client = client(&server);
    client
        .set_session_property("bao_disabled_rules", "ReorderJoins,PruneLimitColumns")
        .await
        .unwrap();
    assert_eq!(
        client.session_properties().get("bao_disabled_rules").map(String::as_str),
        Some("ReorderJoins,PruneLimitColumns")
    );
    let output = client.execute("SELECT 1").await.unwrap();
    assert_eq!(output.stats.query_id, "q_select");
}

#[tokio::test]
async fn test_unknown_session_property_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "q_set",
            "error": {"message": "Session property bao_enable does not exist", "errorName": "INVALID_SESSION_PROPERTY"}
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .set_session_property("bao_enable", "true")
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::OptionRejected { ref name, .. } if name == "bao_enable"));
}

#[tokio::test]
async fn test_http_error_is_a_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Server is starting"))
        .mount(&server)
        .await;

    let err = client(&server).execute("SELECT 1").await.unwrap_err();
    assert!(matches!(err, QueryError::Transport(ref m) if m.contains("503")));
}

#[tokio::test]
async fn test_property_can_be_changed_without_set_session_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string("SELECT 1"))
        .and(header("X-Presto-Session", "bao_disabled_rules="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "q_select",
            "data": [[1]],
            "stats": {"state": "FINISHED", "nodes": 1}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "q_set", "stats": {"state": "FINISHED"}})))
        .mount(&server)
        .await;

    let mut client = client(&server);
    client.set_session_property("bao_disabled_rules", "ReorderJoins").await.unwrap();
    client.set_session_property("bao_disabled_rules", "").await.unwrap();
    assert_eq!(
        client.session_properties().get("bao_disabled_rules").map(String::as_str),
        Some("")
    );
    let output = client.execute("SELECT 1").await.unwrap();
    assert_eq!(output.stats.query_id, "q_select");
}
