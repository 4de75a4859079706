use pretty_assertions::assert_eq;
use rowsync_agent::{AgentConfig, AgentRunner, RunOptions};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer, extra: &str) -> AgentConfig {
    let toml = format!(
        r#"
auth_token = "eu--token"
api_base_url = "{}"
{}

[[operations]]
type = "push"
target_data_source_id = 42
primary_column = "id"
frequency_secs = 3600

[operations.source]
kind = "rows"
rows = [{{ id = 1, name = "Ada" }}, {{ id = 2, name = "Grace" }}]
"#,
        server.uri(),
        extra
    );
    AgentConfig::from_toml(&toml).unwrap()
}

fn runner(config: &AgentConfig) -> AgentRunner {
    let options = RunOptions {
        dry_run: config.dry_run,
        sync_on_init: config.sync_on_init,
    };
    AgentRunner::new(config.build_orchestrator().unwrap(), options)
}

async fn mount_user(server: &MockServer, status: u16) {
    let response = if status == 200 {
        ResponseTemplate::new(200).set_body_json(json!({"user": {"id": 1, "email": "ops@example.com"}}))
    } else {
        ResponseTemplate::new(status).set_body_json(json!({"message": "Invalid token"}))
    };
    Mock::given(method("GET"))
        .and(path("/v1/user"))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_entries(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/data-sources/42/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"entries": []})))
        .mount(server)
        .await;
}

// ── Startup pass ────────────────────────────────────────────────

#[tokio::test]
async fn startup_pass_commits_rows() {
    let server = MockServer::start().await;
    mount_user(&server, 200).await;
    mount_entries(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/data-sources/42/commit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"entries": [{}, {}]})))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(&server, "");
    let results = runner(&config).start().await.unwrap();

    assert_eq!(results.len(), 1);
    let report = results[0].1.as_ref().unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.affected, 2);
}

#[tokio::test]
async fn dry_run_sends_no_commit() {
    let server = MockServer::start().await;
    mount_user(&server, 200).await;
    mount_entries(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/data-sources/42/commit"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let config = config_for(&server, "dry_run = true");
    let results = runner(&config).start().await.unwrap();

    let report = results[0].1.as_ref().unwrap();
    assert_eq!(report.dry_run_payloads.len(), 1);
    assert_eq!(report.dry_run_payloads[0]["entries"][0]["data"]["name"], json!("Ada"));
}

#[tokio::test]
async fn rejected_token_stops_startup() {
    let server = MockServer::start().await;
    mount_user(&server, 401).await;

    let config = config_for(&server, "");
    let runner = runner(&config);

    assert!(runner.start().await.is_err());
    assert!(runner.orchestrator().auth_failed().await);
}

#[tokio::test]
async fn sync_on_init_disabled_skips_pass() {
    let server = MockServer::start().await;
    mount_user(&server, 200).await;

    let config = config_for(&server, "sync_on_init = false");
    let results = runner(&config).start().await.unwrap();
    assert!(results.is_empty());
}

// ── Scheduling ──────────────────────────────────────────────────

#[tokio::test]
async fn operations_with_frequency_are_scheduled() {
    let server = MockServer::start().await;
    let config = config_for(&server, "");
    let runner = runner(&config);

    let handles = runner.schedule();
    assert_eq!(handles.len(), 1);
    for handle in handles {
        handle.abort();
    }
}
