use serde_json::{json, Value};
use std::sync::Arc;

use run_telemetry::metrics::db::MetricsDb;
use run_telemetry::server;
use run_telemetry::state::AppState;

const API_KEY: &str = "test-secret";

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start(api_key: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = MetricsDb::open(&dir.path().join("metrics.db")).unwrap();
        let state = Arc::new(AppState::new(db, api_key.map(str::to_string)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(listener, state, std::future::pending()));

        Self {
            base_url: format!("http://{}", addr),
            client: reqwest::Client::new(),
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(API_KEY)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: &Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(API_KEY)
            .json(body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

fn api_payload(test_name: &str, status: &str) -> Value {
    json!({
        "testId": format!("id-{}", test_name),
        "testName": test_name,
        "suiteName": "issues.spec.ts > Issues API",
        "timestamp": "2024-05-01T10:00:00.000Z",
        "environment": "ci",
        "status": status,
        "duration": 210,
        "retryCount": 0,
        "apiCalls": [
            {"endpoint": "/issues", "method": "GET", "statusCode": 200, "responseTime": 90.4},
            {"endpoint": "/issues/1", "method": "GET", "statusCode": 200, "responseTime": 110.2}
        ],
        "schemaValidations": [
            {"schema": "IssueList", "valid": true, "validationTime": 1.5}
        ]
    })
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let server = TestServer::start(Some(API_KEY)).await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "test-metrics-server");
}

#[tokio::test]
async fn test_auth_rejections() {
    let server = TestServer::start(Some(API_KEY)).await;
    let url = server.url("/api/metrics/summary");

    let resp = server.client.get(&url).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Unauthorized");
    assert_eq!(body["message"], "Missing Authorization header");

    let resp = server
        .client
        .get(&url)
        .header("Authorization", "Basic abc")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Invalid authentication scheme. Expected: Bearer");

    let resp = server
        .client
        .get(&url)
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Forbidden");

    let (status, body) = server.get("/api/metrics/summary").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_missing_server_key_is_a_server_error() {
    let server = TestServer::start(None).await;
    let (status, body) = server.get("/api/metrics/summary").await;
    assert_eq!(status, 500);
    assert_eq!(body["error"], "Server Configuration Error");
    assert_eq!(body["message"], "Server authentication not configured");
}

#[tokio::test]
async fn test_submit_api_metrics_and_list() {
    let server = TestServer::start(Some(API_KEY)).await;
    let (status, receipt) = server
        .post("/api/metrics/api-tests", &api_payload("lists issues", "passed"))
        .await;
    assert_eq!(status, 201);
    assert_eq!(receipt["success"], true);
    assert_eq!(receipt["message"], "API test metrics received");
    assert_eq!(receipt["testId"], "id-lists issues");
    assert_eq!(receipt["status"], "passed");
    assert!(receipt["id"].as_str().is_some_and(|id| !id.is_empty()));

    let (status, body) = server.get("/api/metrics/api-tests").await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 1);
    let metric = &body["metrics"][0];
    assert_eq!(metric["id"], receipt["id"]);
    assert_eq!(metric["testName"], "lists issues");
    assert_eq!(metric["totalApiTime"], 201);
    assert_eq!(metric["averageResponseTime"], 100);
    assert_eq!(metric["slowestCall"]["endpoint"], "/issues/1");
    assert_eq!(metric["slowestCall"]["duration"], 110);
    assert!(metric["createdAt"].is_string());
}

#[tokio::test]
async fn test_missing_fields_persist_nothing() {
    let server = TestServer::start(Some(API_KEY)).await;
    let mut payload = api_payload("no name", "passed");
    payload["testName"] = json!("");

    let (status, body) = server.post("/api/metrics/api-tests", &payload).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Bad Request");
    assert_eq!(
        body["message"],
        "Missing required fields: testId, testName, or timestamp"
    );

    let (_, body) = server.get("/api/metrics/summary").await;
    assert_eq!(body["summary"]["totalApiMetrics"], 0);
}

#[tokio::test]
async fn test_failed_e2e_run_with_retries() {
    let server = TestServer::start(Some(API_KEY)).await;
    let payload = json!({
        "testId": "e2e-login",
        "testName": "logs in",
        "timestamp": "2024-05-01T10:00:00Z",
        "status": "failed",
        "retryCount": 2,
        "duration": 450,
        "browser": "firefox",
        "pageMetrics": [],
        "actionMetrics": [{"action": "click", "selector": "#submit", "duration": 12}],
        "browserMetrics": {"memoryUsage": 48},
        "networkMetrics": {"totalRequests": 3, "failedRequests": 1, "totalTransferred": 2048, "resourceTypes": {"script": 3}},
        "error": {"message": "Timeout waiting for #dashboard", "screenshot": "shots/login.png"}
    });

    let (status, receipt) = server.post("/api/metrics/e2e-tests", &payload).await;
    assert_eq!(status, 201);
    assert_eq!(receipt["message"], "E2E test metrics received");
    assert_eq!(receipt["browser"], "firefox");
    assert_eq!(receipt["status"], "failed");

    let (_, body) = server.get("/api/metrics/e2e-tests").await;
    let metric = &body["metrics"][0];
    assert_eq!(metric["status"], "failed");
    assert_eq!(metric["retryCount"], 2);
    assert_eq!(metric["duration"], 450);
    assert_eq!(metric["error"]["message"], "Timeout waiting for #dashboard");

    let (_, body) = server.get("/api/metrics/summary").await;
    assert_eq!(body["summary"]["totalE2eMetrics"], 1);
    assert_eq!(body["summary"]["latestE2ePassRate"], 0);
}

#[tokio::test]
async fn test_summary_pass_rate() {
    let server = TestServer::start(Some(API_KEY)).await;
    for i in 0..10 {
        let status = if i < 7 { "passed" } else { "failed" };
        let (code, _) = server
            .post("/api/metrics/api-tests", &api_payload(&format!("run-{}", i), status))
            .await;
        assert_eq!(code, 201);
    }

    let (status, body) = server.get("/api/metrics/summary").await;
    assert_eq!(status, 200);
    assert_eq!(body["summary"]["totalApiMetrics"], 10);
    assert_eq!(body["summary"]["latestApiPassRate"], 70);
    assert_eq!(body["summary"]["totalE2eMetrics"], 0);
    assert!(body["summary"]["lastUpdated"].is_string());
}

#[tokio::test]
async fn test_pagination_params() {
    let server = TestServer::start(Some(API_KEY)).await;
    for i in 0..3 {
        server
            .post("/api/metrics/api-tests", &api_payload(&format!("run-{}", i), "passed"))
            .await;
    }

    let (_, body) = server.get("/api/metrics/api-tests?limit=2").await;
    assert_eq!(body["count"], 2);

    let (_, body) = server.get("/api/metrics/api-tests?limit=2&offset=2").await;
    assert_eq!(body["count"], 1);

    let (_, body) = server.get("/api/metrics/api-tests?offset=10").await;
    assert_eq!(body["count"], 0);

    let (status, body) = server.get("/api/metrics/api-tests?limit=abc&offset=xyz").await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 3);
}

#[tokio::test]
async fn test_malformed_body_is_internal_error() {
    let server = TestServer::start(Some(API_KEY)).await;
    let resp = server
        .client
        .post(server.url("/api/metrics/api-tests"))
        .bearer_auth(API_KEY)
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Internal Server Error");
    assert_eq!(body["message"], "Failed to save metrics");
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let server = TestServer::start(Some(API_KEY)).await;
    let resp = server
        .client
        .get(server.url("/api/metrics/unit-tests"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Not Found");
    assert_eq!(body["message"], "Route GET /api/metrics/unit-tests not found");
}

#[tokio::test]
async fn test_failed_api_run_with_retries() {
    let server = TestServer::start(Some(API_KEY)).await;
    let payload = json!({
        "testId": "api-create-issue",
        "testName": "creates an issue",
        "timestamp": "2024-05-01T11:00:00Z",
        "status": "failed",
        "retryCount": 2,
        "duration": 600,
        "apiCalls": [
            {"endpoint": "/issues", "method": "POST", "statusCode": 500, "responseTime": 450}
        ],
        "error": {
            "message": "Expected 201, got 500",
            "apiError": {"endpoint": "/issues", "statusCode": 500, "errorBody": "{}"}
        }
    });

    let (status, receipt) = server.post("/api/metrics/api-tests", &payload).await;
    assert_eq!(status, 201);
    assert_eq!(receipt["status"], "failed");

    let (_, body) = server.get("/api/metrics/api-tests").await;
    let metric = &body["metrics"][0];
    assert_eq!(metric["status"], "failed");
    assert_eq!(metric["retryCount"], 2);
    assert_eq!(metric["totalApiTime"], 450);
    assert_eq!(metric["averageResponseTime"], 450);
    assert_eq!(metric["slowestCall"]["endpoint"], "/issues");
    assert_eq!(metric["slowestCall"]["duration"], 450);
    assert_eq!(metric["error"]["apiError"]["statusCode"], 500);

    let (_, body) = server.get("/api/metrics/summary").await;
    assert_eq!(body["summary"]["totalApiMetrics"], 1);
    assert_eq!(body["summary"]["latestApiPassRate"], 0);
}

#[tokio::test]
async fn test_fractional_response_time_is_kept_exactly() {
    let server = TestServer::start(Some(API_KEY)).await;
    let mut payload = api_payload("precise", "passed");
    payload["apiCalls"][0]["responseTime"] = json!(3910713.1295714285_f64);
    let (status, _) = server.post("/api/metrics/api-tests", &payload).await;
    assert_eq!(status, 201);

    let (_, body) = server.get("/api/metrics/api-tests").await;
    let stored = body["metrics"][0]["apiCalls"][0]["responseTime"]
        .as_f64()
        .unwrap();
    assert_eq!(stored, 3910713.1295714285_f64);
}

#[tokio::test]
async fn test_flaky_api_run_is_stored_as_failed() {
    let server = TestServer::start(Some(API_KEY)).await;
    let (status, receipt) = server
        .post("/api/metrics/api-tests", &api_payload("retried", "flaky"))
        .await;
    assert_eq!(status, 201);
    assert_eq!(receipt["status"], "failed");
}
