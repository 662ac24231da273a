// 集成测试用的本地假服务：同时扮演分析 API 与 Sheets API，并记录收到的请求。
#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LEARNERS_CSV: &str = "user_id,username,name,email\n7,ada,Jos\u{e9} Ada,ada@example.com\n";
pub const PROBLEMS_CSV: &str =
    "user_id,problem,answer\n7,p1,007\n8,p1,\"a, b\"\n";
pub const DOWNLOAD_PATH: &str = "/downloads/problem_responses.csv";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub accept: Option<String>,
    pub body: Option<Value>,
}

#[derive(Clone)]
pub struct FakeBehavior {
    pub learner_status: StatusCode,
    pub problem_report: Option<Value>,
    pub sheets_failure: Option<(StatusCode, String)>,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            learner_status: StatusCode::OK,
            problem_report: None,
            sheets_failure: None,
        }
    }
}

#[derive(Clone)]
struct FakeState {
    base_url: String,
    behavior: FakeBehavior,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

pub struct FakeServices {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    server: tokio::task::JoinHandle<()>,
}

impl FakeServices {
    pub async fn start(behavior: FakeBehavior) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = FakeState {
            base_url: base_url.clone(),
            behavior,
            requests: requests.clone(),
        };
        let app = Router::new().fallback(handle).with_state(state);
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url,
            requests,
            server,
        }
    }

    /// 延迟后才在指定端口上监听，模拟 ssh 建好转发后才出现的本地端口。
    pub fn start_after(behavior: FakeBehavior, port: u16, delay: Duration) -> Self {
        let base_url = format!("http://127.0.0.1:{port}");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = FakeState {
            base_url: base_url.clone(),
            behavior,
            requests: requests.clone(),
        };
        let app = Router::new().fallback(handle).with_state(state);
        let server = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                .await
                .unwrap();
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url,
            requests,
            server,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_to(&self, path_prefix: &str) -> Option<RecordedRequest> {
        self.requests()
            .into_iter()
            .find(|request| request.path.starts_with(path_prefix))
    }

    pub fn sheets_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path.starts_with("/v4/spreadsheets/"))
            .collect()
    }
}

impl Drop for FakeServices {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle(
    State(state): State<FakeState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let path = uri.path().to_string();
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        query: uri.query().map(str::to_string),
        authorization: header("authorization"),
        accept: header("accept"),
        body: serde_json::from_slice(&body).ok(),
    });

    let behavior = &state.behavior;
    if path == "/api/v0/learners/" {
        if behavior.learner_status != StatusCode::OK {
            return (behavior.learner_status, "learner export unavailable").into_response();
        }
        return ([("content-type", "text/csv")], LEARNERS_CSV).into_response();
    }
    if path.starts_with("/api/v0/courses/") && path.ends_with("/reports/problem_response") {
        let report = behavior.problem_report.clone().unwrap_or_else(|| {
            json!({ "download_url": format!("{}{DOWNLOAD_PATH}?sig=abc", state.base_url) })
        });
        return axum::Json(report).into_response();
    }
    if path == DOWNLOAD_PATH {
        return ([("content-type", "text/csv")], PROBLEMS_CSV).into_response();
    }
    if method == Method::POST && path.starts_with("/v4/spreadsheets/") {
        if let Some((status, body)) = &behavior.sheets_failure {
            return (*status, body.clone()).into_response();
        }
        let rows = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|value| value.get("data").cloned())
            .and_then(|data| data.as_array().cloned())
            .map(|ranges| {
                ranges
                    .iter()
                    .filter_map(|range| range.get("values").and_then(Value::as_array))
                    .map(|values| values.len() as u64)
                    .sum::<u64>()
            })
            .unwrap_or(0);
        return axum::Json(json!({
            "spreadsheetId": "sheet-test",
            "totalUpdatedRows": rows,
            "totalUpdatedCells": rows * 3,
            "totalUpdatedSheets": 2,
        }))
        .into_response();
    }
    (StatusCode::NOT_FOUND, "not found").into_response()
}
