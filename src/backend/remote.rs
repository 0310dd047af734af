//! Piston remote execution backend.
//!
//! Sends the whole snippet in one request and gets one complete result back.
//! Nothing is streamed; the coordinator writes the output once the response
//! arrives.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ExecutionResult, RemoteExecutor};
use crate::error::ExecutionError;

/// HTTP client for a Piston v2 API.
#[derive(Debug, Clone)]
pub struct PistonClient {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: [SourceFile<'a>; 1],
}

#[derive(Debug, Serialize)]
struct SourceFile<'a> {
    content: &'a str,
}

/// Body Piston sends with a 4xx answer.
#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

/// Result of a remote execution.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteResponse {
    pub language: String,
    pub version: String,
    /// Present for compiled languages.
    #[serde(default)]
    pub compile: Option<RemoteRun>,
    /// Missing when compilation failed.
    #[serde(default)]
    pub run: RemoteRun,
}

/// One stage (compile or run) of a remote execution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteRun {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Exit code; null when the program was killed.
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub signal: Option<Signal>,
    /// stdout and stderr interleaved as the program produced them.
    #[serde(default)]
    pub output: String,
}

/// Piston reports signals by name; some deployments send the number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Signal {
    Name(String),
    Number(i32),
}

impl RemoteResponse {
    /// The compile stage, if it ran and failed.
    pub fn failed_compile(&self) -> Option<&RemoteRun> {
        self.compile.as_ref().filter(|c| c.code != Some(0))
    }

    /// Map the response onto the local result shape.
    pub fn to_result(&self) -> (ExecutionResult, Option<ExecutionError>) {
        if let Some(compile) = self.failed_compile() {
            let result = ExecutionResult {
                exit_code: compile.code,
                stdout: compile.stdout.clone(),
                stderr: compile.stderr.clone(),
            };
            return (
                result,
                Some(ExecutionError::Runtime(format!(
                    "Compilation failed{}",
                    compile.code.map(|c| format!(" with code {c}")).unwrap_or_default()
                ))),
            );
        }

        let result = ExecutionResult {
            exit_code: self.run.code,
            stdout: self.run.stdout.clone(),
            stderr: self.run.stderr.clone(),
        };
        let error = match (self.run.code, &self.run.signal) {
            (Some(0), _) => None,
            (Some(code), _) => Some(ExecutionError::NonZeroExit(code)),
            (None, Some(Signal::Number(n))) => Some(ExecutionError::Signal(Some(*n))),
            (None, _) => Some(ExecutionError::Signal(None)),
        };
        (result, error)
    }
}

/// A language runtime offered by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Runtime {
    pub language: String,
    pub version: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl PistonClient {
    /// Create a client for `endpoint`, e.g. `https://emkc.org/api/v2/piston`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// List the runtimes the API offers, giving up after `timeout`.
    pub async fn runtimes(&self, timeout: Duration) -> Result<Vec<Runtime>, ExecutionError> {
        let url = format!("{}/runtimes", self.endpoint);
        let resp = self.client.get(&url).timeout(timeout).send().await?;
        let resp = check_status(resp).await?;
        resp.json::<Vec<Runtime>>()
            .await
            .map_err(|e| ExecutionError::Network(format!("Malformed runtimes response: {e}")))
    }
}

#[async_trait]
impl RemoteExecutor for PistonClient {
    async fn execute(&self, language: &str, source: &str) -> Result<RemoteResponse, ExecutionError> {
        let url = format!("{}/execute", self.endpoint);
        debug!(%url, %language, code_len = source.len(), "Sending remote execution request");

        let body = ExecuteRequest {
            language,
            version: "*",
            files: [SourceFile { content: source }],
        };

        let resp = self.client.post(&url).json(&body).send().await?;
        let resp = check_status(resp).await?;
        let parsed = resp
            .json::<RemoteResponse>()
            .await
            .map_err(|e| ExecutionError::Network(format!("Malformed execution response: {e}")))?;

        debug!(language = %parsed.language, version = %parsed.version, code = ?parsed.run.code, "Remote execution finished");
        Ok(parsed)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ExecutionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ApiMessage>(&body)
        .map(|m| m.message)
        .unwrap_or(body);
    Err(ExecutionError::Network(format!("{status}: {detail}")))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::*;

    type Recorded = Arc<Mutex<Vec<Value>>>;

    async fn execute_handler(
        State(recorded): State<Recorded>,
        Json(body): Json<Value>,
    ) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
        recorded.lock().unwrap().push(body.clone());

        match body["language"].as_str() {
            Some("python") => Ok(Json(json!({
                "language": "python",
                "version": "3.10.0",
                "run": { "stdout": "42\n", "stderr": "", "code": 0, "signal": null, "output": "42\n" }
            }))),
            Some("c++") => Ok(Json(json!({
                "language": "c++",
                "version": "10.2.0",
                "compile": { "stdout": "", "stderr": "error: expected ';'\n", "code": 1, "signal": null, "output": "error: expected ';'\n" }
            }))),
            Some("bash") => Ok(Json(json!({
                "language": "bash",
                "version": "5.2.0",
                "run": { "stdout": "", "stderr": "", "code": null, "signal": "SIGKILL", "output": "" }
            }))),
            Some("garbage") => Ok(Json(json!({ "unexpected": true, "run": "nope" }))),
            _ => Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": "runtime is unknown" })),
            )),
        }
    }

    async fn runtimes_handler() -> Json<Value> {
        Json(json!([
            { "language": "python", "version": "3.10.0", "aliases": ["py", "py3"] },
            { "language": "bash", "version": "5.2.0", "aliases": ["sh"] }
        ]))
    }

    async fn stalled_handler() -> Json<Value> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Json(json!([]))
    }

    async fn start_mock() -> (SocketAddr, Recorded) {
        let recorded: Recorded = Arc::default();
        let app = Router::new()
            .route("/api/v2/execute", post(execute_handler))
            .route("/api/v2/runtimes", get(runtimes_handler))
            .route("/stalled/runtimes", get(stalled_handler))
            .with_state(Arc::clone(&recorded));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, recorded)
    }

    fn client(addr: SocketAddr) -> PistonClient {
        PistonClient::new(format!("http://{addr}/api/v2/"))
    }

    #[tokio::test]
    async fn execute_posts_piston_request() {
        let (addr, recorded) = start_mock().await;

        let resp = client(addr).execute("python", "print(42)").await.unwrap();
        assert_eq!(resp.run.code, Some(0));
        assert_eq!(resp.run.output, "42\n");

        let (result, error) = resp.to_result();
        assert!(error.is_none());
        assert_eq!(result.stdout, "42\n");

        let bodies = recorded.lock().unwrap().clone();
        assert_eq!(
            bodies,
            vec![json!({ "language": "python", "version": "*", "files": [{ "content": "print(42)" }] })]
        );
    }

    #[tokio::test]
    async fn api_error_message_is_surfaced() {
        let (addr, _) = start_mock().await;

        let err = client(addr).execute("cobol", "DISPLAY 'HI'").await.unwrap_err();
        assert_eq!(err.kind(), "network");
        assert!(err.to_string().contains("runtime is unknown"), "{err}");
    }

    #[tokio::test]
    async fn malformed_body_is_a_network_error() {
        let (addr, _) = start_mock().await;

        let err = client(addr).execute("garbage", "").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Network(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(addr).execute("python", "print(1)").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Network(_)));
    }

    #[tokio::test]
    async fn failed_compile_maps_to_runtime_error() {
        let (addr, _) = start_mock().await;

        let resp = client(addr).execute("c++", "int main() {}").await.unwrap();
        let (result, error) = resp.to_result();
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.stderr, "error: expected ';'\n");
        assert!(matches!(error, Some(ExecutionError::Runtime(_))));
    }

    #[tokio::test]
    async fn killed_run_has_no_exit_code() {
        let (addr, _) = start_mock().await;

        let resp = client(addr).execute("bash", "sleep 100").await.unwrap();
        assert_eq!(resp.run.signal, Some(Signal::Name("SIGKILL".into())));
        let (result, error) = resp.to_result();
        assert_eq!(result.exit_code, None);
        assert!(matches!(error, Some(ExecutionError::Signal(None))));
    }

    #[tokio::test]
    async fn runtimes_are_listed() {
        let (addr, _) = start_mock().await;

        let runtimes = client(addr).runtimes(Duration::from_secs(5)).await.unwrap();
        assert_eq!(runtimes.len(), 2);
        assert_eq!(runtimes[0].language, "python");
        assert_eq!(runtimes[1].aliases, vec!["sh"]);
    }

    #[tokio::test]
    async fn stalled_runtimes_request_times_out() {
        let (addr, _) = start_mock().await;
        let started = std::time::Instant::now();

        let err = PistonClient::new(format!("http://{addr}/stalled"))
            .runtimes(Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Network(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
