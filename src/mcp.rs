//! MCP server implementation using rmcp.
//!
//! Exposes the execution coordinator as MCP tools, so an MCP client can act
//! as the presentation layer for snippet output.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use crate::backend::TerminalStatus;
use crate::coordinator::ExecutionCoordinator;
use crate::language::Language;
use crate::sink::BufferSink;

/// MCP server for snippet execution.
#[derive(Clone)]
pub struct RunnerServer {
    coordinator: Arc<ExecutionCoordinator>,
    next_origin: Arc<AtomicU64>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the run tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunParams {
    /// Language tag of the snippet (e.g., "python", "bash", "js").
    #[schemars(description = "Language tag of the snippet (e.g. 'python', 'bash', 'js')")]
    pub language: String,

    /// The source code to run.
    #[schemars(description = "The source code to run")]
    pub code: String,

    /// Identifier of the code block; at most one run per origin at a time.
    #[schemars(
        description = "Optional identifier of the code block; a second run for the same origin is rejected while the first is in flight"
    )]
    #[serde(default)]
    pub origin: Option<String>,
}

#[tool_router]
impl RunnerServer {
    /// Create a new runner server.
    pub fn new(coordinator: ExecutionCoordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            next_origin: Arc::new(AtomicU64::new(0)),
            tool_router: Self::tool_router(),
        }
    }

    /// Run a snippet and return its captured output.
    #[tool(description = "Run a code snippet locally or through the remote execution API")]
    async fn run(&self, Parameters(params): Parameters<RunParams>) -> Result<CallToolResult, McpError> {
        let language = Language::from_tag(&params.language).ok_or_else(|| {
            let supported: Vec<_> = Language::ALL.iter().map(|l| l.as_str()).collect();
            McpError::invalid_params(
                format!("Unsupported language: '{}'. Supported: {supported:?}", params.language),
                None,
            )
        })?;

        // Generated origins are never queried again, so their state is dropped.
        let (origin, generated) = match params.origin {
            Some(origin) => (origin, false),
            None => (format!("mcp-{}", self.next_origin.fetch_add(1, Ordering::Relaxed)), true),
        };

        info!(%language, %origin, code_len = params.code.len(), "Running snippet");

        let mut sink = BufferSink::new();
        let report = self
            .coordinator
            .submit(&origin, language.as_str(), &params.code, &mut sink)
            .await
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        if generated {
            self.coordinator.forget(&origin);
        }

        // Combine stdout/stderr
        let stdout = sink.stdout();
        let stderr = sink.stderr();
        let output = if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{stdout}\n--- stderr ---\n{stderr}")
        };

        match report.status {
            TerminalStatus::Succeeded => Ok(CallToolResult::success(vec![Content::text(output)])),
            TerminalStatus::Failed => Ok(CallToolResult::error(vec![Content::text(output)])),
        }
    }

    /// List supported languages and how each one would run.
    #[tool(description = "List supported languages and the strategy each one runs with")]
    async fn languages(&self) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::success(vec![Content::text(
            self.language_table(),
        )]))
    }

    fn language_table(&self) -> String {
        let mut table = String::new();
        for lang in Language::ALL {
            let line = match self.coordinator.strategy_for(lang) {
                Ok(strategy) => format!("{lang}: {strategy}"),
                Err(e) => format!("{lang}: unavailable ({e})"),
            };
            let _ = writeln!(table, "{line}");
        }
        table
    }
}

#[tool_handler]
impl ServerHandler for RunnerServer {
    fn get_info(&self) -> ServerInfo {
        let langs: Vec<_> = Language::ALL.iter().map(|l| l.as_str()).collect();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "snippet-runner".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Run code snippets with a local toolchain or a remote execution API.\n\
                 Supported languages: {langs:?}\n\
                 \n\
                 Use the 'run' tool with:\n\
                 - language: one of {langs:?}\n\
                 - code: the code to run\n\
                 - origin (optional): code block identifier\n\
                 \n\
                 Use the 'languages' tool to see how each language runs."
            )),
        }
    }
}

/// Serve the runner over stdio.
pub async fn serve_stdio(coordinator: ExecutionCoordinator) -> anyhow::Result<()> {
    let server = RunnerServer::new(coordinator);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
