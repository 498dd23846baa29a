//! Dispatch of model-initiated function calls
//!
//! Every call completes with exactly one [`ToolResult`]. Failures, missing
//! collaborators, and timeouts become error-flagged text for the model to
//! relay; nothing here touches session state.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use super::recorder::Recorder;
use super::search::{WebSearchTool, format_results};
use super::telemetry::Telemetry;

/// Results requested from the search provider
const SEARCH_LIMIT: usize = 5;

/// A function call requested by the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Correlates the result with the request
    pub call_id: String,
    /// Tool name
    pub name: String,
    /// Decoded arguments
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// Build a call from the wire form, where arguments are a JSON string
    ///
    /// Malformed or non-object arguments decode as an empty map.
    #[must_use]
    pub fn from_wire(call_id: impl Into<String>, name: impl Into<String>, arguments: &str) -> Self {
        let name = name.into();
        let arguments = match serde_json::from_str::<Value>(arguments) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) if arguments.trim().is_empty() => Map::new(),
            Ok(other) => {
                tracing::warn!(tool = %name, arguments = %other, "tool arguments are not an object");
                Map::new()
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool arguments are not valid JSON");
                Map::new()
            }
        };
        Self {
            call_id: call_id.into(),
            name,
            arguments,
        }
    }

    fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn u64_arg(&self, key: &str) -> Option<u64> {
        self.arguments.get(key).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
        })
    }
}

/// Outcome of a tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Call this answers
    pub call_id: String,
    /// Text relayed to the model
    pub text: String,
    /// Whether the tool failed
    pub is_error: bool,
}

impl ToolResult {
    fn ok(call_id: &str, text: impl Into<String>) -> Self {
        Self {
            call_id: call_id.to_string(),
            text: text.into(),
            is_error: false,
        }
    }

    fn error(call_id: &str, text: impl Into<String>) -> Self {
        Self {
            call_id: call_id.to_string(),
            text: text.into(),
            is_error: true,
        }
    }
}

/// Routes tool calls to their collaborators
pub struct ToolDispatcher {
    search: Option<WebSearchTool>,
    telemetry: Option<Arc<dyn Telemetry>>,
    recorder: Option<Arc<dyn Recorder>>,
    timeout: Duration,
}

impl ToolDispatcher {
    /// Dispatcher with no collaborators; calls give up after `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            search: None,
            telemetry: None,
            recorder: None,
            timeout,
        }
    }

    /// Attach a web search provider
    #[must_use]
    pub fn with_search(mut self, search: WebSearchTool) -> Self {
        self.search = Some(search);
        self
    }

    /// Attach a telemetry source
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Attach a recorder
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Execute `call`, always producing a result for its `call_id`
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        tracing::info!(tool = %call.name, call_id = %call.call_id, "executing tool");

        let result = match tokio::time::timeout(self.timeout, self.run(call)).await {
            Ok(result) => result,
            Err(_) => ToolResult::error(
                &call.call_id,
                format!("{} timed out after {} seconds.", call.name, self.timeout.as_secs()),
            ),
        };

        if result.is_error {
            tracing::warn!(tool = %call.name, text = %result.text, "tool failed");
        } else {
            tracing::debug!(tool = %call.name, len = result.text.len(), "tool finished");
        }
        result
    }

    async fn run(&self, call: &ToolCall) -> ToolResult {
        let id = call.call_id.as_str();
        match call.name.as_str() {
            "web_search" => self.web_search(call).await,
            "get_system_status" => self.system_status(id).await,
            "start_recording" => {
                let duration = call.u64_arg("duration_seconds").filter(|s| *s > 0);
                self.start_recording(id, duration).await
            }
            "stop_recording" => self.stop_recording(id).await,
            "get_recording_status" => self.recording_status(id).await,
            other => ToolResult::error(id, format!("Unknown tool: {other}")),
        }
    }

    async fn web_search(&self, call: &ToolCall) -> ToolResult {
        let id = call.call_id.as_str();
        let Some(search) = self.search.as_ref() else {
            return ToolResult::error(id, "Web search not available.");
        };
        let query = call.str_arg("query").unwrap_or_default().trim();
        if query.is_empty() {
            return ToolResult::error(id, "No search query provided.");
        }

        match search.search(query, SEARCH_LIMIT).await {
            Ok(results) => ToolResult::ok(id, format_results(query, &results)),
            Err(e) => ToolResult::error(id, format!("Search failed: {e}")),
        }
    }

    async fn system_status(&self, id: &str) -> ToolResult {
        let Some(telemetry) = self.telemetry.as_ref() else {
            return ToolResult::error(id, "System monitor not available.");
        };
        match telemetry.snapshot().await {
            Ok(snapshot) => ToolResult::ok(id, snapshot.report()),
            Err(e) => ToolResult::error(id, format!("Status check failed: {e}")),
        }
    }

    async fn start_recording(&self, id: &str, duration_secs: Option<u64>) -> ToolResult {
        let Some(recorder) = self.recorder.as_ref() else {
            return ToolResult::error(id, "Video recorder not available.");
        };
        if recorder.status().await.active {
            return ToolResult::ok(id, "Already recording.");
        }

        match recorder.start(duration_secs.map(Duration::from_secs)).await {
            Ok(path) => {
                let file = path.display();
                let text = match duration_secs {
                    Some(secs) => format!("Recording started for {secs} seconds. File: {file}"),
                    None => format!("Recording started. Say 'stop recording' when done. File: {file}"),
                };
                ToolResult::ok(id, text)
            }
            Err(e) => ToolResult::error(id, format!("Failed to start recording: {e}")),
        }
    }

    async fn stop_recording(&self, id: &str) -> ToolResult {
        let Some(recorder) = self.recorder.as_ref() else {
            return ToolResult::error(id, "Video recorder not available.");
        };
        if !recorder.status().await.active {
            return ToolResult::ok(id, "Not currently recording.");
        }

        match recorder.stop().await {
            Ok(path) => ToolResult::ok(id, format!("Recording stopped. Saved to {}", path.display())),
            Err(e) => ToolResult::error(id, format!("Failed to stop recording: {e}")),
        }
    }

    async fn recording_status(&self, id: &str) -> ToolResult {
        let Some(recorder) = self.recorder.as_ref() else {
            return ToolResult::error(id, "Video recorder not available.");
        };
        ToolResult::ok(id, recorder.status().await.report())
    }

    /// Function tool schemas declared in `session.update`
    #[must_use]
    pub fn descriptors() -> Vec<Value> {
        vec![
            json!({
                "type": "function",
                "name": "web_search",
                "description": "Search the internet for current information, news, weather, facts, or any real-time data. Use this whenever you need up-to-date information you don't have.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "The search query"}
                    },
                    "required": ["query"]
                }
            }),
            json!({
                "type": "function",
                "name": "get_system_status",
                "description": "Get current system status including CPU usage, GPU usage, temperatures, RAM usage, and power consumption. Use this when the operator asks about system health, performance, temperatures, or resource usage.",
                "parameters": {"type": "object", "properties": {}}
            }),
            json!({
                "type": "function",
                "name": "start_recording",
                "description": "Start video recording. Records until stopped or the duration limit is reached. Use when the operator says 'start recording', 'record video', 'begin recording', etc.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "duration_seconds": {
                            "type": "integer",
                            "description": "Optional duration in seconds. If not specified, records until manually stopped."
                        }
                    }
                }
            }),
            json!({
                "type": "function",
                "name": "stop_recording",
                "description": "Stop the current video recording and save the file. Use when the operator says 'stop recording', 'end recording', 'save recording', etc.",
                "parameters": {"type": "object", "properties": {}}
            }),
            json!({
                "type": "function",
                "name": "get_recording_status",
                "description": "Check whether a recording is in progress and how long it has been running. Use when the operator asks 'are you recording', 'recording status', etc.",
                "parameters": {"type": "object", "properties": {}}
            }),
        ]
    }
}
