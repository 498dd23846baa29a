//! Tools callable by the realtime model
//!
//! - `web_search`: Brave or Serper search
//! - `get_system_status`: CPU, memory, and sensor telemetry
//! - `start_recording` / `stop_recording` / `get_recording_status`: external
//!   capture command

mod dispatcher;
mod recorder;
mod search;
mod telemetry;

pub use dispatcher::{ToolCall, ToolDispatcher, ToolResult};
pub use recorder::{CommandRecorder, OUTPUT_PLACEHOLDER, Recorder, RecordingStatus};
pub use search::{SearchProvider, SearchResult, WebSearchTool, format_results};
pub use telemetry::{SystemTelemetry, Telemetry, TelemetrySnapshot};
