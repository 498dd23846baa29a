//! Recording collaborator driving an external capture command

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::{Error, Result};

/// How long a stopped capture process gets to finalize its file
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Placeholder replaced by the output path in the capture command
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Current state of the recorder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingStatus {
    /// Whether a recording is in progress
    pub active: bool,
    /// Time since the recording started
    pub elapsed: Duration,
    /// Limit requested at start, if any
    pub max_duration: Option<Duration>,
    /// File being written
    pub path: Option<PathBuf>,
}

impl RecordingStatus {
    /// Spoken status line
    #[must_use]
    pub fn report(&self) -> String {
        if !self.active {
            return "Not currently recording".to_string();
        }
        let mut status = format!("Currently recording: {:.1} seconds", self.elapsed.as_secs_f64());
        if let Some(max) = self.max_duration {
            let remaining = max.saturating_sub(self.elapsed);
            status.push_str(&format!(", {} seconds remaining", remaining.as_secs()));
        }
        status
    }
}

/// Video recording collaborator
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Start recording, optionally stopping after `duration`
    ///
    /// # Errors
    ///
    /// Returns error if the capture cannot start
    async fn start(&self, duration: Option<Duration>) -> Result<PathBuf>;

    /// Stop the current recording and return the saved file
    ///
    /// # Errors
    ///
    /// Returns error if nothing is recording or the capture fails to stop
    async fn stop(&self) -> Result<PathBuf>;

    /// Current status
    async fn status(&self) -> RecordingStatus;
}

struct ActiveRecording {
    child: Child,
    path: PathBuf,
    started: Instant,
    max_duration: Option<Duration>,
    generation: u64,
}

#[derive(Default)]
struct RecorderState {
    active: Option<ActiveRecording>,
    generation: u64,
}

/// Runs a capture command (e.g. ffmpeg) as a child process per recording
///
/// The command's arguments may contain `{output}`, which is replaced by a
/// timestamped path under the output directory.
#[derive(Clone)]
pub struct CommandRecorder {
    program: String,
    args: Vec<String>,
    output_dir: PathBuf,
    extension: String,
    state: Arc<Mutex<RecorderState>>,
}

impl CommandRecorder {
    /// Create a recorder from `command` (program followed by arguments)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `command` is empty
    pub fn new(command: &[String], output_dir: impl Into<PathBuf>, extension: &str) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Config("recorder command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            output_dir: output_dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
            state: Arc::new(Mutex::new(RecorderState::default())),
        })
    }

    fn next_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        self.output_dir
            .join(format!("recording_{stamp}.{}", self.extension))
    }

    fn command_for(&self, path: &Path) -> Command {
        let output = path.to_string_lossy();
        let mut command = Command::new(&self.program);
        command
            .args(self.args.iter().map(|a| a.replace(OUTPUT_PLACEHOLDER, &output)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }

    fn schedule_limit(&self, generation: u64, limit: Duration) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let expired = {
                let mut state = state.lock().await;
                if state.active.as_ref().is_some_and(|a| a.generation == generation) {
                    state.active.take()
                } else {
                    None
                }
            };
            if let Some(recording) = expired {
                tracing::info!(path = %recording.path.display(), "recording duration limit reached");
                finish(recording).await;
            }
        });
    }
}

/// Ask the capture process to finish, killing it if it does not exit in time
async fn finish(mut recording: ActiveRecording) -> PathBuf {
    if let Some(mut stdin) = recording.child.stdin.take() {
        let _ = stdin.write_all(b"q\n").await;
    }
    match tokio::time::timeout(STOP_GRACE, recording.child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(%status, "capture process exited"),
        Ok(Err(e)) => tracing::warn!(error = %e, "capture process wait failed"),
        Err(_) => {
            tracing::warn!("capture process did not exit, killing");
            let _ = recording.child.kill().await;
        }
    }
    recording.path
}

#[async_trait]
impl Recorder for CommandRecorder {
    async fn start(&self, duration: Option<Duration>) -> Result<PathBuf> {
        let mut state = self.state.lock().await;
        reap(&mut state);
        if state.active.is_some() {
            return Err(Error::Tool("already recording".to_string()));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.next_path();
        let child = self.command_for(&path).spawn()?;

        state.generation += 1;
        let generation = state.generation;
        state.active = Some(ActiveRecording {
            child,
            path: path.clone(),
            started: Instant::now(),
            max_duration: duration,
            generation,
        });
        drop(state);

        if let Some(limit) = duration {
            self.schedule_limit(generation, limit);
        }

        tracing::info!(path = %path.display(), ?duration, "recording started");
        Ok(path)
    }

    async fn stop(&self) -> Result<PathBuf> {
        let recording = {
            let mut state = self.state.lock().await;
            reap(&mut state);
            state
                .active
                .take()
                .ok_or_else(|| Error::Tool("not recording".to_string()))?
        };
        let path = finish(recording).await;
        tracing::info!(path = %path.display(), "recording stopped");
        Ok(path)
    }

    async fn status(&self) -> RecordingStatus {
        let mut state = self.state.lock().await;
        reap(&mut state);
        state
            .active
            .as_ref()
            .map_or_else(RecordingStatus::default, |a| RecordingStatus {
                active: true,
                elapsed: a.started.elapsed(),
                max_duration: a.max_duration,
                path: Some(a.path.clone()),
            })
    }
}

/// Forget a recording whose process already exited on its own
fn reap(state: &mut RecorderState) {
    let exited = state
        .active
        .as_mut()
        .is_some_and(|a| !matches!(a.child.try_wait(), Ok(None)));
    if exited && let Some(recording) = state.active.take() {
        tracing::warn!(path = %recording.path.display(), "capture process exited unexpectedly");
    }
}
