//! Shared test utilities
//!
//! Hardware and network stand-ins: an in-memory audio backend that counts
//! open input streams, a scorer that fires on demand, and a connector whose
//! connections are driven from the test.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use visor_assistant::session::{ClientEvent, Connection, Connector};
use visor_assistant::voice::{
    AudioBackend, AudioFrame, InputDevice, KeywordScore, KeywordScorer, OutputDevice,
};
use visor_assistant::{Error, Result};

/// How long tests wait for an asynchronous outcome
pub const WAIT: Duration = Duration::from_secs(5);

/// Generate a PCM16 sine wave
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn sine(frequency: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<i16> {
    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin() * 32767.0) as i16
        })
        .collect()
}

#[derive(Default)]
struct Counters {
    open_inputs: AtomicUsize,
    max_open_inputs: AtomicUsize,
    input_opens: AtomicUsize,
    output_opens: AtomicUsize,
    reads: AtomicUsize,
}

/// In-memory audio backend
///
/// Inputs produce a quiet tone in real time; outputs record what they play.
#[derive(Clone)]
pub struct MockBackend {
    input_rates: Vec<u32>,
    output_rates: Vec<u32>,
    read_time: Option<Duration>,
    failing_reads: bool,
    counters: Arc<Counters>,
    played: Arc<Mutex<Vec<i16>>>,
}

impl MockBackend {
    /// Backend accepting only the given rates
    pub fn new(input_rates: &[u32], output_rates: &[u32]) -> Self {
        Self {
            input_rates: input_rates.to_vec(),
            output_rates: output_rates.to_vec(),
            read_time: None,
            failing_reads: false,
            counters: Arc::new(Counters::default()),
            played: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Backend accepting the common hardware rates
    pub fn permissive() -> Self {
        Self::new(&[16_000, 24_000, 44_100, 48_000], &[24_000, 44_100, 48_000])
    }

    /// Every input read blocks for `read_time` instead of one frame
    #[must_use]
    pub fn with_read_time(mut self, read_time: Duration) -> Self {
        self.read_time = Some(read_time);
        self
    }

    /// Every input read fails at once
    #[must_use]
    pub fn failing_reads(mut self) -> Self {
        self.failing_reads = true;
        self
    }

    /// Input reads attempted so far
    pub fn reads(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    /// Input streams currently open
    pub fn open_inputs(&self) -> usize {
        self.counters.open_inputs.load(Ordering::SeqCst)
    }

    /// Most input streams ever open at once
    pub fn max_open_inputs(&self) -> usize {
        self.counters.max_open_inputs.load(Ordering::SeqCst)
    }

    /// Successful input opens so far
    pub fn input_opens(&self) -> usize {
        self.counters.input_opens.load(Ordering::SeqCst)
    }

    /// Successful output opens so far
    pub fn output_opens(&self) -> usize {
        self.counters.output_opens.load(Ordering::SeqCst)
    }

    /// Samples written to any output
    pub fn played(&self) -> usize {
        self.played.lock().unwrap().len()
    }
}

impl AudioBackend for MockBackend {
    fn open_input(&self, sample_rate: u32, frame_samples: usize) -> Result<Box<dyn InputDevice>> {
        if !self.input_rates.contains(&sample_rate) {
            return Err(Error::Audio(format!("unsupported rate {sample_rate}")));
        }
        let open = self.counters.open_inputs.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open_inputs.fetch_max(open, Ordering::SeqCst);
        self.counters.input_opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockInput {
            sample_rate,
            frame: sine(440.0, sample_rate, frame_samples, 0.05),
            read_time: self.read_time,
            failing: self.failing_reads,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>> {
        if !self.output_rates.contains(&sample_rate) {
            return Err(Error::Audio(format!("unsupported rate {sample_rate}")));
        }
        self.counters.output_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockOutput {
            sample_rate,
            played: Arc::clone(&self.played),
        }))
    }
}

struct MockInput {
    sample_rate: u32,
    frame: Vec<i16>,
    read_time: Option<Duration>,
    failing: bool,
    counters: Arc<Counters>,
}

impl InputDevice for MockInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_frame(&mut self) -> Result<AudioFrame> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(Error::Audio("device disconnected".to_string()));
        }
        let read_time = self.read_time.unwrap_or_else(|| {
            let micros = self.frame.len() as u64 * 1_000_000 / u64::from(self.sample_rate);
            Duration::from_micros(micros)
        });
        std::thread::sleep(read_time);
        Ok(AudioFrame::new(self.frame.clone(), self.sample_rate))
    }
}

impl Drop for MockInput {
    fn drop(&mut self) {
        self.counters.open_inputs.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockOutput {
    sample_rate: u32,
    played: Arc<Mutex<Vec<i16>>>,
}

impl OutputDevice for MockOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.played.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }
}

/// Scorer that reports `score` for `keyword` once armed
///
/// After firing it disarms itself; scores are otherwise zero.
pub struct ScriptedScorer {
    keyword: String,
    score: f32,
    armed: Arc<AtomicBool>,
    frames: Arc<AtomicUsize>,
}

impl ScriptedScorer {
    /// Create a scorer and the switch that arms it
    pub fn new(keyword: &str, score: f32) -> (Self, ScorerSwitch) {
        let armed = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicUsize::new(0));
        let scorer = Self {
            keyword: keyword.to_string(),
            score,
            armed: Arc::clone(&armed),
            frames: Arc::clone(&frames),
        };
        (scorer, ScorerSwitch { armed, frames })
    }
}

impl KeywordScorer for ScriptedScorer {
    fn score(&mut self, _samples: &[i16]) -> Vec<KeywordScore> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        let score = if self.armed.swap(false, Ordering::SeqCst) {
            self.score
        } else {
            0.0
        };
        vec![
            KeywordScore {
                keyword: self.keyword.clone(),
                score,
            },
            KeywordScore {
                keyword: "alexa".to_string(),
                score: score / 2.0,
            },
        ]
    }
}

/// Test-side control of a [`ScriptedScorer`]
#[derive(Clone)]
pub struct ScorerSwitch {
    armed: Arc<AtomicBool>,
    frames: Arc<AtomicUsize>,
}

impl ScorerSwitch {
    /// Fire on the next scored frame
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Another scorer driven by this switch
    pub fn scorer(&self, keyword: &str, score: f32) -> ScriptedScorer {
        ScriptedScorer {
            keyword: keyword.to_string(),
            score,
            armed: Arc::clone(&self.armed),
            frames: Arc::clone(&self.frames),
        }
    }

    /// Frames scored so far
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

/// Test-side end of one mock connection
pub struct MockServer {
    sent: mpsc::UnboundedReceiver<Value>,
    push: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl MockServer {
    /// Deliver a server event
    pub fn push(&self, event: &Value) {
        let _ = self.push.send(event.to_string());
    }

    /// Deliver raw text
    pub fn push_raw(&self, text: &str) {
        let _ = self.push.send(text.to_string());
    }

    /// Wait for the next client event whose type is `kind`, skipping others
    pub async fn expect(&mut self, kind: &str) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.sent.recv().await.expect("client hung up");
                if event["type"] == kind {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {kind} within {WAIT:?}"))
    }

    /// Collect client events up to and including the first of type `kind`
    pub async fn collect_until(&mut self, kind: &str) -> Vec<Value> {
        tokio::time::timeout(WAIT, async {
            let mut events = Vec::new();
            loop {
                let event = self.sent.recv().await.expect("client hung up");
                let done = event["type"] == kind;
                events.push(event);
                if done {
                    return events;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {kind} within {WAIT:?}"))
    }

    /// Wait for `session.update` and acknowledge it
    pub async fn accept_session(&mut self) -> Value {
        let update = self.expect("session.update").await;
        self.push(&serde_json::json!({ "type": "session.updated", "session": {} }));
        update
    }

    /// Wait for the dismissal acknowledgement: a user text turn asking for
    /// `phrase`, then a spoken reply without instructions
    pub async fn expect_acknowledgement(&mut self, phrase: &str) {
        let turn = loop {
            let item = self.expect("conversation.item.create").await;
            if item["item"]["type"] == "message" {
                break item;
            }
        };
        assert_eq!(turn["item"]["role"], "user");
        let text = turn["item"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains(phrase), "acknowledgement text: {text}");

        let reply = self.expect("response.create").await;
        assert_eq!(reply["response"]["modalities"], serde_json::json!(["text", "audio"]));
        assert!(reply["response"]["instructions"].is_null());
    }

    /// Everything the client has sent so far
    pub fn drain(&mut self) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(event) = self.sent.try_recv() {
            events.push(event);
        }
        events
    }

    /// Whether the client closed the connection
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector whose connections are handed to the test
pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    failures: Mutex<VecDeque<bool>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    /// Create a connector and the stream of server ends it produces
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers,
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next(&self, n: usize) {
        self.failures.lock().unwrap().extend(std::iter::repeat_n(true, n));
    }

    /// Connection attempts so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failures.lock().unwrap().pop_front().unwrap_or(false) {
            return Err(Error::ConnectionLost("refused".to_string()));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let _ = self.servers.send(MockServer {
            sent: sent_rx,
            push: push_tx,
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(MockConnection {
            sent: sent_tx,
            incoming: push_rx,
            closed,
        }))
    }
}

struct MockConnection {
    sent: mpsc::UnboundedSender<Value>,
    incoming: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        let value = serde_json::to_value(event)?;
        self.sent
            .send(value)
            .map_err(|_| Error::ConnectionLost("server end dropped".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.incoming.recv().await)
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
