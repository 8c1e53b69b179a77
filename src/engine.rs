use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use image::RgbaImage;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = r#"You are a desktop assistant that automates tasks by analyzing screenshots with numbered UI elements. Before deciding anything, examine the screenshot and the parsed content of each numbered element to understand the current state of the screen.

IMPORTANT: Every clickable element in the screenshot is labeled with a number (e.g., [0], [1], [2]). Respond with the NUMBER of the element to interact with, exactly as listed under AVAILABLE ELEMENTS below. Labels drawn on the image can crowd together when boxes overlap, so always verify your choice against the parsed content of each element. To open a program, desktop icon, or folder you need to DOUBLE click it.

RESPONSE FORMAT:
Respond with ONLY a valid JSON object:
{
  "steps": [
    {
      "type": "click" | "keyboard" | "scroll" | "wait_and_send_image" | "ask_question" | "end",
      ... additional fields based on type ...
    }
  ]
}

STEP TYPES:

1. "click" - Click a numbered element
   { "type": "click", "element_number": 5, "double_click": false, "description": "Click the browser icon" }
   - element_number: the number of the element as listed below
   - double_click: true for opening apps, false otherwise

2. "keyboard" - Type text (must be preceded by a click that focuses an input)
   { "type": "keyboard", "content": "rainy day playlist", "element_number": 3, "description": "Type search query" }
   - content: text to type; use "{ENTER}", "{TAB}" or "{BACKSPACE}" to press that key on its own

3. "scroll" - Scroll the page
   { "type": "scroll", "magnitude": -3, "description": "Scroll down" }
   - magnitude: negative for down, positive for up

4. "wait_and_send_image" - Wait for the screen to settle and capture a new screenshot
   { "type": "wait_and_send_image", "description": "Wait for the page to load and analyze the next state" }

5. "ask_question" - Ask the user for clarification
   { "type": "ask_question", "question": "Which browser should I open?", "description": "Need user input" }

6. "end" - Task completed
   { "type": "end", "message": "Successfully completed the task", "description": "Task complete" }

RULES:
1. Element numbers are 0-based and must match the AVAILABLE ELEMENTS listing exactly.
2. You may chain several steps before a "wait_and_send_image" when you are sure the screen will not change in between.
3. ALWAYS end your steps array with "wait_and_send_image", "ask_question" or "end".
4. Response must be ONLY valid JSON.
5. If you keep performing the same action without progress, try a different approach; if that also fails, ask the user with "ask_question".
6. Never invent personal information for the user; request it with "ask_question" instead."#;

// ========================= Core Types =========================

/// A single action planned by the language model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Click {
        element_number: i64,
        #[serde(default)]
        double_click: bool,
        #[serde(default)]
        description: String,
    },
    Keyboard {
        content: String,
        #[serde(default)]
        element_number: Option<i64>,
        #[serde(default)]
        description: String,
    },
    Scroll {
        magnitude: i64,
        #[serde(default)]
        description: String,
    },
    WaitAndSendImage {
        #[serde(default)]
        description: String,
    },
    AskQuestion {
        question: String,
        #[serde(default)]
        description: String,
    },
    End {
        message: String,
        #[serde(default)]
        description: String,
    },
    /// Anything the model invents that we do not recognize. Skipped at
    /// dispatch so one bad step never sinks the rest of the plan.
    #[serde(other)]
    Unknown,
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Click { .. } => "click",
            Step::Keyboard { .. } => "keyboard",
            Step::Scroll { .. } => "scroll",
            Step::WaitAndSendImage { .. } => "wait_and_send_image",
            Step::AskQuestion { .. } => "ask_question",
            Step::End { .. } => "end",
            Step::Unknown => "unknown",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Step::Click { description, .. }
            | Step::Keyboard { description, .. }
            | Step::Scroll { description, .. }
            | Step::WaitAndSendImage { description }
            | Step::AskQuestion { description, .. }
            | Step::End { description, .. } => description,
            Step::Unknown => "no description",
        }
    }
}

/// One interactive region reported by the element-parser service. The service
/// answers either with a structured record (normalized bounding box plus a
/// text description) or, from older deployments, with a bare string carrying
/// an embedded `<box>x1,y1,x2,y2</box>` tag in absolute pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParsedElement {
    Detected {
        bbox: [f64; 4],
        #[serde(default)]
        content: String,
    },
    Legacy(String),
}

impl ParsedElement {
    /// Text shown to the model next to the element's index.
    pub fn describe(&self) -> &str {
        match self {
            ParsedElement::Detected { content, .. } => content,
            ParsedElement::Legacy(text) => text,
        }
    }

    /// Midpoint of the element in absolute screen pixels.
    pub fn resolve_center(&self, screen_w: u32, screen_h: u32) -> Result<(i32, i32)> {
        match self {
            ParsedElement::Detected { bbox, .. } => {
                let [x1, y1, x2, y2] = *bbox;
                let cx = (x1 + x2) / 2.0 * screen_w as f64;
                let cy = (y1 + y2) / 2.0 * screen_h as f64;
                Ok((cx as i32, cy as i32))
            }
            ParsedElement::Legacy(text) => {
                let start = text
                    .find("<box>")
                    .map(|i| i + "<box>".len())
                    .ok_or_else(|| anyhow!("legacy element has no <box> tag: {text}"))?;
                let end = text
                    .find("</box>")
                    .ok_or_else(|| anyhow!("legacy element has no </box> tag: {text}"))?;
                let coords = text
                    .get(start..end)
                    .ok_or_else(|| anyhow!("legacy element box tag is malformed: {text}"))?;
                let parsed: Vec<f64> = coords
                    .split(',')
                    .map(|c| c.trim().parse::<f64>())
                    .collect::<Result<_, _>>()
                    .with_context(|| format!("legacy element coordinates were not numeric: {coords}"))?;
                if parsed.len() != 4 {
                    bail!("legacy element box needs 4 coordinates, got {}", parsed.len());
                }
                Ok((
                    ((parsed[0] + parsed[2]) / 2.0) as i32,
                    ((parsed[1] + parsed[3]) / 2.0) as i32,
                ))
            }
        }
    }
}

/// An owned full-screen raster capture.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbaImage,
}

impl Frame {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn png_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(self.image.clone())
            .write_to(&mut buf, image::ImageFormat::Png)
            .context("PNG encoding failed")?;
        Ok(buf.into_inner())
    }
}

/// Mean absolute per-channel RGB difference between two frames, scaled to
/// [0, 1]. Frames of different sizes are compared after resizing the second
/// to the first's dimensions.
pub fn frame_difference(a: &Frame, b: &Frame) -> f64 {
    let a = image::DynamicImage::ImageRgba8(a.image.clone()).to_rgb8();
    let mut b = image::DynamicImage::ImageRgba8(b.image.clone()).to_rgb8();
    if a.dimensions() != b.dimensions() {
        b = image::imageops::resize(&b, a.width(), a.height(), image::imageops::FilterType::Triangle);
    }
    if a.as_raw().is_empty() {
        return 0.0;
    }
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&x, &y)| x.abs_diff(y) as u64)
        .sum();
    total as f64 / (a.as_raw().len() as f64 * 255.0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// Conversational memory for the task in flight. Single-writer: only the
/// orchestrator mutates it.
#[derive(Default)]
pub struct TaskContext {
    pub original_task: String,
    pub conversation_history: Vec<Turn>,
    pub steps_completed: Vec<Step>,
    pub last_stable_capture: Option<Frame>,
}

impl TaskContext {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn add_user_message(&mut self, content: &str) {
        self.conversation_history.push(Turn {
            role: "user".to_string(),
            content: content.to_string(),
        });
    }

    pub fn record_step(&mut self, step: &Step) {
        self.steps_completed.push(step.clone());
    }

    pub fn progress_summary(&self) -> String {
        let mut summary = format!("Original task: {}\n\n", self.original_task);
        summary.push_str("Steps completed so far:\n");
        for (i, step) in self.steps_completed.iter().enumerate() {
            summary.push_str(&format!("{}. {} - {}\n", i + 1, step.kind(), step.description()));
        }
        summary
    }
}

/// The executor's working state: one plan, one cursor. Replaced wholesale on
/// every successful acquisition, never shared.
pub struct PendingPlan {
    pub steps: Vec<Step>,
    pub cursor: usize,
}

impl PendingPlan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps, cursor: 0 }
    }

    fn current(&self) -> Option<&Step> {
        self.steps.get(self.cursor)
    }

    fn advance(&mut self) {
        self.cursor += 1;
    }
}

/// Task-level failures. Each one abandons the current analysis cycle,
/// surfaces a message, and leaves the system idle but retryable.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("screen analysis failed: {0}")]
    ParseFailed(String),
    #[error("language model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("model response was not valid JSON ({reason}): {raw}")]
    MalformedResponse { reason: String, raw: String },
    #[error("model response did not contain a non-empty steps array")]
    InvalidShape,
    #[error("gave up after {0} plan cycles without reaching an end step")]
    CycleLimit(u32),
}

/// How a `submit`/`retry` round resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The model declared the task done; the context has been reset.
    Completed { message: String },
    /// The model needs input; the context is kept so the next utterance
    /// continues the same task.
    AwaitingAnswer { question: String },
    /// The task was aborted at a suspension point; the context has been reset.
    Aborted,
}

/// Keys the keyboard step may press on their own via a control token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKey {
    Enter,
    Tab,
    Backspace,
}

/// Map a keyboard step's content to a standalone key press, if it is one of
/// the recognized control tokens.
pub fn control_token(content: &str) -> Option<ControlKey> {
    match content {
        "{ENTER}" => Some(ControlKey::Enter),
        "{TAB}" => Some(ControlKey::Tab),
        "{BACKSPACE}" => Some(ControlKey::Backspace),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Fraction of mean pixel change above which the screen counts as changed.
    pub change_threshold: f64,
    pub poll_interval: Duration,
    /// Extra settle time after a change is first observed.
    pub settle_buffer: Duration,
    pub max_change_wait: Duration,
    /// Grace period for the presentation layer to leave the shot before capture.
    pub conceal_delay: Duration,
    /// Multiplier applied to a scroll step's magnitude.
    pub scroll_step: i64,
    /// Hard cap on plan-acquisition cycles per submitted utterance.
    pub max_cycles: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            change_threshold: 0.05,
            poll_interval: Duration::from_millis(200),
            settle_buffer: Duration::from_millis(500),
            max_change_wait: Duration::from_millis(4000),
            conceal_delay: Duration::from_millis(120),
            scroll_step: 3,
            max_cycles: 25,
        }
    }
}

// ========================= Pluggable Subsystems =========================

/// What the element-parser service returns for one capture.
#[derive(Clone, Debug)]
pub struct ParsedScreen {
    pub elements: Vec<ParsedElement>,
    pub annotated_png: Vec<u8>,
}

#[async_trait]
pub trait ScreenSource: Send + Sync {
    async fn capture(&self) -> Result<Frame>;
}

#[async_trait]
pub trait ElementParser: Send + Sync {
    async fn parse(&self, screen_png: &[u8]) -> Result<ParsedScreen>;
}

#[async_trait]
pub trait StepPlanner: Send + Sync {
    /// One prompt plus one annotated image in, raw response text out.
    async fn complete(&self, prompt: &str, annotated_png: &[u8]) -> Result<String>;
}

#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn click(&self, x: i32, y: i32) -> Result<()>;
    async fn double_click(&self, x: i32, y: i32) -> Result<()>;
    async fn type_text(&self, text: &str) -> Result<()>;
    async fn key_press(&self, key: ControlKey) -> Result<()>;
    async fn scroll(&self, amount: i64) -> Result<()>;
    fn screen_size(&self) -> (u32, u32);
}

/// Presentation surface. The engine only needs to publish status lines,
/// terminal messages, and a "get out of the shot" hint before captures.
pub trait StatusSink: Send + Sync {
    fn status(&self, title: &str, detail: &str, busy: bool);
    fn conceal(&self);
    fn task_done(&self, message: &str);
    fn question(&self, question: &str);
    fn error(&self, message: &str);
}

pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn status(&self, _title: &str, _detail: &str, _busy: bool) {}
    fn conceal(&self) {}
    fn task_done(&self, _message: &str) {}
    fn question(&self, _question: &str) {}
    fn error(&self, _message: &str) {}
}

/// Best-effort sink for audit artifacts: captures, prompts, raw replies.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save_image(&self, task_id: &str, tag: &str, png: &[u8]) -> Result<PathBuf>;
    async fn save_text(&self, task_id: &str, tag: &str, content: &str) -> Result<PathBuf>;
}

pub struct DiskArtifactStore {
    base_dir: PathBuf,
}

impl DiskArtifactStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    fn timestamp_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    async fn target(&self, task_id: &str, name: &str) -> Result<PathBuf> {
        let dir = self.base_dir.join(task_id);
        async_fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create_dir {}", dir.display()))?;
        Ok(dir.join(name))
    }
}

#[async_trait]
impl ArtifactStore for DiskArtifactStore {
    async fn save_image(&self, task_id: &str, tag: &str, png: &[u8]) -> Result<PathBuf> {
        let path = self
            .target(task_id, &format!("{}_{}.png", Self::timestamp_ms(), tag))
            .await?;
        async_fs::write(&path, png)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    async fn save_text(&self, task_id: &str, tag: &str, content: &str) -> Result<PathBuf> {
        let path = self
            .target(task_id, &format!("{}_{}.txt", Self::timestamp_ms(), tag))
            .await?;
        async_fs::write(&path, content)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

// ========================= Plan Decoding =========================

/// Pull the JSON payload out of a model reply, honoring an optional fenced
/// code block with or without a language tag.
pub fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();
    let fenced = if let Some(start) = trimmed.find("```json") {
        Some(&trimmed[start + 7..])
    } else if let Some(start) = trimmed.find("```") {
        Some(&trimmed[start + 3..])
    } else {
        None
    };
    match fenced {
        Some(rest) => match rest.find("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        },
        None => trimmed,
    }
}

/// Decode a raw model reply into an ordered step sequence.
pub fn decode_plan(raw: &str) -> std::result::Result<Vec<Step>, PlanError> {
    let payload = extract_json_block(raw);
    let value: Value = serde_json::from_str(payload).map_err(|e| PlanError::MalformedResponse {
        reason: e.to_string(),
        raw: raw.to_string(),
    })?;
    let steps = match value.get("steps").and_then(|s| s.as_array()) {
        Some(steps) if !steps.is_empty() => steps.clone(),
        _ => return Err(PlanError::InvalidShape),
    };
    steps
        .into_iter()
        .map(serde_json::from_value)
        .collect::<std::result::Result<Vec<Step>, _>>()
        .map_err(|e| PlanError::MalformedResponse {
            reason: e.to_string(),
            raw: raw.to_string(),
        })
}

// ========================= Screen Change Detector =========================

/// Outcome of one stabilization wait.
pub struct Settled {
    /// The capture to adopt as the new baseline, when one was readable.
    pub frame: Option<Frame>,
    /// True when the screen never visibly changed before `max_change_wait`.
    pub timed_out: bool,
}

/// Poll the screen until it visibly differs from `baseline`, then let it
/// settle for `settle_buffer`. An unchanged screen is not an error: after
/// `max_change_wait` the current capture is adopted as stable so an action
/// with no visual effect can never stall the loop. Capture failures count as
/// "changed" for the same reason.
pub async fn await_stabilization<S: ScreenSource>(
    screen: &S,
    baseline: Option<&Frame>,
    cfg: &EngineConfig,
    abort: &AtomicBool,
) -> Settled {
    let started = Instant::now();
    loop {
        if abort.load(Ordering::SeqCst) {
            return Settled { frame: None, timed_out: false };
        }
        if started.elapsed() >= cfg.max_change_wait {
            info!(
                waited_ms = started.elapsed().as_millis() as u64,
                "screen never settled, proceeding anyway"
            );
            let frame = screen.capture().await.ok();
            return Settled { frame, timed_out: true };
        }
        sleep(cfg.poll_interval).await;
        let frame = match screen.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("capture failed while waiting for the screen, assuming it changed: {e:#}");
                sleep(cfg.settle_buffer).await;
                return Settled { frame: None, timed_out: false };
            }
        };
        let Some(baseline) = baseline else {
            return Settled { frame: Some(frame), timed_out: false };
        };
        let difference = frame_difference(baseline, &frame);
        debug!(difference, threshold = cfg.change_threshold, "screen poll");
        if difference > cfg.change_threshold {
            info!(difference, "screen changed, settling");
            sleep(cfg.settle_buffer).await;
            return Settled { frame: Some(frame), timed_out: false };
        }
    }
}

// ========================= Orchestrator =========================

/// Lets another thread or task interrupt the engine at its next suspension
/// point. After an abort the in-flight `submit` resolves to
/// `TaskOutcome::Aborted` and the context is reset; nothing else mutates.
#[derive(Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

enum StepFlow {
    /// Step had a visible side effect: advance and wait for the screen.
    Settle,
    /// Step was abandoned or had no effect: advance without waiting.
    Skip,
    Halt(TaskOutcome),
}

enum PlanDisposition {
    Reacquire,
    Halted(TaskOutcome),
}

/// The task loop: capture, parse, plan, execute, repeat. One task in flight
/// at a time; `TaskContext` and the pending plan are owned here exclusively.
pub struct Orchestrator<S, P, M, I>
where
    S: ScreenSource,
    P: ElementParser,
    M: StepPlanner,
    I: InputDriver,
{
    screen: S,
    parser: P,
    planner: M,
    input: I,
    status: Arc<dyn StatusSink>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    cfg: EngineConfig,
    context: TaskContext,
    elements: Vec<ParsedElement>,
    task_id: String,
    abort: Arc<AtomicBool>,
}

impl<S, P, M, I> Orchestrator<S, P, M, I>
where
    S: ScreenSource,
    P: ElementParser,
    M: StepPlanner,
    I: InputDriver,
{
    pub fn new(screen: S, parser: P, planner: M, input: I, cfg: EngineConfig) -> Self {
        Self {
            screen,
            parser,
            planner,
            input,
            status: Arc::new(NullStatusSink),
            artifacts: None,
            cfg,
            context: TaskContext::default(),
            elements: Vec::new(),
            task_id: String::new(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = sink;
        self
    }

    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.abort.clone())
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn has_active_task(&self) -> bool {
        !self.context.original_task.is_empty()
    }

    /// Drop the active task and return to the idle state.
    pub fn reset_task(&mut self) {
        self.context.reset();
        self.elements.clear();
    }

    /// Feed one user utterance in: a fresh task when idle, an answer or
    /// follow-up when a task is already active.
    pub async fn submit(&mut self, utterance: &str) -> std::result::Result<TaskOutcome, PlanError> {
        if self.context.original_task.is_empty() {
            self.context.original_task = utterance.to_string();
            self.task_id = nanoid!();
            info!(task = %self.context.original_task, "starting task");
        } else {
            self.context.add_user_message(utterance);
            info!(reply = %utterance, "continuing task");
        }
        self.run_cycles(utterance.to_string()).await
    }

    /// Re-run plan acquisition for the current task from a fresh capture,
    /// discarding whatever plan was in flight. Explicit only; the engine
    /// never retries on its own.
    pub async fn retry(&mut self) -> std::result::Result<TaskOutcome, PlanError> {
        let task = self.context.original_task.clone();
        info!(task = %task, "retrying task");
        self.run_cycles(task).await
    }

    async fn run_cycles(&mut self, utterance: String) -> std::result::Result<TaskOutcome, PlanError> {
        let mut utterance = utterance;
        let outcome = async {
            for cycle in 0..self.cfg.max_cycles {
                if self.check_abort() {
                    return Ok(TaskOutcome::Aborted);
                }
                debug!(cycle, "beginning analysis cycle");
                let steps = self.acquire_plan(&utterance).await?;
                let mut plan = PendingPlan::new(steps);
                match self.execute_plan(&mut plan).await {
                    PlanDisposition::Reacquire => {
                        utterance = self.context.original_task.clone();
                    }
                    PlanDisposition::Halted(outcome) => return Ok(outcome),
                }
            }
            warn!(max = self.cfg.max_cycles, "plan cycle budget exhausted");
            Err(PlanError::CycleLimit(self.cfg.max_cycles))
        }
        .await;
        if let Err(e) = &outcome {
            self.status.error(&e.to_string());
        }
        outcome
    }

    /// One full acquisition cycle: capture, parse elements, prompt the model,
    /// decode the reply into steps.
    async fn acquire_plan(&mut self, utterance: &str) -> std::result::Result<Vec<Step>, PlanError> {
        // Give the presentation layer a beat to get out of the shot.
        self.status.conceal();
        sleep(self.cfg.conceal_delay).await;

        self.status.status("Capturing", "Taking a screenshot", true);
        let frame = self
            .screen
            .capture()
            .await
            .map_err(|e| PlanError::ParseFailed(format!("screen capture failed: {e:#}")))?;
        let screen_png = frame
            .png_bytes()
            .map_err(|e| PlanError::ParseFailed(format!("could not encode capture: {e:#}")))?;
        self.context.last_stable_capture = Some(frame);
        self.save_image("screen", &screen_png).await;

        self.status.status("Analyzing screen", "Detecting interactive elements", true);
        let parsed = self
            .parser
            .parse(&screen_png)
            .await
            .map_err(|e| PlanError::ParseFailed(format!("{e:#}")))?;
        if parsed.elements.is_empty() {
            return Err(PlanError::ParseFailed("element parser returned no elements".into()));
        }
        info!(elements = parsed.elements.len(), "screen analyzed");
        self.save_image("annotated", &parsed.annotated_png).await;

        let prompt = self.render_prompt(&parsed.elements, utterance);
        self.save_text("prompt", &prompt).await;

        self.status.status(
            "Thinking",
            &format!("Found {} elements, asking for next steps", parsed.elements.len()),
            true,
        );
        let raw = self
            .planner
            .complete(&prompt, &parsed.annotated_png)
            .await
            .map_err(|e| PlanError::ModelUnavailable(format!("{e:#}")))?;
        debug!(reply = %raw, "raw model reply");
        self.save_text("response", &raw).await;

        let steps = decode_plan(&raw)?;
        info!(steps = steps.len(), "plan acquired");
        self.elements = parsed.elements;
        Ok(steps)
    }

    fn render_prompt(&self, elements: &[ParsedElement], utterance: &str) -> String {
        let mut prompt = String::from(SYSTEM_PROMPT);
        prompt.push_str("\n\n**AVAILABLE ELEMENTS**:\n");
        for (i, elem) in elements.iter().enumerate() {
            prompt.push_str(&format!("[{}]: {}\n", i, elem.describe()));
        }
        prompt.push('\n');
        if !self.context.steps_completed.is_empty() {
            prompt.push_str(&self.context.progress_summary());
            prompt.push('\n');
        }
        if !self.context.conversation_history.is_empty() {
            prompt.push_str("Conversation so far:\n");
            for turn in &self.context.conversation_history {
                prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!("User request: {}\n\n", utterance));
        prompt.push_str("Analyze the numbered screenshot and provide the next step(s) as JSON.\n");
        prompt
    }

    async fn execute_plan(&mut self, plan: &mut PendingPlan) -> PlanDisposition {
        while let Some(step) = plan.current().cloned() {
            if self.check_abort() {
                return PlanDisposition::Halted(TaskOutcome::Aborted);
            }
            info!(
                step = plan.cursor + 1,
                total = plan.steps.len(),
                kind = step.kind(),
                "dispatching step"
            );
            match self.dispatch(&step).await {
                StepFlow::Settle => {
                    plan.advance();
                    self.settle().await;
                }
                StepFlow::Skip => plan.advance(),
                StepFlow::Halt(outcome) => return PlanDisposition::Halted(outcome),
            }
        }
        if self.check_abort() {
            return PlanDisposition::Halted(TaskOutcome::Aborted);
        }
        // Sequence exhausted. End and ask_question halt at dispatch, so the
        // only legitimate closer left is wait_and_send_image; anything else
        // means the model forgot to terminate, and we re-analyze anyway
        // rather than leave the task hanging.
        if !matches!(plan.steps.last(), Some(Step::WaitAndSendImage { .. })) {
            warn!("plan did not close with a terminating step, re-analyzing as a safeguard");
        }
        PlanDisposition::Reacquire
    }

    async fn dispatch(&mut self, step: &Step) -> StepFlow {
        match step {
            Step::Click { element_number, double_click, description } => {
                let (screen_w, screen_h) = self.input.screen_size();
                let target = match self.resolve_click(*element_number, screen_w, screen_h) {
                    Ok(point) => point,
                    Err(e) => {
                        warn!("skipping click: {e:#}");
                        self.status.error(&format!("Click failed: {e}"));
                        return StepFlow::Skip;
                    }
                };
                let verb = if *double_click { "Double-clicking" } else { "Clicking" };
                self.status.status(verb, &format!("Element [{element_number}]: {description}"), true);
                let injected = if *double_click {
                    self.input.double_click(target.0, target.1).await
                } else {
                    self.input.click(target.0, target.1).await
                };
                if let Err(e) = injected {
                    warn!("click injection failed: {e:#}");
                    self.status.error(&format!("Click failed: {e}"));
                    return StepFlow::Skip;
                }
                self.context.record_step(step);
                StepFlow::Settle
            }
            Step::Keyboard { content, description, .. } => {
                self.status.status("Typing", description, true);
                let injected = match control_token(content) {
                    Some(key) => self.input.key_press(key).await,
                    // Free text is submitted by default: type it, then Enter.
                    None => match self.input.type_text(content).await {
                        Ok(()) => self.input.key_press(ControlKey::Enter).await,
                        Err(e) => Err(e),
                    },
                };
                if let Err(e) = injected {
                    warn!("keyboard injection failed: {e:#}");
                    self.status.error(&format!("Typing failed: {e}"));
                    return StepFlow::Skip;
                }
                self.context.record_step(step);
                StepFlow::Settle
            }
            Step::Scroll { magnitude, description } => {
                let direction = if *magnitude < 0 { "down" } else { "up" };
                self.status.status(&format!("Scrolling {direction}"), description, true);
                let amount = magnitude * self.cfg.scroll_step;
                if let Err(e) = self.input.scroll(amount).await {
                    warn!("scroll injection failed: {e:#}");
                    self.status.error(&format!("Scroll failed: {e}"));
                    return StepFlow::Skip;
                }
                self.context.record_step(step);
                StepFlow::Settle
            }
            Step::WaitAndSendImage { description } => {
                self.status.status("Waiting", description, true);
                self.context.record_step(step);
                StepFlow::Settle
            }
            Step::AskQuestion { question, .. } => {
                self.context.record_step(step);
                self.status.question(question);
                StepFlow::Halt(TaskOutcome::AwaitingAnswer { question: question.clone() })
            }
            Step::End { message, .. } => {
                self.status.task_done(message);
                self.reset_task();
                StepFlow::Halt(TaskOutcome::Completed { message: message.clone() })
            }
            Step::Unknown => {
                warn!("unknown step type in plan, skipping");
                StepFlow::Skip
            }
        }
    }

    fn resolve_click(&self, element_number: i64, screen_w: u32, screen_h: u32) -> Result<(i32, i32)> {
        let index = usize::try_from(element_number)
            .ok()
            .filter(|i| *i < self.elements.len())
            .ok_or_else(|| {
                anyhow!("element {} is out of range (0..{})", element_number, self.elements.len())
            })?;
        self.elements[index].resolve_center(screen_w, screen_h)
    }

    async fn settle(&mut self) {
        self.status.status("Monitoring", "Waiting for the screen to settle", true);
        let settled = await_stabilization(
            &self.screen,
            self.context.last_stable_capture.as_ref(),
            &self.cfg,
            &self.abort,
        )
        .await;
        if let Some(frame) = settled.frame {
            self.context.last_stable_capture = Some(frame);
        }
    }

    fn check_abort(&mut self) -> bool {
        if self.abort.swap(false, Ordering::SeqCst) {
            info!("task aborted");
            self.reset_task();
            true
        } else {
            false
        }
    }

    async fn save_image(&self, tag: &str, png: &[u8]) {
        if let Some(store) = &self.artifacts {
            let _ = store.save_image(&self.task_id, tag, png).await;
        }
    }

    async fn save_text(&self, tag: &str, content: &str) {
        if let Some(store) = &self.artifacts {
            let _ = store.save_text(&self.task_id, tag, content).await;
        }
    }
}

// ========================= Tests =========================
