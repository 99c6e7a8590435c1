// src/main.rs
//
// Replay host: drives the pipeline over a recorded scenario (JSON) and
// prints one JSON frame report per line.
//
//   reid-replay <scenario.json> [config.yaml]
//
// Detections come from the scenario; frames are synthesized by painting each
// detection in its recorded colour so embeddings stay meaningful. Verifier
// answers are scripted in the scenario unless `remote` endpoints are
// configured, in which case the HTTP verifiers are used.

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use target_reid::capabilities::TextReading;
use target_reid::config::PipelineConfig;
use target_reid::verification::RemoteVerifierClient;
use target_reid::{
    BBox, BoxTracker, CandidateId, CueSink, DepthProvider, Detection, Detector, Embedder,
    Embedding, EngineKind, Frame, FrameReport, ImageCrop, PipelineCoordinator, TextRecognizer,
    TrackUpdate, VerifierBackend, VerifierOutcome,
};

/// Minimum IoU for the replay tracker to follow a box into the next frame.
const TRACK_IOU: f32 = 0.3;

// ============================================================================
// SCENARIO FORMAT
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct Scenario {
    #[serde(default = "default_width")]
    width: u32,
    #[serde(default = "default_height")]
    height: u32,
    #[serde(default = "default_interval")]
    frame_interval_ms: f64,
    /// Replay speed multiplier (2.0 = twice real time)
    #[serde(default = "default_speed")]
    speed: f64,
    frames: Vec<ScenarioFrame>,
    #[serde(default)]
    primary: Vec<ScriptedAnswer>,
    #[serde(default)]
    llm: Vec<ScriptedAnswer>,
    #[serde(default)]
    text_reads: Vec<TextReading>,
    #[serde(default)]
    depth_m: Option<f32>,
}

fn default_width() -> u32 {
    320
}
fn default_height() -> u32 {
    240
}
fn default_interval() -> f64 {
    33.0
}
fn default_speed() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ScenarioFrame {
    #[serde(default)]
    objects: Vec<ScenarioObject>,
    /// Simulate a detector failure on this frame
    #[serde(default)]
    detector_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ScenarioObject {
    bbox: BBox,
    #[serde(default = "default_label")]
    label: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default = "default_colour")]
    colour: [u8; 3],
}

fn default_label() -> String {
    "car".to_string()
}
fn default_confidence() -> f32 {
    0.9
}
fn default_colour() -> [u8; 3] {
    [200, 200, 200]
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptedAnswer {
    #[serde(default)]
    delay_ms: u64,
    outcome: VerifierOutcome,
}

impl Scenario {
    fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse scenario {}", path.display()))
    }

    fn render(&self, index: usize) -> Frame {
        let mut image = RgbImage::new(self.width, self.height);
        if let Some(frame) = self.frames.get(index) {
            for object in &frame.objects {
                let (x, y, w, h) = object.bbox.to_pixels(self.width, self.height);
                for py in y..y + h {
                    for px in x..x + w {
                        image.put_pixel(px, py, Rgb(object.colour));
                    }
                }
            }
        }
        Frame::new(index as u64, index as f64 * self.frame_interval_ms, image)
    }
}

// ============================================================================
// REPLAY CAPABILITIES
// ============================================================================

struct ReplayDetector {
    scenario: Arc<Scenario>,
}

impl Detector for ReplayDetector {
    fn detect(&mut self, frame: &Frame, class_filter: &[String]) -> Result<Vec<Detection>> {
        let Some(recorded) = self.scenario.frames.get(frame.frame_id as usize) else {
            return Ok(Vec::new());
        };
        if recorded.detector_error {
            anyhow::bail!("recorded detector failure on frame {}", frame.frame_id);
        }
        Ok(recorded
            .objects
            .iter()
            .filter(|o| class_filter.is_empty() || class_filter.contains(&o.label))
            .map(|o| Detection::new(o.bbox, o.label.clone(), o.confidence))
            .collect())
    }
}

/// Follows each handle to the best-overlapping recorded box.
struct ReplayTracker {
    scenario: Arc<Scenario>,
    handles: HashMap<CandidateId, BBox>,
}

impl BoxTracker for ReplayTracker {
    fn start(&mut self, id: CandidateId, _frame: &Frame, bbox: BBox) {
        self.handles.insert(id, bbox);
    }

    fn reset(&mut self, id: CandidateId, _frame: &Frame, bbox: BBox) {
        self.handles.insert(id, bbox);
    }

    fn stop(&mut self, id: CandidateId) {
        self.handles.remove(&id);
    }

    fn tick(&mut self, frame: &Frame) -> Vec<TrackUpdate> {
        let objects = self
            .scenario
            .frames
            .get(frame.frame_id as usize)
            .map(|f| f.objects.as_slice())
            .unwrap_or_default();

        let mut updates = Vec::with_capacity(self.handles.len());
        for (id, bbox) in self.handles.iter_mut() {
            let best = objects
                .iter()
                .map(|o| (o.bbox, o.bbox.iou(bbox)))
                .filter(|(_, iou)| *iou > TRACK_IOU)
                .max_by(|a, b| a.1.total_cmp(&b.1));
            match best {
                Some((next, _)) => {
                    *bbox = next;
                    updates.push(TrackUpdate::Moved { id: *id, bbox: next });
                }
                None => updates.push(TrackUpdate::Failed { id: *id }),
            }
        }
        updates
    }
}

/// Mean colour of the crop.
struct MeanColourEmbedder;

impl Embedder for MeanColourEmbedder {
    fn embed(&self, crop: &ImageCrop) -> Result<Embedding> {
        let n = (crop.image.width() * crop.image.height()).max(1) as f32;
        let mut sum = [0.0f32; 3];
        for pixel in crop.image.pixels() {
            for (s, v) in sum.iter_mut().zip(pixel.0.iter()) {
                *s += *v as f32 / 255.0;
            }
        }
        Ok(Embedding(sum.iter().map(|s| s / n).collect()))
    }
}

/// Pops recorded answers in order; repeats the last one when exhausted.
struct ScriptedVerifier {
    engine: EngineKind,
    answers: Mutex<VecDeque<ScriptedAnswer>>,
    last: Mutex<Option<ScriptedAnswer>>,
}

impl ScriptedVerifier {
    fn new(engine: EngineKind, answers: Vec<ScriptedAnswer>) -> Self {
        Self {
            engine,
            answers: Mutex::new(answers.into()),
            last: Mutex::new(None),
        }
    }

    fn next_answer(&self) -> Option<ScriptedAnswer> {
        let popped = self
            .answers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(answer) = popped {
            *last = Some(answer);
        }
        last.clone()
    }
}

#[async_trait]
impl VerifierBackend for ScriptedVerifier {
    async fn verify(&self, _crop: ImageCrop, _target: &str) -> Result<VerifierOutcome> {
        let answer = self
            .next_answer()
            .with_context(|| format!("no scripted {} answers", self.engine.as_str()))?;
        tokio::time::sleep(Duration::from_millis(answer.delay_ms)).await;
        Ok(answer.outcome)
    }
}

struct ScriptedReader {
    reads: Mutex<VecDeque<TextReading>>,
}

#[async_trait]
impl TextRecognizer for ScriptedReader {
    async fn recognize(&self, _crop: ImageCrop) -> Result<Option<TextReading>> {
        Ok(self
            .reads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front())
    }
}

struct ConstantDepth(f32);

impl DepthProvider for ConstantDepth {
    fn depth_at(&mut self, _x: f32, _y: f32) -> Option<f32> {
        Some(self.0)
    }
}

struct JsonLinesSink;

impl CueSink for JsonLinesSink {
    fn emit(&mut self, report: &FrameReport) {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize frame report: {}", e),
        }
    }
}

fn verifier(
    config: &PipelineConfig,
    engine: EngineKind,
    url: Option<&String>,
    script: Vec<ScriptedAnswer>,
) -> Result<Arc<dyn VerifierBackend>> {
    Ok(match url {
        Some(url) => {
            info!("🌐 {} verifier: {}", engine.as_str(), url);
            Arc::new(RemoteVerifierClient::new(
                url.clone(),
                engine,
                config.remote.request_timeout_secs,
                config.remote.jpeg_quality,
            )?)
        }
        None => Arc::new(ScriptedVerifier::new(engine, script)),
    })
}

/// Wall-clock wait between frames at the requested replay speed.
fn replay_pause(frame_interval_ms: f64, speed: f64) -> Result<Duration> {
    let secs = (frame_interval_ms / speed.max(0.01)).max(0.0) / 1000.0;
    Duration::try_from_secs_f64(secs).with_context(|| {
        format!(
            "Invalid replay pacing: frame_interval_ms={} speed={}",
            frame_interval_ms, speed
        )
    })
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let scenario_path = args
        .next()
        .context("usage: reid-replay <scenario.json> [config.yaml]")?;
    let config_path = args.next().unwrap_or_else(|| "config.yaml".to_string());

    let config = if Path::new(&config_path).exists() {
        PipelineConfig::load(&config_path)?
    } else {
        PipelineConfig::default()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("target_reid={}", config.logging.level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("🚗 Target re-identification replay starting");

    let scenario = Arc::new(Scenario::load(Path::new(&scenario_path))?);
    info!(
        "✓ Scenario loaded: {} frames at {}x{}",
        scenario.frames.len(),
        scenario.width,
        scenario.height
    );

    let primary = verifier(
        &config,
        EngineKind::Primary,
        config.remote.primary_url.as_ref(),
        scenario.primary.clone(),
    )?;
    let llm = verifier(
        &config,
        EngineKind::Llm,
        config.remote.llm_url.as_ref(),
        scenario.llm.clone(),
    )?;

    let mut builder = PipelineCoordinator::builder(config.clone())
        .detector(ReplayDetector {
            scenario: Arc::clone(&scenario),
        })
        .tracker(ReplayTracker {
            scenario: Arc::clone(&scenario),
            handles: HashMap::new(),
        })
        .embedder(Arc::new(MeanColourEmbedder))
        .primary_verifier(primary)
        .llm_verifier(llm)
        .sink(JsonLinesSink);
    if !scenario.text_reads.is_empty() {
        builder = builder.text_recognizer(Arc::new(ScriptedReader {
            reads: Mutex::new(scenario.text_reads.clone().into()),
        }));
    }
    if let Some(depth) = scenario.depth_m {
        builder = builder.depth(ConstantDepth(depth));
    }
    let mut pipeline = builder.build()?;

    let pause = replay_pause(scenario.frame_interval_ms, scenario.speed)?;

    for index in 0..scenario.frames.len() {
        let report = pipeline.process_frame(scenario.render(index));
        for event in pipeline.drain_events() {
            info!("📣 {:?}", event);
        }
        if report.lost_target {
            info!("❌ Frame {}: target lost", report.frame_id);
        }
        tokio::time::sleep(pause).await;
    }

    pipeline.settle().await;
    let summary = pipeline.metrics();
    info!(
        "✓ Replay finished: {} frames, {} verifications, {} matches, {} timeouts",
        summary.total_frames,
        summary.verifications_dispatched,
        summary.matches,
        summary.verification_timeouts
    );
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
