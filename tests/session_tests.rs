// End-to-end session controller scenarios driven through scripted
// collaborators: a fake microphone, a canned ASR engine and a logging
// injector. No audio hardware or models are required.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use ndarray::Array1;

use voxkey::asr::AsrEngine;
use voxkey::audio::Recorder;
use voxkey::injector::TextInject;
use voxkey::settings::SettingsManager;
use voxkey::types::{Command, UiState};
use voxkey::verifier::{EmbeddingExtractor, SpeakerVerifier, EMBEDDING_DIM};
use voxkey::worker::SessionWorker;

const SAMPLE_RATE: u32 = 16_000;

// ── Scripted collaborators ──────────────────────────────────────────────────

struct RecorderInner {
    recording: bool,
    samples: Vec<f32>,
    rms: f32,
}

/// Microphone stand-in: tests feed samples and steer the reported level.
struct ScriptedRecorder {
    inner: Mutex<RecorderInner>,
}

impl ScriptedRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RecorderInner {
                recording: false,
                samples: Vec::new(),
                rms: 0.0,
            }),
        })
    }

    fn feed_seconds(&self, seconds: f32) {
        let count = (seconds * SAMPLE_RATE as f32) as usize;
        self.inner
            .lock()
            .unwrap()
            .samples
            .extend(std::iter::repeat(0.1f32).take(count));
    }

    fn set_rms(&self, value: f32) {
        self.inner.lock().unwrap().rms = value;
    }
}

impl Recorder for ScriptedRecorder {
    fn start_recording(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.samples.clear();
        inner.recording = true;
        Ok(())
    }

    fn stop_recording(&self) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock().unwrap();
        inner.recording = false;
        let samples = std::mem::take(&mut inner.samples);
        (!samples.is_empty()).then_some(samples)
    }

    fn drain_buffer(&self) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock().unwrap();
        let samples = std::mem::take(&mut inner.samples);
        (!samples.is_empty()).then_some(samples)
    }

    fn current_rms(&self) -> f32 {
        self.inner.lock().unwrap().rms
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn is_recording(&self) -> bool {
        self.inner.lock().unwrap().recording
    }
}

/// Returns queued transcriptions in order; repeats the last one when empty.
struct StubAsr {
    responses: VecDeque<String>,
    last: String,
}

impl StubAsr {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: responses.iter().map(|s| s.to_string()).collect(),
            last: responses.last().unwrap_or(&"").to_string(),
        }
    }
}

impl AsrEngine for StubAsr {
    fn load_model(&mut self) -> Result<()> {
        Ok(())
    }

    fn transcribe(&mut self, _audio: &[f32], _sample_rate: u32, _context: &str) -> Result<String> {
        Ok(self.responses.pop_front().unwrap_or_else(|| self.last.clone()))
    }

    fn unload_model(&mut self) {}

    fn is_ready(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
enum InjectorCall {
    Text(String),
    TextNoRestore(String),
    Char(char),
    Save,
    Restore,
}

struct RecordingInjector {
    log: Arc<Mutex<Vec<InjectorCall>>>,
}

impl TextInject for RecordingInjector {
    fn inject_text(&mut self, text: &str) {
        self.log.lock().unwrap().push(InjectorCall::Text(text.to_string()));
    }

    fn inject_text_no_restore(&mut self, text: &str) {
        self.log
            .lock()
            .unwrap()
            .push(InjectorCall::TextNoRestore(text.to_string()));
    }

    fn inject_char(&mut self, ch: char) {
        self.log.lock().unwrap().push(InjectorCall::Char(ch));
    }

    fn save_clipboard(&mut self) {
        self.log.lock().unwrap().push(InjectorCall::Save);
    }

    fn restore_saved_clipboard(&mut self) {
        self.log.lock().unwrap().push(InjectorCall::Restore);
    }

    fn set_claimed_keys(&mut self, _keys: Vec<voxkey::hotkeys::KeyCode>) {}
}

struct QueuedExtractor {
    queue: VecDeque<Array1<f32>>,
}

impl EmbeddingExtractor for QueuedExtractor {
    fn extract(&mut self, _audio: &[f32], _sample_rate: u32) -> Result<Array1<f32>> {
        self.queue
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no queued embedding"))
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

fn temp_settings(name: &str) -> (Arc<SettingsManager>, PathBuf) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be set")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("voxkey-session-{name}-{nanos}.json"));
    (Arc::new(SettingsManager::load_or_create(&path)), path)
}

struct Harness {
    recorder: Arc<ScriptedRecorder>,
    worker: SessionWorker,
    log: Arc<Mutex<Vec<InjectorCall>>>,
    states: Arc<Mutex<Vec<UiState>>>,
    settings_path: PathBuf,
}

impl Harness {
    fn new(
        name: &str,
        asr_responses: &[&str],
        verifier: Option<SpeakerVerifier>,
        configure: impl FnOnce(&SettingsManager),
    ) -> Self {
        let (settings, settings_path) = temp_settings(name);
        configure(&settings);

        let recorder = ScriptedRecorder::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let states = Arc::new(Mutex::new(Vec::new()));
        let states_cb = Arc::clone(&states);

        let worker = SessionWorker::spawn(
            Arc::clone(&recorder) as Arc<dyn Recorder>,
            Box::new(StubAsr::new(asr_responses)),
            Box::new(RecordingInjector {
                log: Arc::clone(&log),
            }),
            verifier,
            settings,
            String::new(),
            Box::new(move |state| states_cb.lock().unwrap().push(state)),
        );

        Self {
            recorder,
            worker,
            log,
            states,
            settings_path,
        }
    }

    fn finish(self) -> (Vec<InjectorCall>, Vec<UiState>) {
        self.worker.shutdown();
        let _ = std::fs::remove_file(&self.settings_path);
        let log = self.log.lock().unwrap().clone();
        let states = self.states.lock().unwrap().clone();
        (log, states)
    }
}

fn settle() {
    thread::sleep(Duration::from_millis(150));
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn single_shot_session_injects_transcription_once() {
    let harness = Harness::new("single", &["hello world"], None, |settings| {
        settings.set("text_processing.remove_fillers", serde_json::json!(false));
        settings.set("text_processing.smart_punctuation", serde_json::json!(false));
    });

    harness.worker.enqueue(Command::Start);
    settle();
    assert!(harness.recorder.is_recording());

    harness.recorder.feed_seconds(1.2);
    harness.worker.enqueue(Command::Stop);
    let (log, states) = harness.finish();

    assert_eq!(log, vec![InjectorCall::Text("hello world".to_string())]);
    assert!(states.contains(&UiState::Recording));
    assert!(states.contains(&UiState::Recognizing));
    assert!(states.contains(&UiState::Result("hello world".to_string())));
}

#[test]
fn too_short_recording_reports_error() {
    let harness = Harness::new("short", &["hi"], None, |_| {});

    harness.worker.enqueue(Command::Start);
    settle();
    harness.recorder.feed_seconds(0.1);
    harness.worker.enqueue(Command::Stop);
    let (log, states) = harness.finish();

    assert!(log.is_empty());
    assert!(states.contains(&UiState::Error("recording too short".to_string())));
}

#[test]
fn single_char_noise_from_short_clip_is_dropped() {
    let harness = Harness::new("noise", &["嗯。"], None, |settings| {
        settings.set("text_processing.remove_fillers", serde_json::json!(false));
        settings.set("text_processing.smart_punctuation", serde_json::json!(false));
    });

    harness.worker.enqueue(Command::Start);
    settle();
    harness.recorder.feed_seconds(0.5);
    harness.worker.enqueue(Command::Stop);
    let (log, states) = harness.finish();

    assert!(log.is_empty());
    assert!(states.contains(&UiState::Error("no speech content recognized".to_string())));
}

#[test]
fn foreign_speaker_segment_is_filtered_not_injected() {
    // Enroll on unit-x embeddings, then hand verify an orthogonal embedding:
    // cosine 0.0 is under the low threshold, a fast reject.
    let mut unit_x = Array1::<f32>::zeros(EMBEDDING_DIM);
    unit_x[0] = 1.0;
    let mut unit_y = Array1::<f32>::zeros(EMBEDDING_DIM);
    unit_y[1] = 1.0;

    let enroll_dir = std::env::temp_dir().join(format!(
        "voxkey-session-enroll-{}",
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
    ));
    let mut verifier = SpeakerVerifier::new();
    verifier.set_extractor(Box::new(QueuedExtractor {
        queue: VecDeque::from(vec![unit_x.clone(), unit_x.clone(), unit_x, unit_y]),
    }));
    verifier
        .enroll(
            &[vec![0.1; 800], vec![0.1; 800], vec![0.1; 800]],
            SAMPLE_RATE,
            &enroll_dir,
        )
        .unwrap();

    let harness = Harness::new("filtered", &["should never appear"], Some(verifier), |s| {
        s.set("speaker_verification.enabled", serde_json::json!(true));
    });

    harness.worker.enqueue(Command::Start);
    settle();
    harness.recorder.feed_seconds(1.2);
    harness.worker.enqueue(Command::Stop);
    let (log, states) = harness.finish();

    assert!(log.is_empty());
    assert!(states.contains(&UiState::Filtered));
    assert!(!states.iter().any(|s| matches!(s, UiState::Result(_))));
    let _ = std::fs::remove_dir_all(enroll_dir);
}

#[test]
fn progressive_session_stitches_segments_and_flushes_pending_period() {
    let harness = Harness::new(
        "progressive",
        &["今天天气很好。", "我们出去走走。"],
        None,
        |settings| {
            settings.set("hotkey.progressive", serde_json::json!(true));
            settings.set("hotkey.silence_duration", serde_json::json!(0.2));
        },
    );

    harness.worker.enqueue(Command::Start);
    settle();

    // First utterance: speech long enough to pass the flush floor, then a
    // pause that triggers the incremental flush.
    harness.recorder.set_rms(0.5);
    thread::sleep(Duration::from_millis(700));
    harness.recorder.feed_seconds(1.0);
    harness.recorder.set_rms(0.0);
    thread::sleep(Duration::from_millis(600));

    // Second utterance, ended by Stop rather than a pause.
    harness.recorder.set_rms(0.5);
    thread::sleep(Duration::from_millis(700));
    harness.recorder.feed_seconds(1.0);
    harness.worker.enqueue(Command::Stop);
    let (log, states) = harness.finish();

    assert_eq!(
        log,
        vec![
            InjectorCall::Save,
            InjectorCall::TextNoRestore("今天天气很好".to_string()),
            InjectorCall::TextNoRestore("，我们出去走走".to_string()),
            InjectorCall::Char('。'),
            InjectorCall::Restore,
        ]
    );
    let results: Vec<_> = states
        .iter()
        .filter(|s| matches!(s, UiState::Result(_)))
        .collect();
    assert_eq!(results.len(), 2);
}

#[test]
fn silent_progressive_session_reports_no_content() {
    let harness = Harness::new("silent", &[""], None, |settings| {
        settings.set("hotkey.progressive", serde_json::json!(true));
    });

    harness.worker.enqueue(Command::Start);
    settle();
    // No speech at all, then stop.
    harness.worker.enqueue(Command::Stop);
    let (log, states) = harness.finish();

    assert_eq!(log, vec![InjectorCall::Save, InjectorCall::Restore]);
    assert_eq!(
        states.last(),
        Some(&UiState::Error("no speech content recognized".to_string()))
    );
}

#[test]
fn worker_survives_asr_failure_and_keeps_serving() {
    struct FailingAsr {
        failed_once: bool,
    }
    impl AsrEngine for FailingAsr {
        fn load_model(&mut self) -> Result<()> {
            Ok(())
        }
        fn transcribe(&mut self, _: &[f32], _: u32, _: &str) -> Result<String> {
            if !self.failed_once {
                self.failed_once = true;
                anyhow::bail!("inference backend exploded");
            }
            Ok("recovered".to_string())
        }
        fn unload_model(&mut self) {}
        fn is_ready(&self) -> bool {
            true
        }
    }

    let (settings, settings_path) = temp_settings("failure");
    settings.set("text_processing.remove_fillers", serde_json::json!(false));
    settings.set("text_processing.smart_punctuation", serde_json::json!(false));

    let recorder = ScriptedRecorder::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let states = Arc::new(Mutex::new(Vec::new()));
    let states_cb = Arc::clone(&states);
    let worker = SessionWorker::spawn(
        Arc::clone(&recorder) as Arc<dyn Recorder>,
        Box::new(FailingAsr { failed_once: false }),
        Box::new(RecordingInjector {
            log: Arc::clone(&log),
        }),
        None,
        settings,
        String::new(),
        Box::new(move |state| states_cb.lock().unwrap().push(state)),
    );

    // First session: the ASR error becomes an Error state, nothing more.
    worker.enqueue(Command::Start);
    settle();
    recorder.feed_seconds(1.2);
    worker.enqueue(Command::Stop);
    settle();

    // Second session on the same worker succeeds.
    worker.enqueue(Command::Start);
    settle();
    recorder.feed_seconds(1.2);
    worker.enqueue(Command::Stop);
    worker.shutdown();
    let _ = std::fs::remove_file(settings_path);

    let log = log.lock().unwrap().clone();
    let states = states.lock().unwrap().clone();
    assert_eq!(log, vec![InjectorCall::Text("recovered".to_string())]);
    assert!(states.contains(&UiState::Error("recognition failed".to_string())));
    assert!(states.contains(&UiState::Result("recovered".to_string())));
}
