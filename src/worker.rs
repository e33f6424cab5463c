//! Session worker: drains the command queue on a dedicated thread and runs
//! the whole record → verify → transcribe → process → inject pipeline.
//!
//! One command at a time means at most one session is ever in flight; hotkey
//! events arriving while a session runs simply queue up. All blocking work
//! (inference, file I/O, injection) happens here and only here.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::asr::AsrEngine;
use crate::audio::Recorder;
use crate::injector::TextInject;
use crate::settings::SettingsManager;
use crate::text_processor::TextProcessor;
use crate::types::{Command, StateCallback, UiState};
use crate::verifier::SpeakerVerifier;

/// Speech required before a pause is allowed to flush a segment.
const MIN_SPEECH_BEFORE_FLUSH_SECS: f32 = 0.5;
/// Continuous silence that force-flushes regardless of the speech floor, so
/// a long pause after a very short utterance still produces output.
const MAX_SILENCE_FORCE_FLUSH_SECS: f32 = 3.0;
/// Progressive loop poll interval; also bounds how stale a Stop can get.
const CMD_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Clips shorter than this with ≤1 meaningful character are ASR noise.
const QUALITY_MIN_AUDIO_SECS: f32 = 1.0;

/// What one flush attempt did. States for Filtered/Failed are emitted inside
/// the flush; the callers translate the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushOutcome {
    Injected,
    TooShort,
    Filtered,
    /// Transcription produced no usable text (empty or quality-filtered).
    Empty,
    Failed,
}

pub struct SessionWorker {
    cmd_tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        recorder: Arc<dyn Recorder>,
        asr: Box<dyn AsrEngine>,
        injector: Box<dyn TextInject>,
        verifier: Option<SpeakerVerifier>,
        settings: Arc<SettingsManager>,
        context_hints: String,
        on_state: StateCallback,
    ) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let mut inner = WorkerInner {
            recorder,
            asr,
            injector,
            verifier,
            settings,
            context_hints,
            on_state,
            cmd_rx,
            text: TextProcessor::new(true, true),
            quit: false,
        };
        let handle = std::thread::Builder::new()
            .name("voxkey-session".into())
            .spawn(move || inner.run())
            .expect("failed to spawn session worker");
        Self {
            cmd_tx,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> Sender<Command> {
        self.cmd_tx.clone()
    }

    pub fn enqueue(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// Block until the worker exits (a `Quit` command ends the loop).
    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Convenience for shutdown paths: enqueue Quit and join.
    pub fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Quit);
        self.wait();
    }
}

struct WorkerInner {
    recorder: Arc<dyn Recorder>,
    asr: Box<dyn AsrEngine>,
    injector: Box<dyn TextInject>,
    verifier: Option<SpeakerVerifier>,
    settings: Arc<SettingsManager>,
    context_hints: String,
    on_state: StateCallback,
    cmd_rx: Receiver<Command>,
    text: TextProcessor,
    quit: bool,
}

impl WorkerInner {
    fn run(&mut self) {
        info!("Session worker started");
        while !self.quit {
            match self.cmd_rx.recv() {
                Ok(Command::Start) => {
                    // A failed segment must never kill the worker loop.
                    if let Err(e) = self.handle_start() {
                        error!("Recording session failed: {:#}", e);
                        self.emit(UiState::Error("recording failed".into()));
                    }
                }
                Ok(Command::Stop) => self.handle_stop(),
                Ok(Command::Quit) | Err(_) => break,
            }
        }
        self.asr.unload_model();
        info!("Session worker finished");
    }

    fn emit(&self, state: UiState) {
        (self.on_state)(state);
    }

    fn refresh_text_flags(&mut self) {
        let remove_fillers = self.settings.get_bool("text_processing.remove_fillers", true);
        let smart_punctuation = self
            .settings
            .get_bool("text_processing.smart_punctuation", true);
        self.text.update(remove_fillers, smart_punctuation);
    }

    fn handle_start(&mut self) -> Result<()> {
        let progressive = self.settings.get_bool("hotkey.progressive", false);
        info!("Recording start (progressive={})", progressive);

        self.refresh_text_flags();
        self.text.reset_session();
        self.recorder.start_recording()?;
        self.emit(UiState::Recording);

        if progressive {
            self.run_progressive_loop();
        }
        Ok(())
    }

    /// Monitor energy for speech pauses and transcribe incrementally until a
    /// Stop arrives. The queue is polled with a timeout so Stop/Quit are
    /// observed within one tick even mid-segment.
    fn run_progressive_loop(&mut self) {
        let silence_threshold = self.settings.get_f32("hotkey.silence_threshold", 0.01);
        let silence_duration = self.settings.get_f32("hotkey.silence_duration", 0.8);
        let restore_clipboard = self.settings.get_bool("output.restore_clipboard", true);

        if restore_clipboard {
            self.injector.save_clipboard();
        }

        let mut speech_start: Option<Instant> = None;
        let mut silence_start: Option<Instant> = None;
        let mut injected_any = false;

        loop {
            match self.cmd_rx.recv_timeout(CMD_POLL_INTERVAL) {
                Ok(Command::Stop) => break,
                Ok(Command::Quit) => {
                    self.quit = true;
                    break;
                }
                Ok(Command::Start) => {} // Already recording; ignore.
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.quit = true;
                    break;
                }
            }

            let level = self.recorder.current_rms();
            if level < silence_threshold {
                match (speech_start, silence_start) {
                    (Some(_), None) => silence_start = Some(Instant::now()),
                    (Some(speech), Some(silence)) => {
                        let silence_elapsed = silence.elapsed().as_secs_f32();
                        let speech_duration = (silence - speech).as_secs_f32();
                        let pause_flush = silence_elapsed >= silence_duration
                            && speech_duration >= MIN_SPEECH_BEFORE_FLUSH_SECS;
                        // Safety valve: a long pause after too little speech
                        // still flushes rather than hanging forever.
                        let force_flush = silence_elapsed >= MAX_SILENCE_FORCE_FLUSH_SECS;
                        if pause_flush || force_flush {
                            if force_flush && !pause_flush {
                                debug!("Force-flush after {:.1}s of silence", silence_elapsed);
                            }
                            let audio = self.recorder.drain_buffer();
                            if self.flush_and_inject(audio, false, true) == FlushOutcome::Injected {
                                injected_any = true;
                            }
                            self.emit(UiState::Recording);
                            speech_start = None;
                            silence_start = None;
                        }
                    }
                    _ => {}
                }
            } else {
                if speech_start.is_none() {
                    speech_start = Some(Instant::now());
                }
                silence_start = None;
            }
        }

        // Final flush of whatever is left in the buffer.
        let audio = self.recorder.stop_recording();
        let final_outcome = self.flush_and_inject(audio, false, true);
        if final_outcome == FlushOutcome::Injected {
            injected_any = true;
        }

        // The terminator withheld from the last segment closes the session's
        // final sentence — but only if the session produced anything at all.
        if let Some(period) = self.text.consume_pending_period() {
            if injected_any {
                self.injector.inject_char(period);
            }
        }

        if restore_clipboard {
            self.injector.restore_saved_clipboard();
        }

        if !injected_any {
            self.emit(UiState::Error("no speech content recognized".into()));
        } else if final_outcome != FlushOutcome::Injected {
            self.emit(UiState::Idle);
        }
    }

    /// Non-progressive stop: one flush of the whole recording.
    fn handle_stop(&mut self) {
        let audio = self.recorder.stop_recording();
        match self.flush_and_inject(audio, true, false) {
            FlushOutcome::Injected => {}
            FlushOutcome::TooShort => {
                self.emit(UiState::Error("recording too short".into()));
            }
            FlushOutcome::Empty => {
                self.emit(UiState::Error("no speech content recognized".into()));
            }
            // Filtered/Failed already emitted their state.
            FlushOutcome::Filtered | FlushOutcome::Failed => {}
        }
    }

    /// Verify, transcribe, post-process and inject one segment.
    fn flush_and_inject(
        &mut self,
        audio: Option<Vec<f32>>,
        use_clipboard_restore: bool,
        use_deferred_period: bool,
    ) -> FlushOutcome {
        let sample_rate = self.recorder.sample_rate();
        let min_duration = self.settings.get_f32("audio.min_duration", 0.3);

        let Some(mut audio) = audio else {
            return FlushOutcome::TooShort;
        };
        if (audio.len() as f32) / (sample_rate as f32) < min_duration {
            return FlushOutcome::TooShort;
        }

        // Speaker verification (if enabled and enrolled).
        let sv_enabled = self.settings.get_bool("speaker_verification.enabled", false);
        if sv_enabled {
            if let Some(verifier) = self.verifier.as_mut() {
                match verifier.verify(&audio, sample_rate) {
                    Ok(result) => {
                        if !result.is_user {
                            info!(
                                "Speaker filtered: path={:?}, score={:.4}",
                                result.path, result.score
                            );
                            self.emit(UiState::Filtered);
                            return FlushOutcome::Filtered;
                        }
                        if let Some(filtered) = result.audio {
                            audio = filtered;
                        }
                    }
                    Err(e) => {
                        warn!("Speaker verification failed, proceeding with ASR: {:#}", e);
                    }
                }
            }
        }

        self.emit(UiState::Recognizing);

        let raw = match self
            .asr
            .transcribe(&audio, sample_rate, &self.context_hints)
        {
            Ok(text) => text,
            Err(e) => {
                error!("Transcription failed: {:#}", e);
                self.emit(UiState::Error("recognition failed".into()));
                return FlushOutcome::Failed;
            }
        };

        let text = if use_deferred_period {
            self.text.process(&raw)
        } else {
            self.text.process_simple(&raw)
        };

        // Quality filter: a one-character result from a sub-second clip is
        // almost always decoder noise, not speech.
        let audio_duration = audio.len() as f32 / sample_rate as f32;
        if TextProcessor::meaningful_length(&text) <= 1 && audio_duration < QUALITY_MIN_AUDIO_SECS {
            debug!("Quality filter: rejected {:?} ({:.2}s audio)", text, audio_duration);
            return FlushOutcome::Empty;
        }

        if text.trim().is_empty() {
            return FlushOutcome::Empty;
        }

        if use_clipboard_restore {
            self.injector.inject_text(&text);
        } else {
            self.injector.inject_text_no_restore(&text);
        }
        self.emit(UiState::Result(text));
        FlushOutcome::Injected
    }
}
