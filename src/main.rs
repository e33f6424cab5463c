use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voxkey::asr::{AsrEngine, WhisperAsr};
use voxkey::audio::{AudioCaptureBuffer, Recorder};
use voxkey::config;
use voxkey::embedding::OnnxEmbeddingExtractor;
use voxkey::hotkeys::{DualHotkeyManager, KeyBinding};
use voxkey::injector::{ClipboardInjector, TextInject};
use voxkey::settings::SettingsManager;
use voxkey::types::{Command, UiState};
use voxkey::verifier::SpeakerVerifier;
use voxkey::worker::SessionWorker;

#[derive(Parser)]
#[command(name = "voxkey")]
#[command(about = "Local voice dictation daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the speaker profile from recorded WAV samples (3+ recommended)
    Enroll {
        /// Mono WAV files of the same speaker, ideally 16kHz
        samples: Vec<PathBuf>,
    },
    /// List available audio input devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voxkey=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Enroll { samples }) => enroll_command(&samples),
        Some(Commands::Devices) => devices_command(),
        None => run_app(),
    }
}

fn devices_command() -> Result<()> {
    let host = cpal::default_host();
    println!("Available input devices:");
    for device in host.input_devices().context("Failed to enumerate devices")? {
        let name = device.name().unwrap_or_else(|_| "<unknown>".into());
        let default_marker = host
            .default_input_device()
            .and_then(|d| d.name().ok())
            .map(|d| d == name)
            .unwrap_or(false);
        println!("  {} {}", if default_marker { "*" } else { " " }, name);
    }
    Ok(())
}

fn enroll_command(sample_paths: &[PathBuf]) -> Result<()> {
    if sample_paths.len() < 3 {
        anyhow::bail!("enrollment needs at least 3 samples, got {}", sample_paths.len());
    }

    let settings = load_settings()?;

    // Enrollment works whether or not verification is currently enabled.
    let mut verifier = SpeakerVerifier::new();
    verifier.update_thresholds(
        settings.get_f32("speaker_verification.threshold", 0.25),
        settings.get_f32("speaker_verification.high_threshold", 0.40),
        settings.get_f32("speaker_verification.low_threshold", 0.10),
    );
    let model_name = settings.get_string("speaker_verification.model", "speaker_embedding.onnx");
    let model_path = config::models_dir().map_err(anyhow::Error::msg)?.join(model_name);
    let extractor = OnnxEmbeddingExtractor::load(&model_path)
        .context("speaker embedding model not available; place it in the models directory")?;
    verifier.set_extractor(Box::new(extractor));

    let mut samples = Vec::with_capacity(sample_paths.len());
    let mut sample_rate = config::SAMPLE_RATE;
    for path in sample_paths {
        let (audio, rate) = read_wav_mono(path)?;
        if rate != config::SAMPLE_RATE {
            warn!("{}: {}Hz sample (expected {}Hz)", path.display(), rate, config::SAMPLE_RATE);
        }
        sample_rate = rate;
        samples.push(audio);
    }

    let speaker_dir = config::speaker_dir().map_err(anyhow::Error::msg)?;
    match verifier.enroll(&samples, sample_rate, &speaker_dir) {
        Ok(()) => {
            println!("Speaker enrolled ({} samples) -> {}", samples.len(), speaker_dir.display());
            Ok(())
        }
        Err(e) => anyhow::bail!("enrollment failed: {}", e),
    }
}

fn read_wav_mono(path: &PathBuf) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().filter_map(|s| s.ok()).collect(),
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| s as f32 / scale)
                .collect()
        }
    };

    // Fold multi-channel files down to mono.
    let mono = if spec.channels > 1 {
        samples
            .chunks(spec.channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    } else {
        samples
    };
    Ok((mono, spec.sample_rate))
}

fn load_settings() -> Result<Arc<SettingsManager>> {
    let path = config::settings_path().map_err(anyhow::Error::msg)?;
    Ok(Arc::new(SettingsManager::load_or_create(&path)))
}

/// Build the speaker verifier when the feature is enabled. Returns `None`
/// when disabled; a missing model degrades to a verifier without an
/// extractor (which bypasses, keeping dictation usable).
fn build_verifier(settings: &SettingsManager) -> Result<Option<SpeakerVerifier>> {
    if !settings.get_bool("speaker_verification.enabled", false) {
        return Ok(None);
    }

    let mut verifier = SpeakerVerifier::new();
    verifier.update_thresholds(
        settings.get_f32("speaker_verification.threshold", 0.25),
        settings.get_f32("speaker_verification.high_threshold", 0.40),
        settings.get_f32("speaker_verification.low_threshold", 0.10),
    );

    let model_name = settings.get_string("speaker_verification.model", "speaker_embedding.onnx");
    let model_path = config::models_dir().map_err(anyhow::Error::msg)?.join(model_name);
    match OnnxEmbeddingExtractor::load(&model_path) {
        Ok(extractor) => verifier.set_extractor(Box::new(extractor)),
        Err(e) => warn!("Speaker verification degraded to bypass: {:#}", e),
    }

    let speaker_dir = config::speaker_dir().map_err(anyhow::Error::msg)?;
    if !verifier.load_enrollment(&speaker_dir) {
        info!("No speaker enrollment found; run `voxkey enroll <wavs>` to create one");
    }
    Ok(Some(verifier))
}

/// Read the vocabulary file into the ASR context hint string.
fn build_context_hints(settings: &SettingsManager) -> String {
    if !settings.get_bool("vocabulary.enabled", true) {
        return String::new();
    }
    let Ok(path) = config::vocabulary_path() else {
        return String::new();
    };
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return String::new();
    };
    let words: Vec<&str> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    words.join(", ")
}

fn run_app() -> Result<()> {
    info!("voxkey starting");
    let settings = load_settings()?;

    // ASR engine. A missing model aborts startup; the daemon is useless
    // without it.
    let model_name = settings.get_string("asr.model", "ggml-base.bin");
    let model_path = config::models_dir().map_err(anyhow::Error::msg)?.join(model_name);
    let language = settings.get_string("asr.language", "auto");
    let mut asr = WhisperAsr::new(model_path, language);
    asr.load_model()?;

    // Microphone. Also startup-fatal: no capture device, no dictation.
    let device = settings.get_opt_string("audio.input_device");
    let recorder: Arc<dyn Recorder> = Arc::new(AudioCaptureBuffer::new(
        device.as_deref(),
        config::SAMPLE_RATE,
    )?);

    let verifier = build_verifier(&settings)?;
    let context_hints = build_context_hints(&settings);

    // Hotkey bindings from settings.
    let ptt = KeyBinding::from_key_names(
        settings.get_bool("hotkey.push_to_talk.enabled", true),
        &settings.get_string_list("hotkey.push_to_talk.keys", &["caps lock"]),
    );
    let long_press_ms = settings.get_u64("hotkey.push_to_talk.long_press_ms", 300);
    let toggle = KeyBinding::from_key_names(
        settings.get_bool("hotkey.toggle.enabled", true),
        &settings.get_string_list("hotkey.toggle.keys", &["right ctrl"]),
    );

    let mut injector = ClipboardInjector::new(settings.get_bool("output.restore_clipboard", true));
    // The injector must know which modifiers the hotkeys own before it ever
    // synthesizes a paste chord.
    injector.set_claimed_keys(ptt.all_codes().union(toggle.all_codes()).copied().collect());

    let worker = SessionWorker::spawn(
        recorder,
        Box::new(asr),
        Box::new(injector),
        verifier,
        Arc::clone(&settings),
        context_hints,
        Box::new(|state| match state {
            UiState::Idle => info!("state: idle"),
            UiState::Recording => info!("state: recording"),
            UiState::Recognizing => info!("state: recognizing"),
            UiState::Result(text) => info!("state: result {:?}", text),
            UiState::Error(msg) => warn!("state: error ({})", msg),
            UiState::Filtered => info!("state: filtered (other speaker)"),
        }),
    );

    let start_tx = worker.sender();
    let stop_tx = worker.sender();
    let hotkeys = Arc::new(DualHotkeyManager::new(
        ptt,
        long_press_ms,
        toggle,
        Arc::new(move || {
            let _ = start_tx.send(Command::Start);
        }),
        Arc::new(move || {
            let _ = stop_tx.send(Command::Stop);
        }),
    ));
    hotkeys.start();

    // Some hook mechanisms detach silently after being blocked too long;
    // check and reinstall periodically.
    let health_hotkeys = Arc::clone(&hotkeys);
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(60));
        health_hotkeys.reinstall_hook();
    });

    let quit_tx = worker.sender();
    ctrlc::set_handler(move || {
        info!("Shutting down...");
        let _ = quit_tx.send(Command::Quit);
    })
    .context("failed to install Ctrl+C handler")?;

    info!("voxkey ready (hold the push-to-talk key or tap the toggle key to dictate)");
    worker.wait();
    hotkeys.stop();
    Ok(())
}
