// Module declarations
pub mod asr;
pub mod audio;
pub mod config;
pub mod embedding;
pub mod hotkeys;
pub mod injector;
pub mod settings;
pub mod text_processor;
pub mod types;
pub mod vad;
pub mod verifier;
pub mod worker;

pub use asr::AsrEngine;
pub use audio::{AudioCaptureBuffer, Recorder};
pub use hotkeys::{DualHotkeyManager, KeyBinding};
pub use injector::{ClipboardInjector, TextInject};
pub use settings::SettingsManager;
pub use text_processor::TextProcessor;
pub use types::{Command, UiState};
pub use verifier::{SpeakerVerifier, VerifyPath, VerifyResult};
pub use worker::SessionWorker;
