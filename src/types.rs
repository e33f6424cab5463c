/// Commands consumed by the session worker, one at a time. Hotkey callbacks
/// enqueue these; the worker serializes all recording/transcription work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Quit,
}

/// Observable session states, in the order a session normally visits them.
/// Hosts map these to whatever surface they have (tray tooltip, overlay, log).
#[derive(Debug, Clone, PartialEq)]
pub enum UiState {
    Idle,
    Recording,
    Recognizing,
    /// A segment produced text and it was injected.
    Result(String),
    /// Transient, user-visible failure: too short, no content, ASR error.
    Error(String),
    /// Speaker verification rejected the segment.
    Filtered,
}

/// Callback used to publish `UiState` transitions from the worker thread.
pub type StateCallback = Box<dyn Fn(UiState) + Send>;
