//! System-wide keyboard hook with per-event suppression.
//!
//! The grab loop runs on its own thread; returning `None` from the callback
//! swallows the event before the foreground app sees it. The OS may silently
//! detach a hook whose callback stalls, so the callback must only do
//! constant-time state updates — anything heavier is handed off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rdev::{simulate, Event, EventType, Key};
use tracing::{debug, error, info};

/// `(key, is_down, is_injected) -> suppress`
pub type HookCallback = Arc<dyn Fn(Key, bool, bool) -> bool + Send + Sync>;

// True while this process is synthesizing input (key replay, paste chord).
// The grab callback reads it to mark those events as injected, so our own
// output is never suppressed or re-fed into the state machine.
static INJECTING: AtomicBool = AtomicBool::new(false);

/// RAII marker for a stretch of synthetic input.
pub struct InjectionGuard;

impl InjectionGuard {
    pub fn new() -> Self {
        INJECTING.store(true, Ordering::SeqCst);
        InjectionGuard
    }
}

impl Default for InjectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InjectionGuard {
    fn drop(&mut self) {
        INJECTING.store(false, Ordering::SeqCst);
    }
}

pub fn is_injecting() -> bool {
    INJECTING.load(Ordering::SeqCst)
}

/// Replay a suppressed key as a synthetic tap so the OS sees the short press
/// normally. The trailing sleeps keep the guard alive until the events have
/// been delivered through the hook.
pub fn replay_key(key: Key) {
    let _guard = InjectionGuard::new();
    if let Err(e) = simulate(&EventType::KeyPress(key)) {
        debug!("Key replay press failed: {:?}", e);
        return;
    }
    thread::sleep(Duration::from_millis(10));
    if let Err(e) = simulate(&EventType::KeyRelease(key)) {
        debug!("Key replay release failed: {:?}", e);
    }
    thread::sleep(Duration::from_millis(10));
}

/// Handle to an installed hook. Dropping the handle leaves the grab thread
/// running but inert (the OS grab cannot be torn down portably), which makes
/// `uninstall` safe to call any number of times.
pub struct KeyHook {
    active: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    callback: HookCallback,
    thread: Option<JoinHandle<()>>,
}

impl KeyHook {
    /// Install the hook. Failure to grab (e.g. missing accessibility
    /// permission) is logged, not fatal: `is_alive` reports it and the
    /// periodic health check can retry.
    pub fn install(callback: HookCallback) -> Self {
        let mut hook = Self {
            active: Arc::new(AtomicBool::new(true)),
            alive: Arc::new(AtomicBool::new(false)),
            callback,
            thread: None,
        };
        hook.spawn();
        hook
    }

    fn spawn(&mut self) {
        let active = Arc::clone(&self.active);
        let alive = Arc::clone(&self.alive);
        let callback = Arc::clone(&self.callback);

        alive.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("voxkey-keyhook".into())
            .spawn(move || {
                let cb_active = Arc::clone(&active);
                let result = rdev::grab(move |event: Event| -> Option<Event> {
                    if !cb_active.load(Ordering::Relaxed) {
                        return Some(event);
                    }
                    let (key, is_down) = match event.event_type {
                        EventType::KeyPress(key) => (key, true),
                        EventType::KeyRelease(key) => (key, false),
                        _ => return Some(event),
                    };
                    if callback(key, is_down, is_injecting()) {
                        None
                    } else {
                        Some(event)
                    }
                });
                if let Err(e) = result {
                    error!(
                        "Keyboard hook failed to install: {:?}. \
                         Hotkeys are disabled; grant input-monitoring/accessibility permission and restart.",
                        e
                    );
                }
                alive.store(false, Ordering::SeqCst);
            })
            .expect("failed to spawn hook thread");
        self.thread = Some(handle);
        info!("Keyboard hook thread started");
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Respawn the grab loop if it died. Some hook mechanisms detach
    /// silently after being blocked too long; callers poll this from a
    /// periodic health check.
    pub fn reinstall(&mut self) {
        if self.is_alive() {
            return;
        }
        info!("Keyboard hook dead, reinstalling");
        self.thread = None;
        self.active.store(true, Ordering::SeqCst);
        self.spawn();
    }

    /// Stop processing events. Idempotent; safe after the OS resource is
    /// already gone.
    pub fn uninstall(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.thread = None;
    }
}

impl Drop for KeyHook {
    fn drop(&mut self) {
        self.uninstall();
    }
}
