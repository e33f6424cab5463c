//! Dual hotkey manager: one suppressing keyboard hook shared by two
//! independent bindings.
//!
//! - push-to-talk: long-press to record, short-press passes through
//! - toggle: press once to start, press again to stop
//!
//! Exactly one mode can be active at a time; while one binding is active the
//! other binding's keys are swallowed without triggering anything.

pub mod hook;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rdev::Key;
use tracing::{debug, info, warn};

use self::hook::{HookCallback, KeyHook};

pub type KeyCode = Key;

/// Map a human key name from settings to the set of concrete key codes it
/// stands for. Generic modifier names cover both left/right variants.
fn key_name_to_codes(name: &str) -> HashSet<KeyCode> {
    let mut codes = HashSet::new();
    match name.to_lowercase().as_str() {
        "ctrl" | "control" => {
            codes.insert(Key::ControlLeft);
            codes.insert(Key::ControlRight);
        }
        "left ctrl" | "left control" => {
            codes.insert(Key::ControlLeft);
        }
        "right ctrl" | "right control" => {
            codes.insert(Key::ControlRight);
        }
        "shift" => {
            codes.insert(Key::ShiftLeft);
            codes.insert(Key::ShiftRight);
        }
        "left shift" => {
            codes.insert(Key::ShiftLeft);
        }
        "right shift" => {
            codes.insert(Key::ShiftRight);
        }
        "alt" | "option" | "left alt" | "left option" => {
            codes.insert(Key::Alt);
        }
        "alt gr" | "right alt" | "right option" => {
            codes.insert(Key::AltGr);
        }
        "meta" | "win" | "windows" | "command" | "cmd" | "super" => {
            codes.insert(Key::MetaLeft);
            codes.insert(Key::MetaRight);
        }
        "left win" | "left windows" | "left command" => {
            codes.insert(Key::MetaLeft);
        }
        "right win" | "right windows" | "right command" => {
            codes.insert(Key::MetaRight);
        }
        "caps lock" | "capslock" => {
            codes.insert(Key::CapsLock);
        }
        "space" => {
            codes.insert(Key::Space);
        }
        "tab" => {
            codes.insert(Key::Tab);
        }
        "escape" | "esc" => {
            codes.insert(Key::Escape);
        }
        "return" | "enter" => {
            codes.insert(Key::Return);
        }
        "f1" => {
            codes.insert(Key::F1);
        }
        "f2" => {
            codes.insert(Key::F2);
        }
        "f3" => {
            codes.insert(Key::F3);
        }
        "f4" => {
            codes.insert(Key::F4);
        }
        "f5" => {
            codes.insert(Key::F5);
        }
        "f6" => {
            codes.insert(Key::F6);
        }
        "f7" => {
            codes.insert(Key::F7);
        }
        "f8" => {
            codes.insert(Key::F8);
        }
        "f9" => {
            codes.insert(Key::F9);
        }
        "f10" => {
            codes.insert(Key::F10);
        }
        "f11" => {
            codes.insert(Key::F11);
        }
        "f12" => {
            codes.insert(Key::F12);
        }
        other => warn!("Unknown key name: {:?}", other),
    }
    codes
}

/// One hotkey binding: a chord of key groups. The chord is satisfied when
/// every group has at least one member currently down (a group models a key
/// with interchangeable left/right variants).
#[derive(Debug, Clone, Default)]
pub struct KeyBinding {
    enabled: bool,
    key_groups: Vec<HashSet<KeyCode>>,
    all_codes: HashSet<KeyCode>,
}

impl KeyBinding {
    pub fn from_key_names(enabled: bool, keys: &[String]) -> Self {
        if !enabled {
            return Self::default();
        }
        let mut key_groups = Vec::new();
        let mut all_codes = HashSet::new();
        for name in keys {
            let codes = key_name_to_codes(name);
            if !codes.is_empty() {
                all_codes.extend(codes.iter().copied());
                key_groups.push(codes);
            }
        }
        Self {
            enabled,
            key_groups,
            all_codes,
        }
    }

    pub fn contains(&self, code: KeyCode) -> bool {
        self.enabled && self.all_codes.contains(&code)
    }

    pub fn satisfied_by(&self, pressed: &HashSet<KeyCode>) -> bool {
        !self.key_groups.is_empty()
            && self
                .key_groups
                .iter()
                .all(|group| group.iter().any(|code| pressed.contains(code)))
    }

    pub fn all_codes(&self) -> &HashSet<KeyCode> {
        &self.all_codes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyMode {
    PushToTalk,
    Toggle,
}

/// Runtime state shared between the hook callback and the PTT timer thread.
/// Reset wholesale on `update_bindings`/`stop` so no gesture dangles.
struct HotkeyState {
    ptt: KeyBinding,
    toggle: KeyBinding,
    long_press_ms: u64,

    codes_pressed: HashSet<KeyCode>,
    is_active: bool,
    active_mode: Option<HotkeyMode>,

    ptt_press_at: Option<Instant>,
    ptt_long_triggered: bool,
    // Bumped to cancel an in-flight long-press timer.
    ptt_timer_gen: u64,
    toggle_armed: bool,
}

impl HotkeyState {
    fn reset_runtime(&mut self) {
        self.codes_pressed.clear();
        self.is_active = false;
        self.active_mode = None;
        self.ptt_press_at = None;
        self.ptt_long_triggered = false;
        self.ptt_timer_gen = self.ptt_timer_gen.wrapping_add(1);
        self.toggle_armed = false;
    }
}

/// Deferred side effects decided under the lock, executed after release.
enum Followup {
    None,
    FireStart,
    FireStop,
    Replay(KeyCode),
    ArmTimer { gen: u64, delay_ms: u64 },
}

pub struct DualHotkeyManager {
    state: Arc<Mutex<HotkeyState>>,
    on_start: Arc<dyn Fn() + Send + Sync>,
    on_stop: Arc<dyn Fn() + Send + Sync>,
    hook: Mutex<Option<KeyHook>>,
}

impl DualHotkeyManager {
    pub fn new(
        ptt: KeyBinding,
        long_press_ms: u64,
        toggle: KeyBinding,
        on_start: Arc<dyn Fn() + Send + Sync>,
        on_stop: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        info!(
            "DualHotkeyManager: ptt_enabled={} long_press={}ms toggle_enabled={}",
            ptt.enabled, long_press_ms, toggle.enabled
        );
        Self {
            state: Arc::new(Mutex::new(HotkeyState {
                ptt,
                toggle,
                long_press_ms,
                codes_pressed: HashSet::new(),
                is_active: false,
                active_mode: None,
                ptt_press_at: None,
                ptt_long_triggered: false,
                ptt_timer_gen: 0,
                toggle_armed: false,
            })),
            on_start,
            on_stop,
            hook: Mutex::new(None),
        }
    }

    /// Install the keyboard hook and begin processing events.
    pub fn start(&self) {
        let state = Arc::clone(&self.state);
        let on_start = Arc::clone(&self.on_start);
        let on_stop = Arc::clone(&self.on_stop);
        let callback: HookCallback = Arc::new(move |code, is_down, is_injected| {
            // Synthetic input (our replays, the paste chord) passes through.
            if is_injected {
                return false;
            }
            process_key_event(&state, &on_start, &on_stop, code, is_down)
        });
        *self.hook.lock().unwrap() = Some(KeyHook::install(callback));
        info!("DualHotkeyManager started");
    }

    pub fn stop(&self) {
        if let Some(mut hook) = self.hook.lock().unwrap().take() {
            hook.uninstall();
        }
        self.state.lock().unwrap().reset_runtime();
        info!("DualHotkeyManager stopped");
    }

    /// Reinstall the hook if it silently died. Called from a periodic
    /// health-check thread.
    pub fn reinstall_hook(&self) {
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook.reinstall();
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().is_active
    }

    /// Key codes claimed by either binding. The text injector uses this to
    /// avoid releasing hotkey-held modifiers when synthesizing the paste
    /// shortcut.
    pub fn all_bound_keys(&self) -> Vec<KeyCode> {
        let state = self.state.lock().unwrap();
        state
            .ptt
            .all_codes()
            .union(state.toggle.all_codes())
            .copied()
            .collect()
    }

    /// Replace both bindings atomically. In-progress gestures are abandoned.
    pub fn update_bindings(&self, ptt: KeyBinding, long_press_ms: u64, toggle: KeyBinding) {
        let mut state = self.state.lock().unwrap();
        state.ptt = ptt;
        state.toggle = toggle;
        state.long_press_ms = long_press_ms;
        state.reset_runtime();
        info!("Bindings updated");
    }

    /// Core state machine entry. Returns whether the event must be
    /// suppressed. Exposed so the logic can be driven directly in tests.
    pub fn on_key_event(&self, code: KeyCode, is_down: bool) -> bool {
        process_key_event(&self.state, &self.on_start, &self.on_stop, code, is_down)
    }
}

type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Core state machine. Safe to call from the hook callback: constant-time
/// under one lock, side effects handed off to short-lived threads.
fn process_key_event(
    state: &Arc<Mutex<HotkeyState>>,
    on_start: &EventCallback,
    on_stop: &EventCallback,
    code: KeyCode,
    is_down: bool,
) -> bool {
    let (suppress, followup) = {
        let mut state = state.lock().unwrap();

        let is_ptt_key = state.ptt.contains(code);
        let is_toggle_key = state.toggle.contains(code);
        if !is_ptt_key && !is_toggle_key {
            return false;
        }

        if state.is_active {
            match state.active_mode {
                Some(HotkeyMode::PushToTalk) if is_ptt_key => {
                    handle_ptt(&mut state, code, is_down)
                }
                Some(HotkeyMode::Toggle) if is_toggle_key => {
                    handle_toggle(&mut state, code, is_down)
                }
                // The other binding's keys must not interfere while a
                // mode is active: swallow, no transition.
                _ => (true, Followup::None),
            }
        } else if is_ptt_key {
            handle_ptt(&mut state, code, is_down)
        } else {
            handle_toggle(&mut state, code, is_down)
        }
    };

    run_followup(state, on_start, on_stop, followup);
    suppress
}

fn handle_ptt(state: &mut HotkeyState, code: KeyCode, is_down: bool) -> (bool, Followup) {
    if is_down {
        state.codes_pressed.insert(code);
        if state.is_active {
            return (true, Followup::None);
        }
        if state.ptt.satisfied_by(&state.codes_pressed) {
            if state.ptt_press_at.is_none() {
                state.ptt_press_at = Some(Instant::now());
                state.ptt_long_triggered = false;
                state.ptt_timer_gen = state.ptt_timer_gen.wrapping_add(1);
                return (
                    true,
                    Followup::ArmTimer {
                        gen: state.ptt_timer_gen,
                        delay_ms: state.long_press_ms,
                    },
                );
            }
            return (true, Followup::None);
        }
        (false, Followup::None)
    } else {
        let was_all_pressed = state.ptt.satisfied_by(&state.codes_pressed);
        state.codes_pressed.remove(&code);

        if state.is_active && state.active_mode == Some(HotkeyMode::PushToTalk) {
            state.is_active = false;
            state.active_mode = None;
            state.ptt_press_at = None;
            state.ptt_long_triggered = false;
            state.ptt_timer_gen = state.ptt_timer_gen.wrapping_add(1);
            return (true, Followup::FireStop);
        }

        if was_all_pressed && state.ptt_press_at.is_some() {
            state.ptt_timer_gen = state.ptt_timer_gen.wrapping_add(1);
            state.ptt_press_at = None;
            let was_long = state.ptt_long_triggered;
            state.ptt_long_triggered = false;
            if !was_long {
                debug!("PTT short-press, replaying key");
                return (true, Followup::Replay(code));
            }
            return (true, Followup::None);
        }
        (false, Followup::None)
    }
}

fn handle_toggle(state: &mut HotkeyState, code: KeyCode, is_down: bool) -> (bool, Followup) {
    if is_down {
        state.codes_pressed.insert(code);
        // `toggle_armed` debounces OS key-repeat: the chord must be
        // released before it can trigger again.
        if !state.toggle_armed && state.toggle.satisfied_by(&state.codes_pressed) {
            state.toggle_armed = true;
            if !state.is_active {
                state.is_active = true;
                state.active_mode = Some(HotkeyMode::Toggle);
                return (true, Followup::FireStart);
            } else {
                state.is_active = false;
                state.active_mode = None;
                return (true, Followup::FireStop);
            }
        }
        (
            state.is_active && state.active_mode == Some(HotkeyMode::Toggle),
            Followup::None,
        )
    } else {
        let suppress = state.is_active && state.active_mode == Some(HotkeyMode::Toggle);
        if state.toggle.all_codes().contains(&code) {
            state.toggle_armed = false;
        }
        state.codes_pressed.remove(&code);
        (suppress, Followup::None)
    }
}

fn run_followup(
    state: &Arc<Mutex<HotkeyState>>,
    on_start: &EventCallback,
    on_stop: &EventCallback,
    followup: Followup,
) {
    match followup {
        Followup::None => {}
        Followup::FireStart => {
            let on_start = Arc::clone(on_start);
            thread::spawn(move || on_start());
        }
        Followup::FireStop => {
            let on_stop = Arc::clone(on_stop);
            thread::spawn(move || on_stop());
        }
        Followup::Replay(code) => {
            thread::spawn(move || hook::replay_key(code));
        }
        Followup::ArmTimer { gen, delay_ms } => {
            let state = Arc::clone(state);
            let on_start = Arc::clone(on_start);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay_ms));
                ptt_timer_fired(&state, &on_start, gen);
            });
        }
    }
}

/// One-shot long-press timer. A stale generation means the press ended or
/// bindings changed while we slept.
fn ptt_timer_fired(state: &Arc<Mutex<HotkeyState>>, on_start: &EventCallback, gen: u64) {
    let fire = {
        let mut state = state.lock().unwrap();
        if state.ptt_timer_gen != gen || state.ptt_press_at.is_none() {
            false
        } else {
            state.ptt_long_triggered = true;
            state.is_active = true;
            state.active_mode = Some(HotkeyMode::PushToTalk);
            info!("PTT long-press triggered");
            true
        }
    };
    if fire {
        on_start();
    }
}
