//! Text injection into the focused application via clipboard + synthesized
//! paste chord. Clipboard contents can be saved and restored around a
//! session so dictation does not clobber what the user had copied.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use arboard::Clipboard;
use enigo::{Direction, Enigo, Key as EnigoKey, Keyboard, Settings};
use tracing::{debug, info, warn};

use crate::hotkeys::{hook, KeyCode};

// Clipboard access on some platforms fails transiently when another app
// holds the clipboard open; retry a few times before giving up silently.
const CLIPBOARD_RETRIES: u32 = 3;
const CLIPBOARD_RETRY_DELAY: Duration = Duration::from_millis(50);

// Let the target app read the clipboard before we put the old content back.
const RESTORE_DELAY: Duration = Duration::from_millis(300);

/// Side-effecting text output contract consumed by the session worker.
pub trait TextInject: Send {
    /// Single-shot injection: saves and restores the clipboard around itself
    /// when restore is enabled.
    fn inject_text(&mut self, text: &str);
    /// Injection without touching the saved clipboard; used for intermediate
    /// segments of a progressive session (restore happens once, at the end).
    fn inject_text_no_restore(&mut self, text: &str);
    /// Inject a single character (the deferred sentence terminator).
    fn inject_char(&mut self, ch: char);
    fn save_clipboard(&mut self);
    fn restore_saved_clipboard(&mut self);
    /// Key codes owned by hotkey bindings; the injector must not release
    /// these when synthesizing the paste shortcut.
    fn set_claimed_keys(&mut self, keys: Vec<KeyCode>);
}

pub struct ClipboardInjector {
    restore_clipboard: bool,
    saved: Option<String>,
    claimed: HashSet<KeyCode>,
}

impl ClipboardInjector {
    pub fn new(restore_clipboard: bool) -> Self {
        Self {
            restore_clipboard,
            saved: None,
            claimed: HashSet::new(),
        }
    }

    pub fn set_restore_clipboard(&mut self, restore: bool) {
        self.restore_clipboard = restore;
    }

    fn get_clipboard() -> Option<String> {
        for attempt in 0..CLIPBOARD_RETRIES {
            match Clipboard::new().and_then(|mut c| c.get_text()) {
                Ok(text) => return Some(text),
                Err(e) => {
                    debug!("Clipboard read failed (attempt {}): {}", attempt + 1, e);
                    thread::sleep(CLIPBOARD_RETRY_DELAY);
                }
            }
        }
        None
    }

    fn set_clipboard(text: &str) -> bool {
        for attempt in 0..CLIPBOARD_RETRIES {
            match Clipboard::new().and_then(|mut c| c.set_text(text.to_string())) {
                Ok(()) => return true,
                Err(e) => {
                    debug!("Clipboard write failed (attempt {}): {}", attempt + 1, e);
                    thread::sleep(CLIPBOARD_RETRY_DELAY);
                }
            }
        }
        warn!("Failed to set clipboard after {} attempts", CLIPBOARD_RETRIES);
        false
    }

    fn restore_later(text: String) {
        thread::spawn(move || {
            thread::sleep(RESTORE_DELAY);
            Self::set_clipboard(&text);
        });
    }

    /// Log preview truncated on a char boundary (injected text is often CJK).
    fn preview(text: &str) -> &str {
        if text.len() <= 80 {
            return text;
        }
        let mut end = 80;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }

    /// Whether a binding claims any variant of the given modifier pair.
    fn claims_any(&self, codes: &[KeyCode]) -> bool {
        codes.iter().any(|c| self.claimed.contains(c))
    }

    /// Synthesize the platform paste shortcut. Marked as injected input so
    /// the keyboard hook ignores the chord.
    fn send_paste(&self) {
        let _guard = hook::InjectionGuard::new();

        let mut enigo = match Enigo::new(&Settings::default()) {
            Ok(e) => e,
            Err(e) => {
                warn!("Enigo init failed: {:?}", e);
                return;
            }
        };

        // A modifier physically held for the hotkey would corrupt the chord.
        // Release the plain ones first, but leave hotkey-claimed modifiers
        // alone so the gesture keeps working.
        use rdev::Key as R;
        if !self.claims_any(&[R::ShiftLeft, R::ShiftRight]) {
            let _ = enigo.key(EnigoKey::Shift, Direction::Release);
        }
        if !self.claims_any(&[R::Alt, R::AltGr]) {
            let _ = enigo.key(EnigoKey::Alt, Direction::Release);
        }

        #[cfg(target_os = "macos")]
        {
            let _ = enigo.key(EnigoKey::Meta, Direction::Press);
            let _ = enigo.key(EnigoKey::Unicode('v'), Direction::Click);
            let _ = enigo.key(EnigoKey::Meta, Direction::Release);
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = enigo.key(EnigoKey::Control, Direction::Press);
            let _ = enigo.key(EnigoKey::Unicode('v'), Direction::Click);
            let _ = enigo.key(EnigoKey::Control, Direction::Release);
        }
        // Keep the injected marker up until the chord has been delivered
        // through the hook.
        thread::sleep(Duration::from_millis(20));
    }

    fn paste_text(&self, text: &str) -> bool {
        if !Self::set_clipboard(text) {
            return false;
        }
        // Clipboard writes are synchronous; a short yield lets the OS
        // finalise the write before the paste lands.
        thread::sleep(Duration::from_millis(10));
        self.send_paste();
        true
    }
}

impl TextInject for ClipboardInjector {
    fn inject_text(&mut self, text: &str) {
        if text.trim().is_empty() {
            info!("Empty text, skipping injection");
            return;
        }

        let previous = if self.restore_clipboard {
            Self::get_clipboard()
        } else {
            None
        };

        if self.paste_text(text) {
            info!("Injected text: {}", Self::preview(text));
        }

        if let Some(previous) = previous {
            Self::restore_later(previous);
        }
    }

    fn inject_text_no_restore(&mut self, text: &str) {
        if text.trim().is_empty() {
            info!("Empty text, skipping injection");
            return;
        }
        if self.paste_text(text) {
            info!("Injected text (no restore): {}", Self::preview(text));
        }
    }

    fn inject_char(&mut self, ch: char) {
        let _guard = hook::InjectionGuard::new();
        let mut enigo = match Enigo::new(&Settings::default()) {
            Ok(e) => e,
            Err(e) => {
                warn!("Enigo init failed: {:?}", e);
                return;
            }
        };
        if let Err(e) = enigo.text(&ch.to_string()) {
            warn!("Failed to type character {:?}: {:?}", ch, e);
        }
    }

    fn save_clipboard(&mut self) {
        self.saved = Self::get_clipboard();
    }

    fn restore_saved_clipboard(&mut self) {
        if let Some(saved) = self.saved.take() {
            Self::restore_later(saved);
        }
    }

    fn set_claimed_keys(&mut self, keys: Vec<KeyCode>) {
        self.claimed = keys.into_iter().collect();
    }
}
