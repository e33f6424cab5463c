//! Post-processing for ASR output: filler removal and punctuation
//! normalization, plus the cross-segment deferred-terminator logic used in
//! progressive sessions.

use once_cell::sync::Lazy;
use regex::Regex;

// Sentence punctuation class shared by several patterns (CJK + ASCII).
const PUNCT: &str = "，。！？；：、,.!?;:";

// ── Filler patterns ──────────────────────────────────────────────────────────

// Utterances that are nothing but filler particles collapse to empty output.
static RE_STANDALONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*[嗯呃哦唔啊哎呦]*[，,、\s]*[嗯呃哦唔啊哎呦，,、\s]*\s*$").unwrap()
});

// Stuttering / repeated filler phrases (always removed).
static RE_STUTTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(那个|然后|就是|这个){2,}").unwrap());

// Clause-opener filler at start of text or right after punctuation.
static RE_CLAUSE_OPENER: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(^|[{PUNCT}])\s*就是说[，,]?\s*")).unwrap());

// Single-char particles at start, end, or sandwiched between punctuation.
static RE_PARTICLE_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[嗯呃哦唔啊呦]+[，,]?\s*").unwrap());
static RE_PARTICLE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[，,]?[嗯呃哦唔啊呦]+$").unwrap());
static RE_PARTICLE_BETWEEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"([{PUNCT}])\s*[嗯呃哦唔啊呦]+\s*([{PUNCT}])")).unwrap());

// Interjections at utterance boundaries only.
static RE_INTERJECTION_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(哎呀|哎哟|哎|呐)[，,]?\s*").unwrap());
static RE_INTERJECTION_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[，,]?(哎呀|哎哟|哎|呐)$").unwrap());

// End-of-utterance softening particles (trailing only).
static RE_SOFTENER_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[啦嘛呗]+$").unwrap());

// ── English filler patterns ──────────────────────────────────────────────────

static RE_EN_STANDALONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(um+|uh+|hmm+|mm+|er+)[,.]?\s*$").unwrap());
static RE_EN_FILLER_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(um+|uh+|hmm+|mm+|er+)[,\s]+").unwrap());
static RE_EN_FILLER_MID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i),\s*(um+|uh+|hmm+|mm+|er+)\s*,").unwrap());

// ── Punctuation patterns ─────────────────────────────────────────────────────

static RE_DOUBLE_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r"[，,]{2,}").unwrap());
static RE_LEADING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[，,]\s*").unwrap());
static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[，,]$").unwrap());
static RE_DOUBLE_PERIOD: Lazy<Regex> = Lazy::new(|| Regex::new(r"。{2,}").unwrap());

/// Single cleanup pass over one transcribed segment. Returns an empty string
/// for pure-filler utterances. Trailing sentence terminators are left in
/// place; [`TextProcessor::process`] owns the deferral logic.
pub fn process_text(text: &str, remove_fillers: bool, smart_punctuation: bool) -> String {
    let mut t = text.trim().to_string();
    if t.is_empty() {
        return t;
    }

    if remove_fillers {
        if RE_EN_STANDALONE.is_match(&t) || RE_STANDALONE.is_match(&t) {
            return String::new();
        }

        t = RE_EN_FILLER_START.replace_all(&t, "").into_owned();
        t = RE_EN_FILLER_MID.replace_all(&t, ",").into_owned();
        t = RE_STUTTER.replace_all(&t, "").into_owned();
        t = RE_CLAUSE_OPENER.replace_all(&t, "${1}").into_owned();
        t = RE_SOFTENER_END.replace_all(&t, "").into_owned();
        t = RE_INTERJECTION_START.replace_all(&t, "").into_owned();
        t = RE_INTERJECTION_END.replace_all(&t, "").into_owned();
        t = RE_PARTICLE_BETWEEN.replace_all(&t, "${1}，${2}").into_owned();
        t = RE_PARTICLE_START.replace_all(&t, "").into_owned();
        t = RE_PARTICLE_END.replace_all(&t, "").into_owned();
    }

    if smart_punctuation {
        t = RE_DOUBLE_PERIOD.replace_all(&t, "。").into_owned();
    }

    if remove_fillers {
        // Comma artifacts left behind by filler removal.
        t = RE_DOUBLE_COMMA.replace_all(&t, "，").into_owned();
        t = RE_LEADING_COMMA.replace_all(&t, "").into_owned();
        t = RE_TRAILING_COMMA.replace_all(&t, "").into_owned();
    }

    t.trim().to_string()
}

/// Stateful wrapper carrying the deferred sentence terminator between
/// consecutive segments of one progressive session.
pub struct TextProcessor {
    remove_fillers: bool,
    smart_punctuation: bool,
    pending_period: Option<char>,
}

impl TextProcessor {
    pub fn new(remove_fillers: bool, smart_punctuation: bool) -> Self {
        Self {
            remove_fillers,
            smart_punctuation,
            pending_period: None,
        }
    }

    /// Update flags without recreating the object.
    pub fn update(&mut self, remove_fillers: bool, smart_punctuation: bool) {
        self.remove_fillers = remove_fillers;
        self.smart_punctuation = smart_punctuation;
    }

    /// Call at recording start so no terminator leaks across sessions.
    pub fn reset_session(&mut self) {
        self.pending_period = None;
    }

    /// Terminator deferred from the last processed segment, if any.
    pub fn pending_period(&self) -> Option<char> {
        self.pending_period
    }

    /// Returns and clears the pending terminator. Called once at session end
    /// so the final sentence still gets closed.
    pub fn consume_pending_period(&mut self) -> Option<char> {
        self.pending_period.take()
    }

    /// Count of characters that carry content (letters, ideographs, digits).
    /// Used by the session quality filter.
    pub fn meaningful_length(text: &str) -> usize {
        text.chars().filter(|c| c.is_alphanumeric()).count()
    }

    /// Process without deferral. For single-shot recordings where each
    /// utterance stands alone.
    pub fn process_simple(&self, text: &str) -> String {
        process_text(text, self.remove_fillers, self.smart_punctuation)
    }

    /// Process one segment of a progressive session. A trailing terminator is
    /// withheld; if the previous segment withheld one and this segment has
    /// content, the segments are joined with a clause separator instead —
    /// the earlier "sentence end" turned out to be a pause, not an end.
    pub fn process(&mut self, text: &str) -> String {
        let mut result = process_text(text, self.remove_fillers, self.smart_punctuation);

        if !self.smart_punctuation {
            return result;
        }

        if result.is_empty() {
            // Pure filler: the pending terminator survives the no-op segment.
            return result;
        }

        let mut new_pending = None;
        if result.ends_with('。') {
            result.pop();
            new_pending = Some('。');
        } else if result.ends_with('.') {
            result.pop();
            new_pending = Some('.');
        }

        if self.pending_period.is_some() && !result.is_empty() {
            result.insert(0, '，');
        }

        self.pending_period = new_pending;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_all_flags_off() {
        let processor = TextProcessor::new(false, false);
        assert_eq!(processor.process_simple("hello world"), "hello world");
        assert_eq!(processor.process_simple("嗯，今天不错"), "嗯，今天不错");
    }

    #[test]
    fn filler_only_utterance_collapses_to_empty() {
        assert_eq!(process_text("嗯，啊", true, true), "");
        assert_eq!(process_text("嗯嗯", true, true), "");
        assert_eq!(process_text("Um,", true, true), "");
        assert_eq!(process_text("uhhh", true, true), "");
    }

    #[test]
    fn leading_and_trailing_particles_are_stripped() {
        assert_eq!(process_text("嗯，今天天气不错", true, true), "今天天气不错");
        assert_eq!(process_text("今天天气不错，啊", true, true), "今天天气不错");
        assert_eq!(process_text("Um, let's start over", true, true), "let's start over");
    }

    #[test]
    fn stutter_and_softeners_removed() {
        assert_eq!(process_text("那个那个我想说", true, true), "我想说");
        assert_eq!(process_text("这样就可以啦", true, true), "这样就可以");
    }

    #[test]
    fn english_mid_sentence_filler_collapses_to_comma() {
        assert_eq!(
            process_text("so, um, we should go", true, true),
            "so, we should go"
        );
    }

    #[test]
    fn duplicate_periods_collapse() {
        assert_eq!(process_text("好的。。。然后呢", false, true), "好的。然后呢");
    }

    #[test]
    fn deferred_period_round_trip() {
        let mut processor = TextProcessor::new(false, true);
        processor.reset_session();

        let first = processor.process("今天天气很好。");
        assert_eq!(first, "今天天气很好");
        assert_eq!(processor.pending_period(), Some('。'));

        let second = processor.process("我们出去走走。");
        assert_eq!(second, "，我们出去走走");
        assert_eq!(processor.pending_period(), Some('。'));

        // Flushed exactly once at session end.
        assert_eq!(processor.consume_pending_period(), Some('。'));
        assert_eq!(processor.consume_pending_period(), None);
    }

    #[test]
    fn empty_segment_keeps_pending_period() {
        let mut processor = TextProcessor::new(true, true);
        processor.reset_session();

        assert_eq!(processor.process("好的。"), "好的");
        assert_eq!(processor.pending_period(), Some('。'));

        // A filler-only segment is a no-op: nothing emitted, nothing lost.
        assert_eq!(processor.process("嗯"), "");
        assert_eq!(processor.pending_period(), Some('。'));

        assert_eq!(processor.process("继续"), "，继续");
        assert_eq!(processor.pending_period(), None);
    }

    #[test]
    fn ascii_period_is_deferred_too() {
        let mut processor = TextProcessor::new(false, true);
        assert_eq!(processor.process("one moment."), "one moment");
        assert_eq!(processor.pending_period(), Some('.'));
    }

    #[test]
    fn reset_session_clears_pending() {
        let mut processor = TextProcessor::new(false, true);
        processor.process("好。");
        assert!(processor.pending_period().is_some());
        processor.reset_session();
        assert_eq!(processor.pending_period(), None);
    }

    #[test]
    fn simple_mode_leaves_terminator_in_place() {
        let processor = TextProcessor::new(false, true);
        assert_eq!(processor.process_simple("今天天气很好。"), "今天天气很好。");
    }

    #[test]
    fn meaningful_length_ignores_punctuation() {
        assert_eq!(TextProcessor::meaningful_length("嗯。"), 1);
        assert_eq!(TextProcessor::meaningful_length("，。！"), 0);
        assert_eq!(TextProcessor::meaningful_length("ok了"), 3);
    }
}
