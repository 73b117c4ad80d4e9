//! Escape-sequence normalization for the two rendering targets.
//!
//! Terminal-emulating views want the raw stream minus the decorative
//! horizontal rules that agent CLIs print between turns. Plain-text views
//! (narrow screens, log dumps) want everything stripped, and need to know
//! when a chunk cleared the screen so they can replace rather than append.
//!
//! Every function here is a pure function of its input.

use once_cell::sync::Lazy;
use regex::Regex;

/// Run of ten or more `─`, optionally wrapped in SGR color sequences.
static DECORATIVE_RULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\x1b\[[0-9;]*m)*─{10,}(?:\x1b\[[0-9;]*m)*")
        .expect("decorative rule pattern")
});

/// OSC: `ESC ]` up to BEL or ST (or end of chunk when unterminated).
static OSC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?").expect("osc pattern"));

/// CSI: `ESC [`, parameter bytes, intermediate bytes, one final byte.
static CSI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?<=>]*[ -/]*[@-~]").expect("csi pattern"));

/// Two-byte escapes such as `ESC 7`, `ESC M`, `ESC =`.
static SINGLE_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b[^\[\]]").expect("single escape pattern"));

/// C0 controls and DEL, except `\n` and `\r` which are handled separately.
static CONTROL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\x00-\x09\x0b\x0c\x0e-\x1f\x7f]").expect("control pattern")
});

/// CSI remnants whose ESC byte was lost upstream: `[2C`, `[27m`, `[?2026h`.
static ORPHAN_CSI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\??\d+(?:;\d+)*[A-Za-z]").expect("orphan csi pattern"));

static CLEAR_SCREEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[2J|\x1b\[H\x1b\[J").expect("clear screen pattern"));

/// Rendering strategy chosen explicitly by a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NormalizeMode {
    /// Full-fidelity terminal rendering: escape sequences pass through.
    #[default]
    Passthrough,
    /// Constrained rendering: all escape sequences removed.
    PlainText,
}

impl NormalizeMode {
    pub fn apply(self, text: &str) -> String {
        match self {
            NormalizeMode::Passthrough => filter_passthrough(text),
            NormalizeMode::PlainText => strip_plain(text),
        }
    }
}

pub fn normalize(mode: NormalizeMode, text: &str) -> String {
    mode.apply(text)
}

/// Removes decorative horizontal rules and leaves every other byte alone.
pub fn filter_passthrough(text: &str) -> String {
    DECORATIVE_RULE.replace_all(text, "").into_owned()
}

/// Strips all recognized escape and control sequences, bare carriage
/// returns, and decorative rules.
pub fn strip_plain(text: &str) -> String {
    let mut current = strip_once(text);
    // A removal can splice two fragments into a new match; repeat until stable
    // so that stripping already-stripped text is a no-op.
    loop {
        let next = strip_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_once(text: &str) -> String {
    let text = OSC.replace_all(text, "");
    let text = CSI.replace_all(&text, "");
    let text = SINGLE_ESCAPE.replace_all(&text, "");
    let text = CONTROL.replace_all(&text, "");
    let text = ORPHAN_CSI.replace_all(&text, "");
    let text = drop_bare_carriage_returns(&text);
    DECORATIVE_RULE.replace_all(&text, "").into_owned()
}

fn drop_bare_carriage_returns(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\r' && chars.peek() != Some(&'\n') {
            continue;
        }
        out.push(ch);
    }
    out
}

/// Collapses in-place redraws: for every line keep only what follows the
/// last carriage return, the way a terminal would show it.
pub fn process_carriage_returns(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            match line.rfind('\r') {
                Some(idx) => &line[idx + 1..],
                None => line,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// True when the raw chunk contains `ESC[2J` or `ESC[H ESC[J`.
pub fn is_clear_screen(raw: &str) -> bool {
    CLEAR_SCREEN.is_match(raw)
}

/// What a plain-text consumer should do with a raw chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAction {
    Append(String),
    Replace(String),
}

impl ChunkAction {
    pub fn content(&self) -> &str {
        match self {
            ChunkAction::Append(content) | ChunkAction::Replace(content) => content,
        }
    }
}

pub fn classify_chunk(raw: &str) -> ChunkAction {
    let stripped = strip_plain(raw);
    if is_clear_screen(raw) {
        ChunkAction::Replace(stripped)
    } else {
        ChunkAction::Append(stripped)
    }
}

/// Display buffer for a plain-text view, honouring clear-screen chunks.
#[derive(Debug, Clone, Default)]
pub struct PlainTextView {
    text: String,
}

impl PlainTextView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the view from a persisted transcript. Only what follows the
    /// last clear-screen in the history is still on screen.
    pub fn from_transcript(transcript: &str) -> Self {
        let visible = match CLEAR_SCREEN.find_iter(transcript).last() {
            Some(clear) => &transcript[clear.end()..],
            None => transcript,
        };
        Self {
            text: strip_plain(visible),
        }
    }

    pub fn push(&mut self, raw: &str) {
        match classify_chunk(raw) {
            ChunkAction::Append(content) => self.text.push_str(&content),
            ChunkAction::Replace(content) => self.text = content,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}
