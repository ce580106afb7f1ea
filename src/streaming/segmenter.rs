//! Sentence segmentation of token streams.
//!
//! Tokens arrive in arbitrary fragments ("Dr", ". Sm", "ith"), so the
//! segmenter buffers text and only emits a sentence once the character after
//! its terminator is known. A terminator (`.`, `!`, `?`, `…`, optionally
//! followed by closing quotes/brackets) ends a sentence only when followed by
//! whitespace. That rule alone keeps decimals (`3.14`) and URLs
//! (`https://a.b/c.d`) intact; a short abbreviation list plus an initials
//! rule (`J.`, `U.S.`) handles the rest. A blank line also ends a sentence.
//!
//! Sentences shorter than the configured minimum are held back and merged
//! with what follows, so "Hi." never goes out on its own.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Default minimum sentence length, in characters.
pub const DEFAULT_MIN_SENTENCE_CHARS: usize = 12;

/// Words that end in a period without ending a sentence (lower-case, no dot).
const ABBREVIATIONS: &[&str] = &[
    "dr", "mr", "mrs", "ms", "prof", "sr", "jr", "st", "mt", "vs", "etc", "inc", "ltd", "co",
    "corp", "no", "nos", "fig", "approx", "dept", "est", "gen", "gov", "rev", "sgt", "capt", "lt",
    "col", "jan", "feb", "mar", "apr", "jun", "jul", "aug", "sep", "sept", "oct", "nov", "dec",
];

const TERMINATORS: &[char] = &['.', '!', '?', '…'];
const CLOSERS: &[char] = &['"', '\'', ')', ']', '”', '’'];

/// Result of scanning for the next boundary.
#[derive(Debug, PartialEq)]
enum Scan {
    /// A sentence ends at this byte offset.
    Boundary(usize),
    /// A possible boundary at this offset needs more input to decide.
    NeedMore(usize),
    /// No candidate in the rest of the buffer.
    Exhausted,
}

/// Per-request buffer.
#[derive(Debug, Default)]
struct StreamSession {
    buffer: String,
    /// Byte offset where scanning resumes.
    cursor: usize,
    emitted: usize,
}

/// Splits a token stream into sentences.
///
/// All methods take `&self`; [`cancel`](Self::cancel) may be called from
/// another task while `feed` is running. After cancellation every further
/// `feed` and `finish` is a no-op. Sentences already returned stay returned.
#[derive(Debug)]
pub struct Segmenter {
    session: Mutex<StreamSession>,
    min_chars: usize,
    cancel: CancellationToken,
}

impl Segmenter {
    pub fn new(min_chars: usize) -> Self {
        Self::with_cancel(min_chars, CancellationToken::new())
    }

    /// Segmenter that stops when `cancel` fires (e.g. the request's token).
    pub fn with_cancel(min_chars: usize, cancel: CancellationToken) -> Self {
        Self {
            session: Mutex::new(StreamSession::default()),
            min_chars,
            cancel,
        }
    }

    /// Append a token chunk; returns every sentence it completed.
    pub fn feed(&self, chunk: &str) -> Vec<String> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        let mut session = self.lock();
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        session.buffer.push_str(chunk);
        let sentences = self.drain(&mut session);
        session.emitted += sentences.len();
        sentences
    }

    /// Flush the trailing partial sentence, if any.
    pub fn finish(&self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let mut session = self.lock();
        let rest = session.buffer.trim().to_string();
        session.buffer.clear();
        session.cursor = 0;
        if rest.is_empty() {
            return None;
        }
        session.emitted += 1;
        Some(rest)
    }

    /// Stop segmenting. Buffered text is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let mut session = self.lock();
        session.buffer.clear();
        session.cursor = 0;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sentences emitted so far, including a flushed remainder.
    pub fn emitted(&self) -> usize {
        self.lock().emitted
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamSession> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn drain(&self, session: &mut StreamSession) -> Vec<String> {
        let mut sentences = Vec::new();
        let mut start = 0;
        let mut cursor = session.cursor;

        loop {
            match next_boundary(&session.buffer, cursor) {
                Scan::Boundary(end) => {
                    let candidate = session.buffer[start..end].trim();
                    if candidate.chars().count() >= self.min_chars {
                        sentences.push(candidate.to_string());
                        start = end;
                    }
                    cursor = end;
                }
                Scan::NeedMore(at) => {
                    cursor = at;
                    break;
                }
                Scan::Exhausted => {
                    cursor = session.buffer.len();
                    break;
                }
            }
        }

        session.buffer.drain(..start);
        session.cursor = cursor - start;
        sentences
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SENTENCE_CHARS)
    }
}

fn next_boundary(text: &str, from: usize) -> Scan {
    let mut chars = text[from..].char_indices().map(|(i, c)| (i + from, c)).peekable();

    while let Some((idx, c)) = chars.next() {
        if c == '\n' {
            match chars.peek() {
                Some((_, '\n')) => {
                    let (next, _) = chars.next().unwrap_or((idx, '\n'));
                    return Scan::Boundary(next + 1);
                }
                None => return Scan::NeedMore(idx),
                Some(_) => continue,
            }
        }
        if !TERMINATORS.contains(&c) {
            continue;
        }

        // Swallow a run of terminators and closing punctuation.
        let mut end = idx + c.len_utf8();
        let mut run = 1;
        while let Some(&(j, next)) = chars.peek() {
            if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                if TERMINATORS.contains(&next) {
                    run += 1;
                }
                end = j + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        match chars.peek() {
            None => return Scan::NeedMore(idx),
            Some((_, next)) if !next.is_whitespace() => continue,
            Some(_) => {}
        }

        if c == '.' && run == 1 {
            let word = word_before(text, idx);
            if is_abbreviation(word) {
                continue;
            }
            if is_initial(word) {
                if is_initial_with_dot(word_before_word(text, idx - word.len())) {
                    continue;
                }
                match next_is_initial(&text[end..]) {
                    None => return Scan::NeedMore(idx),
                    Some(true) => continue,
                    Some(false) => {}
                }
            }
        }
        return Scan::Boundary(end);
    }
    Scan::Exhausted
}

/// The whitespace-delimited word ending at `idx`, without leading brackets/quotes.
fn word_before(text: &str, idx: usize) -> &str {
    let head = &text[..idx];
    let start = head
        .rfind(char::is_whitespace)
        .map(|i| i + head[i..].chars().next().map_or(1, char::len_utf8))
        .unwrap_or(0);
    head[start..].trim_start_matches(['(', '[', '"', '\'', '“', '‘'])
}

fn is_abbreviation(word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let lower = word.to_lowercase();
    if ABBREVIATIONS.contains(&lower.as_str()) {
        return true;
    }
    // Dotted abbreviations: "U.S", "e.g", "Ph.D"
    lower.contains('.')
        && lower
            .split('.')
            .all(|part| (1..=2).contains(&part.chars().count()) && part.chars().all(char::is_alphabetic))
}

/// A lone capital letter, e.g. the "R" in "J. R. R. Tolkien".
fn is_initial(word: &str) -> bool {
    let mut chars = word.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_uppercase())
}

fn is_initial_with_dot(word: &str) -> bool {
    word.strip_suffix('.').is_some_and(is_initial)
}

/// The whitespace-delimited word before the one starting at `word_start`.
fn word_before_word(text: &str, word_start: usize) -> &str {
    let head = text[..word_start].trim_end();
    word_before(head, head.len())
}

/// Whether the text after a sentence candidate opens with another initial
/// ("R. "). A single letter only joins a chain of initials; "I." or
/// "Plan B." on their own end the sentence. `None` until enough text arrived.
fn next_is_initial(rest: &str) -> Option<bool> {
    let mut chars = rest.trim_start().chars();
    let letter = chars.next()?;
    if !letter.is_uppercase() {
        return Some(false);
    }
    if chars.next()? != '.' {
        return Some(false);
    }
    Some(chars.next()?.is_whitespace())
}
