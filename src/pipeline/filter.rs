//! Content filter: strip reasoning traces and runtime noise from model text.
//!
//! Reasoning models wrap their chain of thought in `<think>…</think>`, and
//! command-line runtimes echo prompts, token statistics and chat-template
//! tokens around the answer. None of it belongs in the Markdown.
//!
//! [`filter_output`] is pure and idempotent. Text without any marker or
//! noise line comes back byte-for-byte; otherwise removals are repeated until
//! nothing more matches, then the blank-line runs they leave behind are
//! collapsed and the result is trimmed.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>.*?</think>").unwrap());

/// An opening marker with no close swallows the rest of the text.
static RE_THINK_UNTERMINATED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<think>.*\z").unwrap());

/// A close with no opening (the template emitted `<think>` for the model):
/// everything before it is reasoning.
static RE_THINK_STRAY_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\A.*?</think>").unwrap());

static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").unwrap());

/// Trimmed lines starting with any of these are runtime noise.
const NOISE_PREFIXES: [&str; 11] = [
    "Prompt:",
    "Generation:",
    "Peak memory:",
    "Files:",
    "You are a helpful assistant",
    "<|im_start|>",
    "<|im_end|>",
    "<|vision_start|>",
    "<|vision_end|>",
    "<|image_pad|>",
    "<|endoftext|>",
];

const NOISE_RULE: &str = "==========";

/// Remove reasoning segments and boilerplate lines from raw model output.
pub fn filter_output(raw: &str) -> String {
    let mut text = raw.to_string();
    let mut removed_any = false;
    while let Some(next) = strip_once(&text) {
        text = next;
        removed_any = true;
    }
    if !removed_any {
        return text;
    }
    RE_BLANK_RUNS.replace_all(&text, "\n\n").trim().to_string()
}

/// One removal pass; `None` when nothing matched.
fn strip_once(text: &str) -> Option<String> {
    if RE_THINK_BLOCK.is_match(text) {
        return Some(RE_THINK_BLOCK.replace_all(text, "").into_owned());
    }
    if RE_THINK_UNTERMINATED.is_match(text) {
        return Some(RE_THINK_UNTERMINATED.replace(text, "").into_owned());
    }
    if RE_THINK_STRAY_CLOSE.is_match(text) {
        return Some(RE_THINK_STRAY_CLOSE.replace(text, "").into_owned());
    }
    if text.split('\n').any(is_noise_line) {
        let kept: Vec<&str> = text.split('\n').filter(|l| !is_noise_line(l)).collect();
        return Some(kept.join("\n"));
    }
    None
}

fn is_noise_line(line: &str) -> bool {
    let l = line.trim();
    !l.is_empty() && (l == NOISE_RULE || NOISE_PREFIXES.iter().any(|p| l.starts_with(p)))
}
