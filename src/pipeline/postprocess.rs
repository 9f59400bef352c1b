//! Markdown polish: deterministic cleanup of a filtered page body.
//!
//! The content filter removes things that are not part of the answer; this
//! module tidies the answer itself before the assembler stitches pages
//! together. Models routinely wrap the whole reply in a ```` ```markdown ````
//! fence despite being told not to, emit CRLF line endings, or invent image
//! links to files that do not exist.
//!
//! Rules (applied in order):
//! 1. Strip an outer Markdown fence wrapping the whole body
//! 2. Normalise line endings (CRLF / CR → LF)
//! 3. Trim trailing whitespace per line
//! 4. Collapse runs of blank lines to a single blank line
//! 5. Replace placeholder image links with their alt text
//! 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
//! 7. Trim the body; the assembler owns the surrounding newlines

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every polish rule to one page body.
pub fn polish_markdown(input: &str) -> String {
    let s = strip_outer_fence(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = replace_placeholder_images(&s);
    let s = remove_invisible_chars(&s);
    s.trim().to_string()
}

// ── Rule 1: Outer fence ──────────────────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A```(?:markdown|md)?[ \t]*\r?\n(.*?)\r?\n```[ \t]*\z").unwrap());

fn strip_outer_fence(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCE.captures(trimmed) {
        // An inner fence means the outer one is not a wrapper but a code block.
        Some(caps) if !caps[1].contains("```") => caps[1].to_string(),
        _ => input.to_string(),
    }
}

// ── Rule 2: Line endings ─────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trailing whitespace ──────────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

// ── Rule 4: Blank lines ──────────────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").into_owned()
}

// ── Rule 5: Placeholder images ───────────────────────────────────────────────
//
// The model only ever sees a picture of the page, so any image link it writes
// is invented unless it points at a real absolute URL. Invented links keep
// their alt text as an italic caption.

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

const PLACEHOLDER_DOMAINS: [&str; 7] = [
    "example.com",
    "placeholder.com",
    "via.placeholder.com",
    "dummyimage.com",
    "lorempixel.com",
    "picsum.photos",
    "placehold.it",
];

fn is_placeholder_url(url: &str) -> bool {
    let u = url.trim();
    if !(u.starts_with("http://") || u.starts_with("https://")) {
        return true;
    }
    PLACEHOLDER_DOMAINS.iter().any(|d| u.contains(d))
}

fn replace_placeholder_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            if !is_placeholder_url(&caps[2]) {
                caps[0].to_string()
            } else if alt.is_empty() {
                String::new()
            } else {
                format!("*{alt}*")
            }
        })
        .into_owned()
}

// ── Rule 6: Invisible characters ─────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}
