//! Built-in prompts and prompt selection.
//!
//! A batch uses exactly one prompt text for every page of every file. The
//! caller picks it with a [`PromptSpec`]: either one of the named defaults
//! below or free-form custom text. [`PromptSpec::resolve`] runs once per
//! batch, before any page is dispatched.

use serde::{Deserialize, Serialize};

/// Describe the image in detail: main elements, colours, layout.
pub const DESCRIBE_PROMPT: &str = "Describe the content of this image in detail, including \
the main elements, colours and layout.";

/// Invoice / document-page extraction. Also the fallback for unknown names.
pub const INVOICE_PROMPT: &str = "Describe the information on this invoice or document page \
in detail using Markdown, including but not limited to: invoice number, date, amounts, \
merchant details and line items.";

/// Full-text extraction of a PDF page.
pub const PDF_EXTRACT_PROMPT: &str = r#"Carefully read this PDF page and extract all of its text, following these rules:

1. **Keep the original layout**: follow the document's paragraph structure, heading levels and list formatting
2. **Extract everything**: include titles, body text, figure captions, headers and footers
3. **Reproduce the structure**: use Markdown headings, lists and tables to mirror the page visually
4. **Keep numbering**: preserve existing numbering, bullets and quotations
5. **Tables**: render tables as Markdown tables
6. **Formulas**: keep mathematical formulas and special symbols as close to the original as possible

Output the extracted content directly, without any explanation or commentary."#;

/// Default text for the `custom` type when no custom text is supplied.
pub const CUSTOM_FALLBACK_PROMPT: &str =
    "Describe the information on this invoice or document page in detail using Markdown.";

/// Named prompt types in display order.
pub const PROMPT_TYPES: [&str; 4] = ["describe", "invoice", "pdf_extract", "custom"];

/// Look up the built-in text for a named prompt type.
pub fn default_prompt(prompt_type: &str) -> Option<&'static str> {
    match prompt_type {
        "describe" => Some(DESCRIBE_PROMPT),
        "invoice" => Some(INVOICE_PROMPT),
        "pdf_extract" => Some(PDF_EXTRACT_PROMPT),
        "custom" => Some(CUSTOM_FALLBACK_PROMPT),
        _ => None,
    }
}

/// How the caller selected the prompt for a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PromptSpec {
    /// One of [`PROMPT_TYPES`]; unknown names fall back to `invoice`.
    Named(String),
    /// User-supplied text; blank text falls back to the `custom` default.
    Custom(String),
}

impl Default for PromptSpec {
    fn default() -> Self {
        PromptSpec::Named("invoice".to_string())
    }
}

impl PromptSpec {
    /// Build a spec from the form-style pair (`prompt_type`, `custom_prompt`).
    ///
    /// Custom text only wins when the type is `custom`.
    pub fn from_form(prompt_type: &str, custom_prompt: Option<&str>) -> Self {
        match (prompt_type, custom_prompt) {
            ("custom", Some(text)) if !text.trim().is_empty() => {
                PromptSpec::Custom(text.trim().to_string())
            }
            (name, _) => PromptSpec::Named(name.to_string()),
        }
    }

    /// The prompt text every page of the batch will receive.
    pub fn resolve(&self) -> String {
        match self {
            PromptSpec::Custom(text) if !text.trim().is_empty() => text.trim().to_string(),
            PromptSpec::Custom(_) => CUSTOM_FALLBACK_PROMPT.to_string(),
            PromptSpec::Named(name) => default_prompt(name).unwrap_or(INVOICE_PROMPT).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_named_type_has_text() {
        for name in PROMPT_TYPES {
            assert!(default_prompt(name).is_some(), "missing prompt for {name}");
        }
    }

    #[test]
    fn unknown_type_falls_back_to_invoice() {
        let spec = PromptSpec::Named("poetry".into());
        assert_eq!(spec.resolve(), INVOICE_PROMPT);
    }

    #[test]
    fn custom_text_wins_only_for_custom_type() {
        let spec = PromptSpec::from_form("custom", Some("  List every date.  "));
        assert_eq!(spec.resolve(), "List every date.");

        let spec = PromptSpec::from_form("describe", Some("ignored"));
        assert_eq!(spec.resolve(), DESCRIBE_PROMPT);
    }

    #[test]
    fn blank_custom_text_uses_custom_default() {
        let spec = PromptSpec::from_form("custom", Some("   "));
        assert_eq!(spec, PromptSpec::Named("custom".into()));
        assert_eq!(spec.resolve(), CUSTOM_FALLBACK_PROMPT);
        assert_eq!(PromptSpec::Custom(String::new()).resolve(), CUSTOM_FALLBACK_PROMPT);
    }

    #[test]
    fn default_spec_is_invoice() {
        assert_eq!(PromptSpec::default().resolve(), INVOICE_PROMPT);
    }
}
