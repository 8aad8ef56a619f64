use std::collections::BTreeSet;

use unicode_normalization::UnicodeNormalization;

use crate::error::{ChatStreamError, CoreResult};
use crate::model::{DocumentRef, PromptRequest};

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Cleaned prompt text, or `None` when nothing but whitespace was submitted.
pub fn normalize_prompt(prompt: &str) -> Option<String> {
    let t = clean_text(prompt);
    (!t.is_empty()).then_some(t)
}

/// Trim refs, drop empties and duplicates; the set keeps a stable order.
pub fn normalize_document_refs<I>(refs: I) -> BTreeSet<DocumentRef>
where
    I: IntoIterator<Item = DocumentRef>,
{
    refs.into_iter()
        .map(|r| r.0.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(DocumentRef)
        .collect()
}

/// Build the request for a prompt: normalized text and refs. An empty prompt
/// is a `Validation` error.
pub fn prompt_request<I>(prompt: &str, refs: I) -> CoreResult<PromptRequest>
where
    I: IntoIterator<Item = DocumentRef>,
{
    let text = normalize_prompt(prompt)
        .ok_or_else(|| ChatStreamError::Validation("prompt is empty".into()))?;
    Ok(PromptRequest {
        text,
        document_refs: normalize_document_refs(refs).into_iter().collect(),
    })
}
