//! Highlight bookkeeping and matching against extracted page text.
//!
//! A highlight is stored either as a text pattern or, when the selection layer can provide
//! one, as an anchor into the page text. Pattern highlights mark every case-insensitive
//! occurrence on their page; anchored highlights mark only their own range.

use std::ops::Range;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::NormalizedRect;

/// Character offsets into the extracted text of a page, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextAnchor {
    pub start: usize,
    pub end: usize,
}

impl TextAnchor {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub page: usize,
    pub text: String,
    pub regions: Vec<NormalizedRect>,
    pub anchor: Option<TextAnchor>,
}

impl Highlight {
    pub fn pattern(page: usize, text: impl Into<String>, regions: Vec<NormalizedRect>) -> Self {
        Self {
            page,
            text: text.into(),
            regions,
            anchor: None,
        }
    }

    pub fn anchored(
        page: usize,
        text: impl Into<String>,
        regions: Vec<NormalizedRect>,
        anchor: TextAnchor,
    ) -> Self {
        Self {
            page,
            text: text.into(),
            regions,
            anchor: Some(anchor),
        }
    }
}

/// How stored highlights are resolved against page text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightMode {
    /// Every highlight is treated as a pattern, anchors are ignored.
    Pattern,
    /// Anchors are honoured when they still match the text.
    #[default]
    Anchored,
}

/// Byte ranges of `text` covered by `highlights`, sorted and merged.
///
/// Only highlights whose `page` equals `page` participate.
pub fn match_spans(
    text: &str,
    page: usize,
    highlights: &[Highlight],
    mode: HighlightMode,
) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    for highlight in highlights.iter().filter(|h| h.page == page) {
        if highlight.text.is_empty() {
            continue;
        }
        let anchored = match (mode, highlight.anchor) {
            (HighlightMode::Anchored, Some(anchor)) => resolve_anchor(text, &highlight.text, anchor),
            _ => None,
        };
        match anchored {
            Some(range) => spans.push(range),
            None => spans.extend(pattern_spans(text, &highlight.text)),
        }
    }
    merge(spans)
}

/// All case-insensitive occurrences of `needle` in `haystack`.
pub fn pattern_spans(haystack: &str, needle: &str) -> Vec<Range<usize>> {
    if needle.is_empty() {
        return Vec::new();
    }
    let regex = match RegexBuilder::new(&regex::escape(needle))
        .case_insensitive(true)
        .build()
    {
        Ok(regex) => regex,
        Err(err) => {
            debug!(?err, "highlight pattern rejected");
            return Vec::new();
        }
    };
    regex.find_iter(haystack).map(|m| m.range()).collect()
}

fn resolve_anchor(text: &str, expected: &str, anchor: TextAnchor) -> Option<Range<usize>> {
    if anchor.start >= anchor.end {
        return None;
    }
    let mut indices = text
        .char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(text.len()));
    let start = indices.nth(anchor.start)?;
    let end = indices.nth(anchor.end - anchor.start - 1)?;
    let slice = &text[start..end];
    if slice.to_lowercase() == expected.to_lowercase() {
        Some(start..end)
    } else {
        None
    }
}

fn merge(mut spans: Vec<Range<usize>>) -> Vec<Range<usize>> {
    spans.sort_by_key(|r| (r.start, r.end));
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}
