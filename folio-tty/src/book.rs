//! Text layout for the book view.
//!
//! Page text is wrapped to a column whose width depends on the font size, keeping track
//! of which byte ranges of the original text are highlighted.

use std::io::Write;
use std::ops::Range;

use anyhow::Result;
use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::style::{Attribute, Print, SetAttribute, SetColors};
use crossterm::terminal::{Clear, ClearType};
use folio_core::{FontSize, ImageRef, PageContent};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::theme::Palette;

pub const PENDING_PLACEHOLDER: &str = "Loading page…";
pub const EMPTY_PLACEHOLDER: &str = "(no extractable text on this page)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub highlighted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Line {
    pub segments: Vec<Segment>,
}

impl Line {
    fn plain(text: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment {
                text: text.into(),
                highlighted: false,
            }],
        }
    }

    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// Width in terminal cells.
    pub fn width(&self) -> usize {
        self.segments.iter().map(|s| s.text.width()).sum()
    }

    fn push(&mut self, text: &str, highlighted: bool) {
        if text.is_empty() {
            return;
        }
        match self.segments.last_mut() {
            Some(last) if last.highlighted == highlighted => last.text.push_str(text),
            _ => self.segments.push(Segment {
                text: text.to_owned(),
                highlighted,
            }),
        }
    }
}

/// Column width and blank lines between text lines for a font size.
pub fn column_metrics(font_size: FontSize, available: usize) -> (usize, usize) {
    let (max_width, spacing) = match font_size {
        FontSize::Small => (100, 0),
        FontSize::Medium => (80, 0),
        FontSize::Large => (64, 1),
        FontSize::ExtraLarge => (48, 1),
    };
    (available.min(max_width).max(1), spacing)
}

enum Token {
    Word(Range<usize>),
    Break,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word_start: Option<usize> = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(start) = word_start.take() {
                tokens.push(Token::Word(start..idx));
            }
            if ch == '\n' {
                tokens.push(Token::Break);
            }
        } else if word_start.is_none() {
            word_start = Some(idx);
        }
    }
    if let Some(start) = word_start {
        tokens.push(Token::Word(start..text.len()));
    }
    tokens
}

/// Splits words wider than `width` cells at char boundaries. A single glyph wider than
/// `width` still gets a piece of its own.
fn split_long(text: &str, word: Range<usize>, width: usize) -> Vec<Range<usize>> {
    let slice = &text[word.clone()];
    if slice.width() <= width {
        return vec![word];
    }
    let mut pieces = Vec::new();
    let mut start = word.start;
    let mut cells = 0;
    for (idx, ch) in slice.char_indices() {
        let ch_width = ch.width().unwrap_or(0);
        if cells > 0 && cells + ch_width > width {
            pieces.push(start..word.start + idx);
            start = word.start + idx;
            cells = 0;
        }
        cells += ch_width;
    }
    pieces.push(start..word.end);
    pieces
}

fn is_covered(spans: &[Range<usize>], range: &Range<usize>) -> bool {
    spans
        .iter()
        .any(|span| span.start <= range.start && span.end >= range.end)
}

/// Appends `text[range]` to `line`, split into highlighted and plain segments.
fn push_marked(line: &mut Line, text: &str, range: Range<usize>, spans: &[Range<usize>]) {
    let mut pos = range.start;
    while pos < range.end {
        if let Some(span) = spans.iter().find(|s| s.start <= pos && pos < s.end) {
            let end = span.end.min(range.end);
            line.push(&text[pos..end], true);
            pos = end;
        } else {
            let end = spans
                .iter()
                .map(|s| s.start)
                .filter(|&start| start > pos)
                .min()
                .unwrap_or(range.end)
                .min(range.end);
            line.push(&text[pos..end], false);
            pos = end;
        }
    }
}

/// Wraps `text` to `width` terminal cells. `spans` are byte ranges of `text`, sorted and
/// non-overlapping; whitespace between two words is highlighted only when a single span
/// covers it.
pub fn wrap_with_spans(text: &str, spans: &[Range<usize>], width: usize) -> Vec<Line> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = Line::default();
    let mut current_width = 0;
    let mut previous_end: Option<usize> = None;

    for token in tokenize(text) {
        let word = match token {
            Token::Break => {
                lines.push(std::mem::take(&mut current));
                current_width = 0;
                previous_end = None;
                continue;
            }
            Token::Word(word) => word,
        };
        for piece in split_long(text, word, width) {
            let piece_width = text[piece.clone()].width();
            if current_width > 0 && current_width + 1 + piece_width > width {
                lines.push(std::mem::take(&mut current));
                current_width = 0;
                previous_end = None;
            }
            if let Some(end) = previous_end {
                let gap = end..piece.start;
                current.push(" ", is_covered(spans, &gap));
                current_width += 1;
            }
            push_marked(&mut current, text, piece.clone(), spans);
            current_width += piece_width;
            previous_end = Some(piece.end);
        }
    }
    if !current.segments.is_empty() {
        lines.push(current);
    }
    lines
}

/// What the book view shows for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageView {
    pub header: String,
    pub lines: Vec<Line>,
}

impl PageView {
    pub fn pending(page: usize) -> Self {
        Self {
            header: page_header(page),
            lines: vec![Line::plain(PENDING_PLACEHOLDER)],
        }
    }

    pub fn from_content(
        page: usize,
        content: &PageContent,
        spans: &[Range<usize>],
        font_size: FontSize,
        available_width: usize,
    ) -> Self {
        let (width, spacing) = column_metrics(font_size, available_width);
        let mut lines = Vec::new();
        if content.text.trim().is_empty() {
            lines.push(Line::plain(EMPTY_PLACEHOLDER));
        } else {
            for line in wrap_with_spans(&content.text, spans, width) {
                lines.push(line);
                lines.extend((0..spacing).map(|_| Line::default()));
            }
        }
        if !content.images.is_empty() {
            lines.push(Line::default());
            lines.extend(content.images.iter().map(|image| Line::plain(image_label(image))));
        }
        Self {
            header: page_header(page),
            lines,
        }
    }

    /// Draws the view centred in `cols` × `rows`, starting at the top row.
    pub fn draw<W: Write>(&self, writer: &mut W, cols: u16, rows: u16, palette: Palette) -> Result<()> {
        queue!(
            writer,
            SetColors(palette.colors()),
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        let body_width = self.lines.iter().map(Line::width).max().unwrap_or(0);
        let left = (usize::from(cols).saturating_sub(body_width) / 2) as u16;
        let header_left = (usize::from(cols).saturating_sub(self.header.width()) / 2) as u16;
        queue!(writer, MoveTo(header_left, 0), Print(&self.header))?;

        for (row, line) in self.lines.iter().enumerate() {
            let y = row as u16 + 2;
            if y >= rows {
                break;
            }
            queue!(writer, MoveTo(left, y))?;
            for segment in &line.segments {
                if segment.highlighted {
                    queue!(
                        writer,
                        SetAttribute(Attribute::Reverse),
                        Print(&segment.text),
                        SetAttribute(Attribute::NoReverse)
                    )?;
                } else {
                    queue!(writer, Print(&segment.text))?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }
}

fn page_header(page: usize) -> String {
    format!("— Page {page} —")
}

fn image_label(image: &ImageRef) -> String {
    format!(
        "[image {}: {:.0} × {:.0} pt]",
        image.index + 1,
        image.width_pt,
        image.height_pt
    )
}
