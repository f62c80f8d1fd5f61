use std::io::Write;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    queue,
    style::{Print, SetColors},
    terminal::{Clear, ClearType},
};
use folio_core::{Command, ReaderState, RenderImage};
use png::{BitDepth, ColorType, Encoder};
use tracing::trace;
use unicode_width::UnicodeWidthChar;

pub mod book;
pub mod theme;

pub use book::{Line, PageView, Segment};
pub use theme::{Palette, TerminalTheme};

const KITTY_CHUNK: usize = 4096;

/// Where an image is placed, in terminal cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub column: u16,
    pub row: u16,
    pub columns: u32,
    pub rows: u32,
}

impl Placement {
    pub fn clamped(column: u16, row: u16, columns: u32, rows: u32) -> Self {
        Self {
            column,
            row,
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

/// Draws rendered pages with the kitty graphics protocol.
pub struct KittyCanvas<W: Write> {
    writer: W,
    image_id: u32,
    shown: bool,
}

impl<W: Write> KittyCanvas<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            shown: false,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Replaces the displayed page image. Each call reuses the same image id so the
    /// terminal drops the previous page.
    pub fn draw(&mut self, image: &RenderImage, placement: Placement) -> Result<()> {
        let encoded = BASE64.encode(encode_png(image)?);
        trace!(
            width = image.width,
            height = image.height,
            bytes = encoded.len(),
            "sending page image"
        );
        queue!(self.writer, cursor::MoveTo(placement.column, placement.row))?;

        let mut chunks = encoded.as_bytes().chunks(KITTY_CHUNK).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let more = u8::from(chunks.peek().is_some());
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    placement.columns,
                    placement.rows,
                    image.width,
                    image.height,
                    more
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", more)?;
            }
            self.writer.write_all(b";")?;
            self.writer.write_all(chunk)?;
            write!(self.writer, "\u{1b}\\")?;
        }
        self.shown = true;
        self.writer.flush()?;
        Ok(())
    }

    /// Deletes the page image, if one is shown.
    pub fn clear_image(&mut self) -> Result<()> {
        if self.shown {
            write!(self.writer, "\u{1b}_Ga=d,d=I,i={},q=2\u{1b}\\", self.image_id)?;
            self.shown = false;
        }
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// The terminal renders everything buffered since `begin_sync_update` at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self, palette: Palette) -> Result<()> {
        self.clear_image()?;
        queue!(
            self.writer,
            SetColors(palette.colors()),
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

fn encode_png(image: &RenderImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
    encoder.set_color(ColorType::Rgba);
    encoder.set_depth(BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&image.pixels)?;
    writer.finish()?;
    Ok(buffer)
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    FontLarger,
    FontSmaller,
    ToggleView,
    CopyPageText,
    BeginInput { mode: InputMode },
    InputChanged { text: String },
    HighlightSubmit { text: String },
    OpenSubmit { path: String },
    InputCancel,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputMode {
    #[default]
    Normal,
    Highlight,
    OpenPath,
}

/// Turns key presses into reader commands. Digits typed before `g` or Enter select a page.
#[derive(Debug)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    input_buffer: String,
    zoom_step: f32,
}

impl Default for EventMapper {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl EventMapper {
    pub fn new(zoom_step: f32) -> Self {
        Self {
            pending_count: None,
            pending_digits: String::new(),
            mode: InputMode::Normal,
            input_buffer: String::new(),
            zoom_step,
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.input_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        let Event::Key(key) = event else {
            return UiEvent::None;
        };
        if key.kind == KeyEventKind::Release {
            return UiEvent::None;
        }
        match self.mode {
            InputMode::Normal => self.map_key_normal(key),
            InputMode::Highlight | InputMode::OpenPath => self.map_key_input(key),
        }
    }

    fn map_key_normal(&mut self, key: KeyEvent) -> UiEvent {
        let KeyEvent {
            code, modifiers, ..
        } = key;
        if modifiers.contains(KeyModifiers::CONTROL) {
            self.reset_count();
            return match code {
                KeyCode::Char('c') => UiEvent::Quit,
                _ => UiEvent::None,
            };
        }

        if let KeyCode::Char(c) = code {
            if let Some(digit) = c.to_digit(10) {
                self.push_digit(digit as usize);
                return UiEvent::None;
            }
        }

        let count = self.take_count();
        match code {
            KeyCode::Char('j') | KeyCode::Char(' ') | KeyCode::Right | KeyCode::PageDown => {
                UiEvent::Command(Command::NextPage)
            }
            KeyCode::Char('k') | KeyCode::Left | KeyCode::PageUp => {
                UiEvent::Command(Command::PrevPage)
            }
            KeyCode::Char('g') | KeyCode::Enter => match count {
                Some(page) => UiEvent::Command(Command::GotoPage { page }),
                None if code == KeyCode::Char('g') => UiEvent::Command(Command::FirstPage),
                None => UiEvent::None,
            },
            KeyCode::Home => UiEvent::Command(Command::FirstPage),
            KeyCode::Char('G') | KeyCode::End => UiEvent::Command(Command::LastPage),
            KeyCode::Char('+') | KeyCode::Char('=') => UiEvent::Command(Command::Zoom {
                delta: self.zoom_step,
            }),
            KeyCode::Char('-') => UiEvent::Command(Command::Zoom {
                delta: -self.zoom_step,
            }),
            KeyCode::Char('f') => UiEvent::FontLarger,
            KeyCode::Char('F') => UiEvent::FontSmaller,
            KeyCode::Char('d') => UiEvent::Command(Command::ToggleDarkMode),
            KeyCode::Char('b') => UiEvent::Command(Command::ToggleBookmark { page: None }),
            KeyCode::Char('B') => UiEvent::Command(Command::NextBookmark),
            KeyCode::Char('v') => UiEvent::ToggleView,
            KeyCode::Char('y') => UiEvent::CopyPageText,
            KeyCode::Char('/') => self.begin_input(InputMode::Highlight),
            KeyCode::Char('o') => self.begin_input(InputMode::OpenPath),
            KeyCode::Char('q') => UiEvent::Quit,
            _ => UiEvent::None,
        }
    }

    fn map_key_input(&mut self, key: KeyEvent) -> UiEvent {
        match (key.code, key.modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::InputCancel
            }
            (KeyCode::Char('c'), KeyModifiers::CONTROL) => {
                self.set_mode(InputMode::Normal);
                UiEvent::InputCancel
            }
            (KeyCode::Enter, _) => {
                let text = self.input_buffer.trim().to_owned();
                let mode = self.mode;
                self.set_mode(InputMode::Normal);
                match mode {
                    _ if text.is_empty() => UiEvent::InputCancel,
                    InputMode::Highlight => UiEvent::HighlightSubmit { text },
                    InputMode::OpenPath => UiEvent::OpenSubmit { path: text },
                    InputMode::Normal => UiEvent::None,
                }
            }
            (KeyCode::Backspace, _) => {
                self.input_buffer.pop();
                UiEvent::InputChanged {
                    text: self.input_buffer.clone(),
                }
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.input_buffer.push(c);
                UiEvent::InputChanged {
                    text: self.input_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn begin_input(&mut self, mode: InputMode) -> UiEvent {
        self.set_mode(mode);
        UiEvent::BeginInput { mode }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        self.pending_count = Some(current.saturating_mul(10).saturating_add(digit));
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> Option<usize> {
        self.pending_digits.clear();
        self.pending_count.take()
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        match self.mode {
            InputMode::Highlight => Some(format!("/{}", self.input_buffer)),
            InputMode::OpenPath => Some(format!("open: {}", self.input_buffer)),
            InputMode::Normal if !self.pending_digits.is_empty() => {
                Some(self.pending_digits.clone())
            }
            InputMode::Normal => None,
        }
    }
}

/// One-line summary of the reader state for the bottom row.
pub fn format_status(state: &ReaderState, pending: Option<&str>, notice: Option<&str>) -> String {
    let mut parts = Vec::new();
    match state.document_name.as_deref() {
        Some(name) => parts.push(name.to_owned()),
        None => parts.push("no document".to_owned()),
    }
    if state.document.is_some() {
        let total = if state.num_pages > 0 {
            state.num_pages.to_string()
        } else {
            "?".to_owned()
        };
        let mut page = format!("page {}/{}", state.current_page, total);
        if state.is_bookmarked(state.current_page) {
            page.push_str(" *");
        }
        parts.push(page);
    }
    parts.push(format!("{:.0}%", state.zoom_scale * 100.0));
    parts.push(state.font_size.label().to_owned());
    if state.dark_mode {
        parts.push("dark".to_owned());
    }
    if let Some(target) = state.pending_page.filter(|_| state.is_transitioning) {
        parts.push(format!("turning to {target}"));
    }
    if let Some(pending) = pending {
        parts.push(format!("[{pending}]"));
    }
    if let Some(notice) = notice {
        parts.push(notice.to_owned());
    }
    parts.join(" | ")
}

/// The longest prefix of `label` that fits in `cols` terminal cells.
pub fn truncate_to_cells(label: &str, cols: usize) -> &str {
    let mut cells = 0;
    for (idx, ch) in label.char_indices() {
        cells += ch.width().unwrap_or(0);
        if cells > cols {
            return &label[..idx];
        }
    }
    label
}

/// Writes `label` on the last row, truncated to the terminal width.
pub fn write_status_line<W: Write>(
    writer: &mut W,
    cols: u16,
    rows: u16,
    label: &str,
    palette: Palette,
) -> Result<()> {
    let visible = truncate_to_cells(label, usize::from(cols));
    queue!(
        writer,
        cursor::MoveTo(0, rows.saturating_sub(1)),
        SetColors(palette.colors()),
        Clear(ClearType::CurrentLine),
        Print(visible)
    )?;
    writer.flush()?;
    Ok(())
}
