use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossterm::style::{Color, Colors};
use folio_core::ThemeApplier;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub foreground: Color,
    pub background: Color,
}

impl Palette {
    pub fn light() -> Self {
        Self {
            foreground: Color::Black,
            background: Color::White,
        }
    }

    pub fn dark() -> Self {
        Self {
            foreground: Color::Grey,
            background: Color::Black,
        }
    }

    pub fn colors(self) -> Colors {
        Colors::new(self.foreground, self.background)
    }
}

/// Terminal colour scheme switched by the reader's dark-mode flag.
///
/// Clones share the same flag, so one handle can be given to the reader while the
/// draw loop keeps another.
#[derive(Debug, Clone, Default)]
pub struct TerminalTheme {
    dark: Arc<AtomicBool>,
}

impl TerminalTheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dark(&self) -> bool {
        self.dark.load(Ordering::Relaxed)
    }

    pub fn palette(&self) -> Palette {
        if self.is_dark() {
            Palette::dark()
        } else {
            Palette::light()
        }
    }
}

impl ThemeApplier for TerminalTheme {
    fn apply(&self, dark_mode: bool) {
        let previous = self.dark.swap(dark_mode, Ordering::Relaxed);
        if previous != dark_mode {
            debug!(dark_mode, "terminal palette switched");
        }
    }
}
