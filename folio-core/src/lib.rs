use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod cache;
pub mod config;
pub mod error;
pub mod highlight;
pub mod intake;
mod reader;
pub mod transition;

pub use cache::{PageContentCache, PageLookup};
pub use config::{Preferences, ReaderConfig, MAX_ZOOM, MIN_ZOOM};
pub use error::{ReaderError, ReaderResult};
pub use highlight::{Highlight, HighlightMode, TextAnchor};
pub use intake::{ByteSource, IntakePolicy};
pub use reader::Reader;
pub use transition::{FlipDirection, TransitionCoordinator, TransitionPhase, TransitionTicket};

pub type DocumentId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl NormalizedRect {
    pub fn clamp(self) -> Self {
        let left = self.left.min(self.right).clamp(0.0, 1.0);
        let right = self.left.max(self.right).clamp(0.0, 1.0);
        let top = self.top.min(self.bottom).clamp(0.0, 1.0);
        let bottom = self.top.max(self.bottom).clamp(0.0, 1.0);
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }
}

/// Reference to an image object placed on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub page: usize,
    /// Position among the page's image objects.
    pub index: usize,
    pub width_pt: f32,
    pub height_pt: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    pub text: String,
    pub images: Vec<ImageRef>,
}

impl PageContent {
    /// Placeholder used when a page cannot be extracted.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FontSize {
    Small,
    #[default]
    Medium,
    Large,
    #[serde(alias = "maximum")]
    ExtraLarge,
}

impl FontSize {
    pub const ALL: [FontSize; 4] = [
        FontSize::Small,
        FontSize::Medium,
        FontSize::Large,
        FontSize::ExtraLarge,
    ];

    pub fn larger(self) -> Self {
        match self {
            FontSize::Small => FontSize::Medium,
            FontSize::Medium => FontSize::Large,
            FontSize::Large | FontSize::ExtraLarge => FontSize::ExtraLarge,
        }
    }

    pub fn smaller(self) -> Self {
        match self {
            FontSize::Small | FontSize::Medium => FontSize::Small,
            FontSize::Large => FontSize::Medium,
            FontSize::ExtraLarge => FontSize::Large,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FontSize::Small => "small",
            FontSize::Medium => "medium",
            FontSize::Large => "large",
            FontSize::ExtraLarge => "extra large",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    /// 0-based page index.
    pub page_index: usize,
    pub scale: f32,
    pub dark_mode: bool,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: 1.0,
            dark_mode: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub name: String,
    pub title: Option<String>,
    pub byte_len: u64,
}

/// A loaded document. Page arguments are 0-based indices.
///
/// Implementations hold a transient resource (engine document, byte buffer) that is
/// freed by [`DocumentBackend::release`]. Calls after release should fail rather than panic.
pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn page_count(&self) -> anyhow::Result<usize>;
    fn extract_page(&self, page_index: usize) -> anyhow::Result<PageContent>;
    fn render_page(&self, request: RenderRequest) -> anyhow::Result<RenderImage>;
    fn release(&self);
}

/// Turns a byte source into a document.
///
/// Fails with [`ReaderError::UnsupportedFormat`] or [`ReaderError::TooLarge`] for inputs
/// outside the intake policy and [`ReaderError::DocumentLoad`] when the engine rejects the
/// bytes.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load(&self, source: ByteSource) -> ReaderResult<Arc<dyn DocumentBackend>>;
}

/// Applies the dark-mode presentation flag outside the reader state.
pub trait ThemeApplier: Send + Sync {
    fn apply(&self, dark_mode: bool);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTheme;

impl ThemeApplier for NoopTheme {
    fn apply(&self, _dark_mode: bool) {}
}

#[derive(Debug, Clone)]
pub enum Command {
    GotoPage { page: usize },
    NextPage,
    PrevPage,
    FirstPage,
    LastPage,
    Zoom { delta: f32 },
    SetFontSize { size: FontSize },
    ToggleDarkMode,
    /// Page defaults to the displayed page.
    AddHighlight {
        page: Option<usize>,
        text: String,
        regions: Vec<NormalizedRect>,
    },
    ToggleBookmark { page: Option<usize> },
    NextBookmark,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    DocumentLoaded(DocumentId),
    DocumentReleased(DocumentId),
    PageCountResolved { document: DocumentId, pages: usize },
    /// The engine could not count pages; the document stays loaded with zero pages.
    PageCountFailed { document: DocumentId },
    TransitionStarted {
        from: usize,
        to: usize,
        direction: FlipDirection,
    },
    PageChanged { page: usize },
    ContentReady { page: usize },
    RedrawNeeded,
}

/// Snapshot of everything the presentation layer renders from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReaderState {
    pub document: Option<DocumentId>,
    pub document_name: Option<String>,
    /// 1-based; within `1..=num_pages` whenever `num_pages > 0`.
    pub current_page: usize,
    /// 0 while no document is loaded or its page count is unresolved.
    pub num_pages: usize,
    pub zoom_scale: f32,
    pub font_size: FontSize,
    pub dark_mode: bool,
    pub highlights: Vec<Highlight>,
    pub bookmarks: BTreeSet<usize>,
    pub is_transitioning: bool,
    pub pending_page: Option<usize>,
}

impl ReaderState {
    pub fn new(preferences: Preferences) -> Self {
        Self {
            document: None,
            document_name: None,
            current_page: 1,
            num_pages: 0,
            zoom_scale: preferences.zoom.clamp(MIN_ZOOM, MAX_ZOOM),
            font_size: preferences.font_size,
            dark_mode: preferences.dark_mode,
            highlights: Vec::new(),
            bookmarks: BTreeSet::new(),
            is_transitioning: false,
            pending_page: None,
        }
    }

    pub fn preferences(&self) -> Preferences {
        Preferences {
            zoom: self.zoom_scale,
            font_size: self.font_size,
            dark_mode: self.dark_mode,
        }
    }

    /// Clears per-document fields; zoom, font size and dark mode are kept.
    pub fn reset_for(&mut self, document: Option<DocumentId>, name: Option<String>) {
        *self = Self {
            document,
            document_name: name,
            ..Self::new(self.preferences())
        };
    }

    pub fn is_bookmarked(&self, page: usize) -> bool {
        self.bookmarks.contains(&page)
    }

    pub fn highlights_on(&self, page: usize) -> impl Iterator<Item = &Highlight> {
        self.highlights.iter().filter(move |h| h.page == page)
    }
}

impl Default for ReaderState {
    fn default() -> Self {
        Self::new(Preferences::default())
    }
}
