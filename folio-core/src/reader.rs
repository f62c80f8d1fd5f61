use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, instrument, warn};

use crate::cache::{PageContentCache, PageLookup};
use crate::config::{ReaderConfig, MAX_ZOOM, MIN_ZOOM};
use crate::error::{ReaderError, ReaderResult};
use crate::highlight::{self, Highlight, TextAnchor};
use crate::intake::{ByteSource, IntakePolicy};
use crate::transition::{FlipDirection, TransitionCoordinator, TransitionTicket};
use crate::{
    Command, DocumentBackend, DocumentId, DocumentSource, FontSize, NormalizedRect, PageContent,
    ReaderEvent, ReaderState, RenderImage, RenderRequest, ThemeApplier,
};

/// Work finished off the serialized path, applied by [`Reader::process_pending`] or
/// [`Reader::next_completion`].
enum Completion {
    PageCount {
        document: DocumentId,
        result: anyhow::Result<usize>,
    },
    Content {
        document: DocumentId,
        page: usize,
        result: anyhow::Result<PageContent>,
    },
    TransitionElapsed {
        ticket: TransitionTicket,
    },
}

/// Exclusive owner of a loaded document. Releases the backend exactly once, either
/// explicitly or on drop.
struct DocumentLease {
    backend: Arc<dyn DocumentBackend>,
    released: bool,
}

impl DocumentLease {
    fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            backend,
            released: false,
        }
    }

    fn id(&self) -> DocumentId {
        self.backend.info().id
    }

    fn backend(&self) -> Arc<dyn DocumentBackend> {
        Arc::clone(&self.backend)
    }

    fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.backend.release();
            info!(document = %self.id(), "released document resource");
        }
    }
}

impl Drop for DocumentLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// The reader state store.
///
/// Every mutation goes through `&mut self`. Page-count resolution and content extraction
/// run on tokio's blocking pool and the page-turn timer on a tokio task, so the methods
/// that start them must be called from within a runtime.
pub struct Reader {
    state: ReaderState,
    config: ReaderConfig,
    intake: IntakePolicy,
    source: Arc<dyn DocumentSource>,
    theme: Arc<dyn ThemeApplier>,
    lease: Option<DocumentLease>,
    cache: PageContentCache,
    transition: TransitionCoordinator,
    completions_tx: UnboundedSender<Completion>,
    completions_rx: UnboundedReceiver<Completion>,
    events: Arc<Mutex<Vec<ReaderEvent>>>,
}

impl Reader {
    pub fn new(
        config: ReaderConfig,
        source: Arc<dyn DocumentSource>,
        theme: Arc<dyn ThemeApplier>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let state = ReaderState::new(config.preferences);
        theme.apply(state.dark_mode);
        Self {
            state,
            intake: config.intake_policy(),
            cache: PageContentCache::new(config.cache_capacity),
            transition: TransitionCoordinator::new(config.transition_dwell),
            config,
            source,
            theme,
            lease: None,
            completions_tx,
            completions_rx,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn drain_events(&self) -> Vec<ReaderEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn emit(&self, event: ReaderEvent) {
        self.events.lock().push(event);
    }

    /// Replaces the current document. On failure the prior state is untouched.
    #[instrument(skip(self, source), fields(name = %source.name, bytes = source.len()))]
    pub async fn load_document(&mut self, source: ByteSource) -> ReaderResult<DocumentId> {
        self.intake.admit(&source)?;
        let name = source.name.clone();
        let backend = self.source.load(source).await?;
        let id = backend.info().id;

        self.release_current();
        self.lease = Some(DocumentLease::new(backend));
        self.transition.reset();
        self.cache.reset(Some(id));
        self.state.reset_for(Some(id), Some(name));
        info!(document = %id, "document loaded");
        self.emit(ReaderEvent::DocumentLoaded(id));
        self.emit(ReaderEvent::RedrawNeeded);

        self.spawn_page_count(id);
        Ok(id)
    }

    /// Teardown: releases the current document, if any.
    pub fn close(&mut self) {
        self.release_current();
        self.transition.reset();
        self.cache.reset(None);
        self.state.reset_for(None, None);
    }

    fn release_current(&mut self) {
        if let Some(lease) = self.lease.take() {
            let id = lease.id();
            lease.release();
            self.emit(ReaderEvent::DocumentReleased(id));
        }
    }

    fn spawn_page_count(&self, document: DocumentId) {
        let Some(backend) = self.lease.as_ref().map(DocumentLease::backend) else {
            return;
        };
        let tx = self.completions_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = backend.page_count();
            let _ = tx.send(Completion::PageCount { document, result });
        });
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::GotoPage { page } => {
                self.go_to_page(page);
            }
            Command::NextPage => {
                self.next_page();
            }
            Command::PrevPage => {
                self.prev_page();
            }
            Command::FirstPage => {
                self.go_to_page(1);
            }
            Command::LastPage => {
                self.go_to_page(self.state.num_pages);
            }
            Command::Zoom { delta } => {
                self.zoom(delta);
            }
            Command::SetFontSize { size } => self.set_font_size(size),
            Command::ToggleDarkMode => {
                self.toggle_dark_mode();
            }
            Command::AddHighlight {
                page,
                text,
                regions,
            } => {
                let page = page.unwrap_or(self.state.current_page);
                self.add_highlight(page, text, regions);
            }
            Command::ToggleBookmark { page } => {
                let page = page.unwrap_or(self.state.current_page);
                self.toggle_bookmark(page);
            }
            Command::NextBookmark => {
                self.go_to_next_bookmark();
            }
        }
    }

    /// Starts a page turn towards `page`. Returns false when the request is a no-op: out of
    /// range, already displayed, or already the target of the turn in flight. A different
    /// target pre-empts the turn in flight and restarts the dwell.
    pub fn go_to_page(&mut self, page: usize) -> bool {
        let current = self.state.current_page;
        if page == current || page < 1 || page > self.state.num_pages {
            return false;
        }
        if self.transition.target() == Some(page) {
            return false;
        }

        let ticket = self.transition.begin(current, page);
        self.state.is_transitioning = true;
        self.state.pending_page = Some(page);
        debug!(from = current, to = page, "page turn started");
        self.emit(ReaderEvent::TransitionStarted {
            from: current,
            to: page,
            direction: FlipDirection::between(current, page),
        });

        let tx = self.completions_tx.clone();
        let dwell = self.transition.dwell();
        tokio::spawn(async move {
            tokio::time::sleep(dwell).await;
            let _ = tx.send(Completion::TransitionElapsed { ticket });
        });

        self.request_content(page);
        true
    }

    pub fn next_page(&mut self) -> bool {
        self.go_to_page(self.state.current_page + 1)
    }

    pub fn prev_page(&mut self) -> bool {
        match self.state.current_page.checked_sub(1) {
            Some(page) => self.go_to_page(page),
            None => false,
        }
    }

    /// Turns to the first bookmark after the displayed page, wrapping around.
    pub fn go_to_next_bookmark(&mut self) -> bool {
        let current = self.state.current_page;
        let target = self
            .state
            .bookmarks
            .range(current + 1..)
            .next()
            .or_else(|| self.state.bookmarks.iter().next())
            .copied();
        match target {
            Some(page) => self.go_to_page(page),
            None => false,
        }
    }

    /// Adds `delta` to the zoom scale, saturating at the bounds. Non-finite deltas are
    /// ignored. Returns the resulting scale.
    pub fn zoom(&mut self, delta: f32) -> f32 {
        if !delta.is_finite() {
            return self.state.zoom_scale;
        }
        let scale = (self.state.zoom_scale + delta).clamp(MIN_ZOOM, MAX_ZOOM);
        if scale != self.state.zoom_scale {
            self.state.zoom_scale = scale;
            self.emit(ReaderEvent::RedrawNeeded);
        }
        scale
    }

    pub fn set_font_size(&mut self, size: FontSize) {
        self.state.font_size = size;
        self.emit(ReaderEvent::RedrawNeeded);
    }

    pub fn toggle_dark_mode(&mut self) -> bool {
        self.state.dark_mode = !self.state.dark_mode;
        self.theme.apply(self.state.dark_mode);
        self.emit(ReaderEvent::RedrawNeeded);
        self.state.dark_mode
    }

    /// Appends a pattern highlight. Whether `text` occurs on `page` is not checked.
    pub fn add_highlight(
        &mut self,
        page: usize,
        text: impl Into<String>,
        regions: Vec<NormalizedRect>,
    ) {
        self.push_highlight(Highlight::pattern(page, text, regions));
    }

    pub fn add_anchored_highlight(
        &mut self,
        page: usize,
        text: impl Into<String>,
        regions: Vec<NormalizedRect>,
        anchor: TextAnchor,
    ) {
        self.push_highlight(Highlight::anchored(page, text, regions, anchor));
    }

    fn push_highlight(&mut self, highlight: Highlight) {
        debug!(page = highlight.page, text = %highlight.text, "highlight added");
        let redraw = highlight.page == self.state.current_page;
        self.state.highlights.push(highlight);
        if redraw {
            self.emit(ReaderEvent::RedrawNeeded);
        }
    }

    /// Returns whether `page` is bookmarked afterwards.
    pub fn toggle_bookmark(&mut self, page: usize) -> bool {
        let bookmarked = if self.state.bookmarks.remove(&page) {
            false
        } else {
            self.state.bookmarks.insert(page);
            true
        };
        self.emit(ReaderEvent::RedrawNeeded);
        bookmarked
    }

    /// Looks `page` up in the content cache, starting an extraction when it is absent.
    /// Returns `None` when no document is loaded or the page is out of range.
    pub fn page_content(&mut self, page: usize) -> Option<PageLookup<'_>> {
        if self.lease.is_none() || page < 1 || page > self.state.num_pages {
            return None;
        }
        if self.cache.lookup(page).is_none() {
            self.request_content(page);
        }
        self.cache.lookup(page)
    }

    pub fn cache(&self) -> &PageContentCache {
        &self.cache
    }

    fn request_content(&mut self, page: usize) {
        let Some(lease) = self.lease.as_ref() else {
            return;
        };
        if !self.cache.mark_pending(page) {
            return;
        }
        let backend = lease.backend();
        let document = lease.id();
        let tx = self.completions_tx.clone();
        debug!(page, "extracting page content");
        tokio::task::spawn_blocking(move || {
            let result = backend.extract_page(page - 1);
            let _ = tx.send(Completion::Content {
                document,
                page,
                result,
            });
        });
    }

    /// Byte ranges to mark in the cached text of `page`. Empty while the page is pending.
    pub fn highlight_spans(&self, page: usize) -> Vec<Range<usize>> {
        match self.cache.lookup(page).and_then(PageLookup::ready) {
            Some(content) => highlight::match_spans(
                &content.text,
                page,
                &self.state.highlights,
                self.config.highlight_mode,
            ),
            None => Vec::new(),
        }
    }

    /// Rasterises the displayed page at the current zoom and theme.
    pub fn render_current_page(&self) -> anyhow::Result<Option<RenderImage>> {
        let Some(lease) = self.lease.as_ref() else {
            return Ok(None);
        };
        if self.state.num_pages == 0 {
            return Ok(None);
        }
        let image = lease.backend.render_page(RenderRequest {
            page_index: self.state.current_page - 1,
            scale: self.state.zoom_scale,
            dark_mode: self.state.dark_mode,
        })?;
        Ok(Some(image))
    }

    /// Applies every completion that is already available. Returns how many were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.complete(completion);
            applied += 1;
        }
        applied
    }

    /// Waits for the next completion and applies it.
    pub async fn next_completion(&mut self) {
        if let Some(completion) = self.completions_rx.recv().await {
            self.complete(completion);
        }
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::PageCount { document, result } => {
                if self.state.document != Some(document) {
                    debug!(%document, "ignoring page count for a superseded document");
                    return;
                }
                match result {
                    Ok(pages) => {
                        self.state.num_pages = pages;
                        self.state.current_page = 1;
                        info!(%document, pages, "page count resolved");
                        self.emit(ReaderEvent::PageCountResolved { document, pages });
                        self.emit(ReaderEvent::RedrawNeeded);
                        if pages > 0 {
                            self.request_content(1);
                        }
                    }
                    Err(err) => {
                        warn!(%document, ?err, "failed to resolve page count");
                        self.emit(ReaderEvent::PageCountFailed { document });
                        self.emit(ReaderEvent::RedrawNeeded);
                    }
                }
            }
            Completion::Content {
                document,
                page,
                result,
            } => {
                let content = match result {
                    Ok(content) => content,
                    Err(source) => {
                        let err = ReaderError::Extraction { page, source };
                        warn!(%document, error = %err, cause = ?err, "using empty placeholder");
                        PageContent::empty()
                    }
                };
                let reference = self.state.pending_page.unwrap_or(self.state.current_page);
                if self.cache.fill(document, page, content, reference) {
                    self.emit(ReaderEvent::ContentReady { page });
                    if page == self.state.current_page {
                        self.emit(ReaderEvent::RedrawNeeded);
                    }
                }
            }
            Completion::TransitionElapsed { ticket } => {
                if let Some(page) = self.transition.complete(ticket) {
                    self.state.current_page = page;
                    self.state.is_transitioning = false;
                    self.state.pending_page = None;
                    debug!(page, "page turn finished");
                    self.emit(ReaderEvent::PageChanged { page });
                    self.emit(ReaderEvent::RedrawNeeded);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;
    use uuid::Uuid;

    use super::*;
    use crate::intake::PDF_MIME;
    use crate::DocumentInfo;

    struct FakeBackend {
        info: DocumentInfo,
        pages: usize,
        count_fails: bool,
        broken_pages: HashSet<usize>,
        releases: Arc<AtomicUsize>,
    }

    impl DocumentBackend for FakeBackend {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn page_count(&self) -> anyhow::Result<usize> {
            if self.count_fails {
                anyhow::bail!("page tree is unreadable");
            }
            Ok(self.pages)
        }

        fn extract_page(&self, page_index: usize) -> anyhow::Result<PageContent> {
            if self.broken_pages.contains(&page_index) {
                anyhow::bail!("corrupt content stream");
            }
            Ok(PageContent {
                text: format!("Lorem page {} lorem", page_index + 1),
                images: Vec::new(),
            })
        }

        fn render_page(&self, request: RenderRequest) -> anyhow::Result<RenderImage> {
            Ok(RenderImage {
                width: 1,
                height: 1,
                pixels: vec![request.page_index as u8, 0, 0, 255],
            })
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeSource {
        pages: usize,
        count_fails: bool,
        broken_pages: HashSet<usize>,
        releases: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn new(pages: usize) -> Self {
            Self {
                pages,
                count_fails: false,
                broken_pages: HashSet::new(),
                releases: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl DocumentSource for FakeSource {
        async fn load(&self, source: ByteSource) -> ReaderResult<Arc<dyn DocumentBackend>> {
            if !source.bytes.starts_with(b"%PDF-") {
                return Err(ReaderError::DocumentLoad {
                    name: source.name,
                    source: anyhow::anyhow!("missing header"),
                });
            }
            Ok(Arc::new(FakeBackend {
                info: DocumentInfo {
                    id: Uuid::new_v4(),
                    name: source.name,
                    title: None,
                    byte_len: source.bytes.len() as u64,
                },
                pages: self.pages,
                count_fails: self.count_fails,
                broken_pages: self.broken_pages.clone(),
                releases: Arc::clone(&self.releases),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingTheme {
        applied: Mutex<Vec<bool>>,
    }

    impl ThemeApplier for RecordingTheme {
        fn apply(&self, dark_mode: bool) {
            self.applied.lock().push(dark_mode);
        }
    }

    fn pdf(name: &str) -> ByteSource {
        ByteSource::new(name, Some(PDF_MIME.into()), &b"%PDF-1.7 fake"[..])
    }

    fn reader_with(source: FakeSource) -> (Reader, Arc<AtomicUsize>) {
        let releases = Arc::clone(&source.releases);
        let reader = Reader::new(
            ReaderConfig::default(),
            Arc::new(source),
            Arc::new(crate::NoopTheme),
        );
        (reader, releases)
    }

    async fn loaded(pages: usize) -> (Reader, Arc<AtomicUsize>) {
        let (mut reader, releases) = reader_with(FakeSource::new(pages));
        reader.load_document(pdf("book.pdf")).await.unwrap();
        while reader.state().num_pages != pages {
            reader.next_completion().await;
        }
        (reader, releases)
    }

    async fn settle(reader: &mut Reader) {
        while reader.state().is_transitioning {
            reader.next_completion().await;
        }
    }

    #[tokio::test]
    async fn page_count_resolves_after_load() {
        let (mut reader, _) = reader_with(FakeSource::new(10));
        reader.load_document(pdf("book.pdf")).await.unwrap();
        assert_eq!(reader.state().num_pages, 0);
        assert!(!reader.go_to_page(2));

        while reader.state().num_pages == 0 {
            reader.next_completion().await;
        }
        assert_eq!(reader.state().num_pages, 10);
        assert_eq!(reader.state().current_page, 1);
        assert!(reader
            .drain_events()
            .contains(&ReaderEvent::PageCountResolved {
                document: reader.state().document.unwrap(),
                pages: 10,
            }));
    }

    #[tokio::test]
    async fn out_of_range_navigation_is_ignored() {
        let (mut reader, _) = loaded(5).await;
        for page in [0, 1, 6, 100] {
            assert!(!reader.go_to_page(page));
            assert_eq!(reader.state().current_page, 1);
            assert!(!reader.state().is_transitioning);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn page_turn_commits_after_dwell() {
        let (mut reader, _) = loaded(10).await;
        let started = Instant::now();

        assert!(reader.go_to_page(4));
        assert!(reader.state().is_transitioning);
        assert_eq!(reader.state().current_page, 1);
        assert_eq!(reader.state().pending_page, Some(4));

        tokio::time::advance(Duration::from_millis(499)).await;
        reader.process_pending();
        assert!(reader.state().is_transitioning);
        assert_eq!(reader.state().current_page, 1);

        settle(&mut reader).await;
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(reader.state().current_page, 4);
        assert!(!reader.state().is_transitioning);
        assert_eq!(reader.state().pending_page, None);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_pre_empts_turn_in_flight() {
        let (mut reader, _) = loaded(10).await;
        assert!(reader.go_to_page(3));
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(reader.go_to_page(8));
        assert!(!reader.go_to_page(8));

        tokio::time::advance(Duration::from_millis(250)).await;
        reader.process_pending();
        assert!(reader.state().is_transitioning);
        assert_eq!(reader.state().current_page, 1);

        settle(&mut reader).await;
        assert_eq!(reader.state().current_page, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn next_page_at_last_page_is_a_no_op() {
        let (mut reader, _) = loaded(5).await;
        reader.apply(Command::LastPage);
        settle(&mut reader).await;
        assert_eq!(reader.state().current_page, 5);

        let before = reader.state().clone();
        assert!(!reader.next_page());
        assert_eq!(reader.state(), &before);
    }

    #[tokio::test]
    async fn prev_page_at_first_page_is_a_no_op() {
        let (mut reader, _) = loaded(5).await;
        assert!(!reader.prev_page());
        assert_eq!(reader.state().current_page, 1);
        assert!(!reader.state().is_transitioning);
    }

    #[tokio::test]
    async fn zoom_saturates_at_bounds() {
        let (mut reader, _) = loaded(10).await;
        for _ in 0..3 {
            reader.zoom(0.2);
        }
        assert!((reader.state().zoom_scale - 1.6).abs() < 1e-5);
        assert_eq!(reader.zoom(2.0), 2.5);
        assert_eq!(reader.zoom(-100.0), 0.5);
        assert_eq!(reader.zoom(f32::NAN), 0.5);
        assert_eq!(reader.zoom(f32::INFINITY), 0.5);
    }

    #[tokio::test]
    async fn zoom_stays_in_range_for_any_delta() {
        let (mut reader, _) = loaded(1).await;
        let deltas = [-3.0, 0.7, 1e9, -0.01, 0.33, -1e-9, 2.4, -2.4];
        for delta in deltas {
            let scale = reader.zoom(delta);
            assert!((MIN_ZOOM..=MAX_ZOOM).contains(&scale), "scale {scale}");
        }
    }

    #[tokio::test]
    async fn bookmark_toggle_twice_restores_membership() {
        let (mut reader, _) = loaded(10).await;
        reader.toggle_bookmark(7);
        let before = reader.state().bookmarks.clone();

        assert!(reader.toggle_bookmark(3));
        assert!(reader.state().is_bookmarked(3));
        assert!(!reader.toggle_bookmark(3));
        assert_eq!(reader.state().bookmarks, before);
    }

    #[tokio::test(start_paused = true)]
    async fn next_bookmark_wraps_around() {
        let (mut reader, _) = loaded(10).await;
        assert!(!reader.go_to_next_bookmark());
        reader.toggle_bookmark(2);
        reader.toggle_bookmark(6);
        assert!(reader.go_to_next_bookmark());
        assert_eq!(reader.state().pending_page, Some(2));
        settle(&mut reader).await;
        reader.apply(Command::NextBookmark);
        settle(&mut reader).await;
        assert_eq!(reader.state().current_page, 6);
        reader.apply(Command::NextBookmark);
        settle(&mut reader).await;
        assert_eq!(reader.state().current_page, 2);
    }

    #[tokio::test]
    async fn duplicate_highlights_are_kept() {
        let (mut reader, _) = loaded(5).await;
        reader.add_highlight(3, "lorem", Vec::new());
        reader.add_highlight(3, "lorem", Vec::new());
        let on_page: Vec<_> = reader.state().highlights_on(3).collect();
        assert_eq!(on_page.len(), 2);
        assert_eq!(on_page[0], on_page[1]);
        assert_eq!(on_page[0].text, "lorem");
    }

    #[tokio::test]
    async fn dark_mode_goes_through_theme_applier() {
        let theme = Arc::new(RecordingTheme::default());
        let mut reader = Reader::new(
            ReaderConfig::default(),
            Arc::new(FakeSource::new(1)),
            theme.clone(),
        );
        assert!(reader.toggle_dark_mode());
        assert!(!reader.toggle_dark_mode());
        assert_eq!(*theme.applied.lock(), vec![false, true, false]);
    }

    #[tokio::test]
    async fn content_is_pending_then_ready() {
        let (mut reader, _) = loaded(3).await;
        while reader.cache().lookup(1).map_or(true, |l| l.is_pending()) {
            reader.next_completion().await;
        }
        assert!(reader.page_content(2).unwrap().is_pending());
        assert!(reader.page_content(9).is_none());

        while reader.cache().lookup(2).unwrap().is_pending() {
            reader.next_completion().await;
        }
        let content = reader.page_content(2).unwrap().ready().unwrap();
        assert_eq!(content.text, "Lorem page 2 lorem");
    }

    #[tokio::test]
    async fn extraction_failure_degrades_to_placeholder() {
        let mut source = FakeSource::new(3);
        source.broken_pages.insert(1);
        let (mut reader, _) = reader_with(source);
        reader.load_document(pdf("book.pdf")).await.unwrap();
        while reader.state().num_pages == 0 {
            reader.next_completion().await;
        }

        assert!(reader.page_content(2).unwrap().is_pending());
        assert!(reader.page_content(3).unwrap().is_pending());
        while reader.cache().ready_pages().len() < 3 {
            reader.next_completion().await;
        }
        assert_eq!(
            reader.page_content(2).unwrap().ready().unwrap(),
            &PageContent::empty()
        );
        assert!(!reader.page_content(3).unwrap().ready().unwrap().text.is_empty());
    }

    #[tokio::test]
    async fn highlight_spans_use_cached_text() {
        let (mut reader, _) = loaded(2).await;
        reader.add_highlight(1, "LOREM", Vec::new());
        while reader.cache().lookup(1).map_or(true, |l| l.is_pending()) {
            reader.next_completion().await;
        }
        assert_eq!(reader.highlight_spans(1), vec![0..5, 13..18]);
        assert!(reader.highlight_spans(2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loading_new_document_resets_and_releases_once() {
        let (mut reader, releases) = loaded(10).await;
        reader.zoom(0.5);
        reader.toggle_dark_mode();
        reader.add_highlight(2, "lorem", Vec::new());
        reader.toggle_bookmark(4);
        reader.go_to_page(4);
        settle(&mut reader).await;
        reader.page_content(4);
        let first = reader.state().document.unwrap();

        let second = reader.load_document(pdf("second.pdf")).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        let state = reader.state();
        assert_eq!(state.current_page, 1);
        assert!(state.highlights.is_empty());
        assert!(state.bookmarks.is_empty());
        assert!(reader.cache().is_empty());
        assert_eq!(reader.cache().document(), Some(second));
        assert_eq!(state.zoom_scale, 1.5);
        assert!(state.dark_mode);
        assert_eq!(state.document_name.as_deref(), Some("second.pdf"));

        reader.close();
        assert_eq!(releases.load(Ordering::SeqCst), 2);
        reader.close();
        drop(reader);
        assert_eq!(releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_releases_held_document() {
        let (reader, releases) = loaded(2).await;
        drop(reader);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_keeps_prior_state() {
        let (mut reader, releases) = loaded(4).await;
        reader.toggle_bookmark(2);
        let before = reader.state().clone();

        let err = reader
            .load_document(ByteSource::new("x.pdf", Some(PDF_MIME.into()), &b"garbage"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::DocumentLoad { .. }));

        let err = reader
            .load_document(ByteSource::new("x.txt", Some("text/plain".into()), &b"%PDF-"[..]))
            .await
            .unwrap_err();
        assert!(err.is_intake());

        assert_eq!(reader.state(), &before);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_turn_does_not_leak_into_new_document() {
        let (mut reader, _) = loaded(10).await;
        assert!(reader.go_to_page(9));
        reader.load_document(pdf("other.pdf")).await.unwrap();
        assert!(!reader.state().is_transitioning);

        tokio::time::advance(Duration::from_millis(600)).await;
        while reader.state().num_pages == 0 {
            reader.next_completion().await;
        }
        tokio::task::yield_now().await;
        reader.process_pending();
        assert_eq!(reader.state().current_page, 1);
        assert!(!reader.state().is_transitioning);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_routes_commands_to_operations() {
        let (mut reader, _) = loaded(6).await;
        reader.apply(Command::LastPage);
        settle(&mut reader).await;
        assert_eq!(reader.state().current_page, 6);

        reader.apply(Command::ToggleBookmark { page: None });
        reader.apply(Command::AddHighlight {
            page: None,
            text: "lorem".into(),
            regions: Vec::new(),
        });
        reader.apply(Command::SetFontSize {
            size: FontSize::Large,
        });
        reader.apply(Command::FirstPage);
        settle(&mut reader).await;

        let state = reader.state();
        assert_eq!(state.current_page, 1);
        assert!(state.is_bookmarked(6));
        assert_eq!(state.highlights[0].page, 6);
        assert_eq!(state.font_size, FontSize::Large);
    }

    #[tokio::test]
    async fn anchored_highlight_marks_only_its_range() {
        let (mut reader, _) = loaded(2).await;
        reader.add_anchored_highlight(1, "lorem", Vec::new(), TextAnchor::new(13, 18));
        reader.add_anchored_highlight(2, "lorem", Vec::new(), TextAnchor::new(0, 3));
        reader.page_content(2);
        for page in [1, 2] {
            while reader.cache().lookup(page).map_or(true, |l| l.is_pending()) {
                reader.next_completion().await;
            }
        }

        assert_eq!(reader.highlight_spans(1), vec![13..18]);
        // The anchor no longer matches "lorem", so every occurrence is marked.
        assert_eq!(reader.highlight_spans(2), vec![0..5, 13..18]);
    }

    #[tokio::test(start_paused = true)]
    async fn render_follows_displayed_page() {
        let (mut reader, _) = loaded(3).await;
        assert!(reader.go_to_page(3));
        let image = reader.render_current_page().unwrap().unwrap();
        assert_eq!(image.pixels[0], 0);

        settle(&mut reader).await;
        let image = reader.render_current_page().unwrap().unwrap();
        assert_eq!(image.pixels[0], 2);

        reader.close();
        assert!(reader.render_current_page().unwrap().is_none());
        assert_eq!(reader.state().document, None);
    }

    #[tokio::test]
    async fn page_count_failure_is_reported_and_leaves_zero_pages() {
        let mut source = FakeSource::new(5);
        source.count_fails = true;
        let (mut reader, _) = reader_with(source);
        let id = reader.load_document(pdf("broken.pdf")).await.unwrap();
        reader.next_completion().await;

        assert!(reader
            .drain_events()
            .contains(&ReaderEvent::PageCountFailed { document: id }));
        assert_eq!(reader.state().num_pages, 0);
        assert_eq!(reader.state().document, Some(id));
        assert!(!reader.go_to_page(2));
        assert!(reader.page_content(1).is_none());
    }

    #[tokio::test]
    async fn bounded_cache_keeps_the_turn_target() {
        let config = ReaderConfig {
            cache_capacity: Some(1),
            transition_dwell: Duration::from_secs(30),
            ..ReaderConfig::default()
        };
        let mut reader = Reader::new(
            config,
            Arc::new(FakeSource::new(20)),
            Arc::new(crate::NoopTheme),
        );
        reader.load_document(pdf("book.pdf")).await.unwrap();
        while reader.state().num_pages == 0 {
            reader.next_completion().await;
        }
        while reader.cache().lookup(1).is_some_and(|l| l.is_pending()) {
            reader.next_completion().await;
        }
        assert_eq!(reader.cache().ready_pages(), vec![1]);

        assert!(reader.go_to_page(15));
        while reader.cache().lookup(15).is_some_and(|l| l.is_pending()) {
            reader.next_completion().await;
        }
        assert!(reader.state().is_transitioning);
        assert_eq!(reader.state().current_page, 1);
        assert_eq!(reader.cache().ready_pages(), vec![15]);
        assert!(reader.cache().lookup(15).and_then(PageLookup::ready).is_some());
    }
}
