use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use folio_core::{
    ByteSource, Command, IntakePolicy, PageContent, PageLookup, Reader, ReaderConfig, ReaderError,
    ReaderEvent,
};
use folio_render::PdfiumDocumentSource;
use folio_tty::{
    format_status, write_status_line, EventMapper, KittyCanvas, PageView, Placement,
    TerminalTheme, UiEvent,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const NOTICE_TTL: Duration = Duration::from_secs(4);
const PAGE_COUNT_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_COUNT_FAILED: &str = "Could not read the page count of this document.";

#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Book-style PDF reader for the terminal")]
struct Args {
    /// Page to open the document on (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Configuration file to use instead of the platform default
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Print a JSON summary of the document and exit
    #[arg(long)]
    inspect: bool,

    /// PDF file to open
    file: Option<PathBuf>,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config = match &args.config {
        Some(path) => ReaderConfig::load(path),
        None => ReaderConfig::load_from_dirs(&project_dirs),
    }
    .unwrap_or_else(|err| {
        warn!(error = %err, "{}", err.user_message());
        ReaderConfig::default()
    });
    let source = PdfiumDocumentSource::new(config.pdfium_library.as_deref(), config.intake_policy())?;
    let theme = TerminalTheme::new();
    let mut reader = Reader::new(config, Arc::new(source), Arc::new(theme.clone()));

    if args.inspect {
        let path = args
            .file
            .as_deref()
            .ok_or_else(|| anyhow!("--inspect needs a file"))?;
        open_file(&mut reader, path).await?;
        let summary = inspect(&mut reader).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        reader.close();
        return Ok(());
    }

    let mut initial_notice = None;
    if let Some(path) = &args.file {
        open_file(&mut reader, path).await?;
        if let Some(page) = args.page {
            match wait_for_page_count(&mut reader).await {
                PageCount::Resolved(_) => reader.apply(Command::GotoPage { page }),
                PageCount::Failed => initial_notice = Some(Notice::new(PAGE_COUNT_FAILED)),
            }
        }
    }

    let result = run_tui(&mut reader, &theme, initial_notice).await;
    reader.close();
    result
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewMode {
    Text,
    Image,
}

struct Notice {
    text: String,
    shown_at: Instant,
}

impl Notice {
    fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            shown_at: Instant::now(),
        }
    }

    fn expired(&self) -> bool {
        self.shown_at.elapsed() >= NOTICE_TTL
    }
}

async fn run_tui(
    reader: &mut Reader,
    theme: &TerminalTheme,
    mut notice: Option<Notice>,
) -> Result<()> {
    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut canvas = KittyCanvas::new(stdout);
    let mut mapper = EventMapper::new(reader.config().zoom_step);
    let mut view = ViewMode::Text;
    let mut dirty = true;

    loop {
        let applied = reader.process_pending();
        let events = reader.drain_events();
        if events
            .iter()
            .any(|event| matches!(event, ReaderEvent::PageCountFailed { .. }))
        {
            notice = Some(Notice::new(PAGE_COUNT_FAILED));
        }
        if applied > 0 || !events.is_empty() {
            dirty = true;
        }
        if notice.as_ref().is_some_and(Notice::expired) {
            notice = None;
            dirty = true;
        }

        if dirty {
            let pending = mapper.pending_input();
            redraw(
                &mut canvas,
                reader,
                theme,
                view,
                pending.as_deref(),
                notice.as_ref(),
            )?;
            dirty = false;
        }

        if event::poll(Duration::from_millis(100))? {
            let ui_event = mapper.map_event(event::read()?);
            match handle_event(ui_event, reader, &mut view, &mut notice).await {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
        }
    }

    canvas.clear_image()?;
    {
        let writer = canvas.writer();
        crossterm::execute!(writer, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    }
    Ok(())
}

async fn handle_event(
    event: UiEvent,
    reader: &mut Reader,
    view: &mut ViewMode,
    notice: &mut Option<Notice>,
) -> LoopAction {
    match event {
        UiEvent::Command(command) => {
            reader.apply(command);
            LoopAction::ContinueRedraw
        }
        UiEvent::FontLarger => {
            let size = reader.state().font_size.larger();
            reader.apply(Command::SetFontSize { size });
            LoopAction::ContinueRedraw
        }
        UiEvent::FontSmaller => {
            let size = reader.state().font_size.smaller();
            reader.apply(Command::SetFontSize { size });
            LoopAction::ContinueRedraw
        }
        UiEvent::ToggleView => {
            *view = match *view {
                ViewMode::Text => ViewMode::Image,
                ViewMode::Image => ViewMode::Text,
            };
            LoopAction::ContinueRedraw
        }
        UiEvent::CopyPageText => {
            let page = reader.state().current_page;
            let text = reader
                .page_content(page)
                .and_then(PageLookup::ready)
                .map(|content| content.text.clone());
            *notice = Some(match text {
                Some(text) => match copy_to_clipboard(text) {
                    Ok(()) => Notice::new(format!("Copied page {page}.")),
                    Err(err) => {
                        warn!(?err, "clipboard copy failed");
                        Notice::new("Clipboard is unavailable.")
                    }
                },
                None => Notice::new("Page text is not ready yet."),
            });
            LoopAction::ContinueRedraw
        }
        UiEvent::HighlightSubmit { text } => {
            reader.apply(Command::AddHighlight {
                page: None,
                text,
                regions: Vec::new(),
            });
            LoopAction::ContinueRedraw
        }
        UiEvent::OpenSubmit { path } => {
            if let Err(err) = open_file(reader, Path::new(&path)).await {
                *notice = Some(Notice::new(notice_for(&err)));
            }
            LoopAction::ContinueRedraw
        }
        UiEvent::BeginInput { .. } | UiEvent::InputChanged { .. } | UiEvent::InputCancel => {
            LoopAction::ContinueRedraw
        }
        UiEvent::Quit => LoopAction::Quit,
        UiEvent::None => LoopAction::Continue,
    }
}

fn redraw(
    canvas: &mut KittyCanvas<io::Stdout>,
    reader: &mut Reader,
    theme: &TerminalTheme,
    view: ViewMode,
    pending_input: Option<&str>,
    notice: Option<&Notice>,
) -> Result<()> {
    let (cols, rows) = terminal::size()?;
    let palette = theme.palette();
    canvas.begin_sync_update()?;
    canvas.clear_all(palette)?;

    let page = reader.state().current_page;
    let mut drew_image = false;
    if view == ViewMode::Image && reader.state().num_pages > 0 {
        match reader.render_current_page() {
            Ok(Some(image)) => {
                let (columns, image_rows) = fit_cells(image.width, image.height, cols, rows)?;
                let column = cols.saturating_sub(columns as u16) / 2;
                canvas.draw(&image, Placement::clamped(column, 0, columns, image_rows))?;
                drew_image = true;
            }
            Ok(None) => {}
            Err(err) => warn!(?err, page, "failed to render page, showing text instead"),
        }
    }
    if !drew_image && reader.state().num_pages > 0 {
        let spans = reader.highlight_spans(page);
        let font_size = reader.state().font_size;
        let page_view = match reader.page_content(page) {
            Some(PageLookup::Ready(content)) => {
                PageView::from_content(page, content, &spans, font_size, usize::from(cols))
            }
            _ => PageView::pending(page),
        };
        page_view.draw(canvas.writer(), cols, rows.saturating_sub(1), palette)?;
    }

    let status = format_status(
        reader.state(),
        pending_input,
        notice.map(|notice| notice.text.as_str()),
    );
    write_status_line(canvas.writer(), cols, rows, &status, palette)?;
    canvas.end_sync_update()?;
    Ok(())
}

/// Cells covered by an image scaled to fit above the status line, keeping its aspect ratio.
fn fit_cells(width: u32, height: u32, cols: u16, rows: u16) -> Result<(u32, u32)> {
    let available_cols = u32::from(cols).max(1);
    let available_rows = u32::from(rows).saturating_sub(1).max(1);
    if width == 0 || height == 0 {
        return Ok((available_cols, available_rows));
    }
    let window = terminal::window_size()?;
    let (cell_width, cell_height) = if window.width > 0 && window.height > 0 {
        (
            f32::from(window.width) / f32::from(window.columns.max(1)),
            f32::from(window.height) / f32::from(window.rows.max(1)),
        )
    } else {
        (1.0, 2.0)
    };
    Ok(fit_with_cell_size(
        width,
        height,
        available_cols,
        available_rows,
        cell_width,
        cell_height,
    ))
}

fn fit_with_cell_size(
    width: u32,
    height: u32,
    available_cols: u32,
    available_rows: u32,
    cell_width: f32,
    cell_height: f32,
) -> (u32, u32) {
    let image_ratio = width as f32 / height as f32;
    let mut cols = available_cols as f32;
    let mut rows = cols * cell_width / image_ratio / cell_height;
    if rows > available_rows as f32 {
        rows = available_rows as f32;
        cols = rows * cell_height * image_ratio / cell_width;
    }
    (
        (cols.round() as u32).clamp(1, available_cols),
        (rows.round() as u32).clamp(1, available_rows),
    )
}

async fn open_file(reader: &mut Reader, path: &Path) -> Result<()> {
    let source = read_source(path, &reader.config().intake_policy())?;
    let id = reader.load_document(source).await?;
    info!(document = %id, path = %path.display(), "opened file");
    Ok(())
}

/// Reads `path` only after its extension and on-disk size pass `policy`.
fn read_source(path: &Path, policy: &IntakePolicy) -> Result<ByteSource> {
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to read {}", path.display()))?;
    policy.admit_file(path, metadata.len())?;
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ByteSource::from_path_bytes(path, bytes))
}

fn notice_for(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ReaderError>() {
        Some(reader_err) => reader_err.user_message(),
        None => err.to_string(),
    }
}

fn copy_to_clipboard(text: String) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new()?;
    clipboard.set_text(text)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageCount {
    Resolved(usize),
    Failed,
}

async fn wait_for_page_count(reader: &mut Reader) -> PageCount {
    let document = reader.state().document;
    let outcome = tokio::time::timeout(PAGE_COUNT_TIMEOUT, async {
        loop {
            reader.next_completion().await;
            for event in reader.drain_events() {
                match event {
                    ReaderEvent::PageCountResolved {
                        document: resolved,
                        pages,
                    } if Some(resolved) == document => return PageCount::Resolved(pages),
                    ReaderEvent::PageCountFailed { document: failed }
                        if Some(failed) == document =>
                    {
                        return PageCount::Failed;
                    }
                    _ => {}
                }
            }
        }
    })
    .await;
    outcome.unwrap_or_else(|_| {
        warn!(timeout = ?PAGE_COUNT_TIMEOUT, "timed out resolving the page count");
        PageCount::Failed
    })
}

#[derive(Debug, Serialize)]
struct DocumentSummary {
    name: Option<String>,
    pages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    page_details: Vec<PageSummary>,
}

#[derive(Debug, Serialize)]
struct PageSummary {
    page: usize,
    text_chars: usize,
    images: usize,
}

impl PageSummary {
    fn from_content(page: usize, content: &PageContent) -> Self {
        Self {
            page,
            text_chars: content.text.chars().count(),
            images: content.images.len(),
        }
    }
}

async fn inspect(reader: &mut Reader) -> Result<DocumentSummary> {
    let (pages, error) = match wait_for_page_count(reader).await {
        PageCount::Resolved(pages) => (pages, None),
        PageCount::Failed => (0, Some(PAGE_COUNT_FAILED.to_owned())),
    };
    let mut page_details = Vec::with_capacity(pages);
    for page in 1..=pages {
        let content = wait_for_content(reader, page).await;
        page_details.push(PageSummary::from_content(page, &content));
    }
    Ok(DocumentSummary {
        name: reader.state().document_name.clone(),
        pages,
        error,
        page_details,
    })
}

async fn wait_for_content(reader: &mut Reader, page: usize) -> PageContent {
    loop {
        match reader.page_content(page) {
            Some(PageLookup::Ready(content)) => return content.clone(),
            Some(PageLookup::Pending) => {}
            None => return PageContent::empty(),
        }
        reader.next_completion().await;
    }
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::bail;
    use async_trait::async_trait;
    use folio_core::{
        DocumentBackend, DocumentInfo, DocumentSource, ReaderResult, RenderImage, RenderRequest,
    };
    use uuid::Uuid;

    use super::*;

    #[test]
    fn portrait_page_is_limited_by_rows() {
        let (cols, rows) = fit_with_cell_size(600, 800, 100, 40, 10.0, 20.0);
        assert_eq!(rows, 40);
        assert_eq!(cols, 60);
    }

    #[test]
    fn landscape_page_is_limited_by_columns() {
        let (cols, rows) = fit_with_cell_size(1600, 400, 80, 40, 10.0, 20.0);
        assert_eq!(cols, 80);
        assert_eq!(rows, 10);
    }

    #[test]
    fn reader_errors_use_short_messages() {
        let err = anyhow::Error::new(ReaderError::TooLarge {
            size: 60 * 1024 * 1024,
            limit: 50 * 1024 * 1024,
        });
        assert_eq!(
            notice_for(&err),
            "The file is too large. Maximum size is 50 MB."
        );
        assert_eq!(notice_for(&anyhow!("disk gone")), "disk gone");
    }

    #[test]
    fn args_accept_page_and_inspect() {
        let args = Args::try_parse_from(["folio", "--inspect", "-p", "3", "book.pdf"]).unwrap();
        assert!(args.inspect);
        assert_eq!(args.page, Some(3));
        assert_eq!(args.file.as_deref(), Some(Path::new("book.pdf")));
    }

    struct UncountableBackend {
        info: DocumentInfo,
    }

    impl DocumentBackend for UncountableBackend {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn page_count(&self) -> anyhow::Result<usize> {
            bail!("xref table is damaged")
        }

        fn extract_page(&self, _page_index: usize) -> anyhow::Result<PageContent> {
            Ok(PageContent::empty())
        }

        fn render_page(&self, _request: RenderRequest) -> anyhow::Result<RenderImage> {
            bail!("nothing to render")
        }

        fn release(&self) {}
    }

    struct UncountableSource;

    #[async_trait]
    impl DocumentSource for UncountableSource {
        async fn load(&self, source: ByteSource) -> ReaderResult<Arc<dyn DocumentBackend>> {
            Ok(Arc::new(UncountableBackend {
                info: DocumentInfo {
                    id: Uuid::new_v4(),
                    name: source.name,
                    title: None,
                    byte_len: source.bytes.len() as u64,
                },
            }))
        }
    }

    async fn uncountable_reader() -> Reader {
        let mut reader = Reader::new(
            ReaderConfig::default(),
            Arc::new(UncountableSource),
            Arc::new(TerminalTheme::new()),
        );
        reader
            .load_document(ByteSource::new("damaged.pdf", None, &b"%PDF-1.4"[..]))
            .await
            .unwrap();
        reader
    }

    #[tokio::test]
    async fn failed_page_count_returns_promptly() {
        let mut reader = uncountable_reader().await;
        let outcome = tokio::time::timeout(Duration::from_secs(5), wait_for_page_count(&mut reader))
            .await
            .expect("page count wait should end on failure");
        assert_eq!(outcome, PageCount::Failed);
        assert_eq!(reader.state().num_pages, 0);
    }

    #[tokio::test]
    async fn inspect_reports_failed_page_count() {
        let mut reader = uncountable_reader().await;
        let summary = tokio::time::timeout(Duration::from_secs(5), inspect(&mut reader))
            .await
            .expect("inspect should not wait out the timeout")
            .unwrap();
        assert_eq!(summary.pages, 0);
        assert!(summary.page_details.is_empty());
        assert_eq!(summary.error.as_deref(), Some(PAGE_COUNT_FAILED));
    }

    fn write_temp(suffix: &str, bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn oversized_file_is_rejected_before_reading() {
        let file = write_temp(".pdf", &[b'%'; 16]);
        let err = read_source(file.path(), &IntakePolicy::new(8)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReaderError>(),
            Some(ReaderError::TooLarge { size: 16, limit: 8 })
        ));
    }

    #[test]
    fn wrong_extension_is_rejected_before_size() {
        let file = write_temp(".png", &[0u8; 16]);
        let err = read_source(file.path(), &IntakePolicy::new(8)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReaderError>(),
            Some(ReaderError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn admitted_file_keeps_its_name_and_type() {
        let file = write_temp(".pdf", b"%PDF-1.7 body");
        let source = read_source(file.path(), &IntakePolicy::default()).unwrap();
        assert_eq!(source.mime.as_deref(), Some("application/pdf"));
        assert_eq!(&source.bytes[..], b"%PDF-1.7 body");
        assert!(source.name.ends_with(".pdf"));
    }
}
