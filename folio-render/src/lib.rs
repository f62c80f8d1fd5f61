use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use folio_core::{
    ByteSource, DocumentBackend, DocumentId, DocumentInfo, DocumentSource, ImageRef,
    IntakePolicy, PageContent, ReaderError, ReaderResult, RenderImage, RenderRequest,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, info, instrument, warn};

/// Document source backed by a pdfium library bound at startup.
pub struct PdfiumDocumentSource {
    pdfium: Arc<Pdfium>,
    intake: IntakePolicy,
}

impl PdfiumDocumentSource {
    /// Binds pdfium from `library` when given, otherwise from the working directory or
    /// the system library path.
    pub fn new(library: Option<&Path>, intake: IntakePolicy) -> Result<Self> {
        let pdfium = match library {
            Some(path) => bind_pdfium_at(path)?,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
            intake,
        })
    }
}

#[async_trait]
impl DocumentSource for PdfiumDocumentSource {
    #[instrument(skip(self, source), fields(name = %source.name))]
    async fn load(&self, source: ByteSource) -> ReaderResult<Arc<dyn DocumentBackend>> {
        self.intake.admit(&source)?;
        let ByteSource { name, bytes, .. } = source;
        let byte_len = bytes.len() as u64;

        let document = self
            .pdfium
            .load_pdf_from_byte_vec(bytes.to_vec(), None)
            .map_err(|err| ReaderError::DocumentLoad {
                name: name.clone(),
                source: anyhow::Error::new(err),
            })?;
        // SAFETY: the document borrows the bindings owned by `self.pdfium`. `PdfiumDocument`
        // declares `document` before `_bindings`, so the document is dropped first and the
        // `Arc` keeps the bindings alive for as long as the document exists.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };

        let title = document
            .metadata()
            .get(PdfDocumentMetadataTagType::Title)
            .map(|tag| tag.value().trim().to_owned())
            .filter(|title| !title.is_empty());
        let info = DocumentInfo {
            id: DocumentId::new_v4(),
            name,
            title,
            byte_len,
        };
        info!(document = %info.id, byte_len, "pdfium document opened");

        Ok(Arc::new(PdfiumDocument {
            document: Mutex::new(Some(document)),
            render_cache: Mutex::new(None),
            released: AtomicBool::new(false),
            info,
            _bindings: Arc::clone(&self.pdfium),
        }))
    }
}

struct PdfiumDocument {
    document: Mutex<Option<PdfDocument<'static>>>,
    render_cache: Mutex<Option<RenderCacheEntry>>,
    released: AtomicBool,
    info: DocumentInfo,
    _bindings: Arc<Pdfium>,
}

struct RenderCacheEntry {
    page_index: usize,
    scale: f32,
    dark_mode: bool,
    image: RenderImage,
}

impl PdfiumDocument {
    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let guard = self.document.lock();
        match guard.as_ref() {
            Some(document) => f(document),
            None => bail!("document {} has been released", self.info.id),
        }
    }

    fn page<'a>(document: &'a PdfDocument<'static>, page_index: usize) -> Result<PdfPage<'a>> {
        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))
    }

    fn render_internal(
        &self,
        document: &PdfDocument<'static>,
        request: &RenderRequest,
    ) -> Result<RenderImage> {
        let page = Self::page(document, request.page_index)?;
        let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", request.page_index))?;
        let image = bitmap.as_image().to_rgba8();
        let (width, height) = image.dimensions();
        let mut pixels = image.into_raw();

        if request.dark_mode {
            invert_pixels(&mut pixels);
        }

        Ok(RenderImage {
            width,
            height,
            pixels,
        })
    }
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_count(&self) -> Result<usize> {
        self.with_document(|document| {
            Ok(usize::try_from(document.pages().len()).unwrap_or_default())
        })
    }

    #[instrument(skip(self), fields(document = %self.info.id))]
    fn extract_page(&self, page_index: usize) -> Result<PageContent> {
        self.with_document(|document| {
            let page = Self::page(document, page_index)?;
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?
                .all();

            let images = page
                .objects()
                .iter()
                .filter(|object| object.object_type() == PdfPageObjectType::Image)
                .enumerate()
                .map(|(index, object)| ImageRef {
                    page: page_index + 1,
                    index,
                    width_pt: object.width().map(|w| w.value).unwrap_or_default(),
                    height_pt: object.height().map(|h| h.value).unwrap_or_default(),
                })
                .collect::<Vec<_>>();

            debug!(
                page_index,
                chars = text.len(),
                images = images.len(),
                "page content extracted"
            );
            Ok(PageContent { text, images })
        })
    }

    #[instrument(skip(self), fields(document = %self.info.id))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        {
            let cache = self.render_cache.lock();
            if let Some(entry) = cache.as_ref() {
                if entry.page_index == request.page_index
                    && (entry.scale - request.scale).abs() < f32::EPSILON
                    && entry.dark_mode == request.dark_mode
                {
                    return Ok(entry.image.clone());
                }
            }
        }

        let image = self.with_document(|document| self.render_internal(document, &request))?;

        *self.render_cache.lock() = Some(RenderCacheEntry {
            page_index: request.page_index,
            scale: request.scale,
            dark_mode: request.dark_mode,
            image: image.clone(),
        });

        Ok(image)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            warn!(document = %self.info.id, "document released twice");
            return;
        }
        self.render_cache.lock().take();
        self.document.lock().take();
        debug!(document = %self.info.id, "pdfium document closed");
    }
}

fn invert_pixels(pixels: &mut [u8]) {
    for chunk in pixels.chunks_exact_mut(4) {
        chunk[0] = 255 - chunk[0];
        chunk[1] = 255 - chunk[1];
        chunk[2] = 255 - chunk[2];
    }
}

fn bind_pdfium_at(path: &Path) -> Result<Pdfium> {
    let bindings = Pdfium::bind_to_library(path)
        .map_err(|err| anyhow!("failed to load pdfium from {}: {}", path.display(), err))?;
    Ok(Pdfium::new(bindings))
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    if let Some(path) = std::env::var_os("FOLIO_PDFIUM_LIBRARY") {
        match Pdfium::bind_to_library(&path) {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(err) => errors.push(format!("{}: {}", Path::new(&path).display(), err)),
        }
    }

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
