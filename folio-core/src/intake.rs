use std::path::Path;

use bytes::Bytes;

use crate::error::{ReaderError, ReaderResult};

pub const PDF_MIME: &str = "application/pdf";
pub const PDF_SIGNATURE: &[u8] = b"%PDF-";
pub const DEFAULT_MAX_DOCUMENT_BYTES: u64 = 50 * 1024 * 1024;

/// A single binary object handed to the reader, e.g. a file read from disk.
#[derive(Debug, Clone)]
pub struct ByteSource {
    pub name: String,
    /// Declared media type. When absent the content signature decides.
    pub mime: Option<String>,
    pub bytes: Bytes,
}

impl ByteSource {
    pub fn new(name: impl Into<String>, mime: Option<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime,
            bytes: bytes.into(),
        }
    }

    /// Builds a source from a path, declaring the PDF media type for `.pdf` files.
    pub fn from_path_bytes(path: &Path, bytes: impl Into<Bytes>) -> Self {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("<unnamed>")
            .to_owned();
        Self::new(name, mime_for_path(path), bytes)
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub fn mime_for_path(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(PDF_MIME.to_owned()),
        "txt" => Some("text/plain".to_owned()),
        "epub" => Some("application/epub+zip".to_owned()),
        "png" => Some("image/png".to_owned()),
        "jpg" | "jpeg" => Some("image/jpeg".to_owned()),
        _ => None,
    }
}

/// Checks applied to a [`ByteSource`] before any engine work starts.
#[derive(Debug, Clone, Copy)]
pub struct IntakePolicy {
    pub max_bytes: u64,
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }
}

impl IntakePolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Type is checked before size.
    pub fn admit(&self, source: &ByteSource) -> ReaderResult<()> {
        match source.mime.as_deref() {
            Some(mime) => check_mime(mime)?,
            None => {
                if !source.bytes.starts_with(PDF_SIGNATURE) {
                    return Err(ReaderError::UnsupportedFormat {
                        found: "unrecognised content".to_owned(),
                    });
                }
            }
        }
        self.check_size(source.len())
    }

    /// Checks a file on disk before its bytes are read. Files without a known
    /// extension pass the type check here and are sniffed by [`IntakePolicy::admit`].
    pub fn admit_file(&self, path: &Path, size: u64) -> ReaderResult<()> {
        if let Some(mime) = mime_for_path(path) {
            check_mime(&mime)?;
        }
        self.check_size(size)
    }

    fn check_size(&self, size: u64) -> ReaderResult<()> {
        if size > self.max_bytes {
            return Err(ReaderError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

fn check_mime(mime: &str) -> ReaderResult<()> {
    if mime.eq_ignore_ascii_case(PDF_MIME) {
        Ok(())
    } else {
        Err(ReaderError::UnsupportedFormat {
            found: mime.to_owned(),
        })
    }
}
