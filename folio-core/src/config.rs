use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::{debug, info};

use crate::error::{ReaderError, ReaderResult};
use crate::highlight::HighlightMode;
use crate::intake::{IntakePolicy, DEFAULT_MAX_DOCUMENT_BYTES};
use crate::transition::DEFAULT_DWELL;
use crate::FontSize;

pub const CONFIG_FILE_NAME: &str = "config.toml";

pub const MIN_ZOOM: f32 = 0.5;
pub const MAX_ZOOM: f32 = 2.5;

/// Preferences that survive a document swap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub zoom: f32,
    pub font_size: FontSize,
    pub dark_mode: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            font_size: FontSize::default(),
            dark_mode: false,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub max_document_bytes: u64,
    #[serde(rename = "transition_dwell_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub transition_dwell: Duration,
    pub zoom_step: f32,
    /// Upper bound on ready pages kept in the content cache; unbounded when absent.
    pub cache_capacity: Option<usize>,
    pub highlight_mode: HighlightMode,
    pub pdfium_library: Option<PathBuf>,
    pub preferences: Preferences,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            transition_dwell: DEFAULT_DWELL,
            zoom_step: 0.1,
            cache_capacity: None,
            highlight_mode: HighlightMode::default(),
            pdfium_library: None,
            preferences: Preferences::default(),
        }
    }
}

impl ReaderConfig {
    pub fn intake_policy(&self) -> IntakePolicy {
        IntakePolicy::new(self.max_document_bytes)
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> ReaderResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|err| ReaderError::Config {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let config = Self::parse(&raw).map_err(|message| ReaderError::Config {
            path: path.to_path_buf(),
            message,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn load_from_dirs(dirs: &ProjectDirs) -> ReaderResult<Self> {
        Self::load(&dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut config: Self = toml::from_str(raw).map_err(|err| err.to_string())?;
        config.sanitize();
        Ok(config)
    }

    fn sanitize(&mut self) {
        if !self.zoom_step.is_finite() || self.zoom_step <= 0.0 {
            self.zoom_step = Self::default().zoom_step;
        }
        let zoom = self.preferences.zoom;
        self.preferences.zoom = if zoom.is_finite() {
            zoom.clamp(MIN_ZOOM, MAX_ZOOM)
        } else {
            1.0
        };
        if self.max_document_bytes == 0 {
            self.max_document_bytes = DEFAULT_MAX_DOCUMENT_BYTES;
        }
    }
}
