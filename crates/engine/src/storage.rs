//! On-disk image persistence and the prompt log.
//!
//! The only durable artifact the pipeline produces: PNG files named
//! `{prefix}.{seed}.png` in the output directory, plus one log line per
//! saved image recording the prompt and seed that produced it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};

use crate::error::EngineError;

/// Name of the prompt log kept next to the images.
const LOG_FILE: &str = "dream_log.txt";

/// Width of the zero-padded numeric prefix.
const PREFIX_DIGITS: usize = 6;

/// Image storage collaborator rooted at one output directory.
pub struct ImageStorage {
    outdir: PathBuf,
}

impl ImageStorage {
    /// Open (creating if needed) the output directory.
    pub fn new(outdir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let outdir = outdir.into();
        fs::create_dir_all(&outdir)
            .map_err(|e| EngineError::Storage(format!("cannot create {}: {e}", outdir.display())))?;
        Ok(Self { outdir })
    }

    /// The directory images are written to.
    pub fn dir(&self) -> &Path {
        &self.outdir
    }

    /// Next collision-free filename prefix: one past the highest numeric
    /// prefix already present, zero-padded (`000001`, `000002`, ...).
    pub fn unique_prefix(&self) -> String {
        let highest = fs::read_dir(&self.outdir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| numeric_prefix(&entry.file_name().to_string_lossy()))
            .max()
            .unwrap_or(0);
        format!("{:0width$}", highest + 1, width = PREFIX_DIGITS)
    }

    /// Write `image` as `{outdir}/{name}` (PNG) and append the caption to
    /// the prompt log. Returns the path of the saved file.
    pub fn save(
        &self,
        image: &DynamicImage,
        name: &str,
        caption: &str,
    ) -> Result<PathBuf, EngineError> {
        let path = self.outdir.join(name);
        image
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| EngineError::Storage(format!("cannot write {}: {e}", path.display())))?;

        if let Err(e) = self.append_log(name, caption) {
            // The image itself is safe; a log write failure is not worth
            // failing the job over.
            tracing::warn!(error = %e, "Failed to append to prompt log");
        }

        Ok(path)
    }

    fn append_log(&self, name: &str, caption: &str) -> std::io::Result<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.outdir.join(LOG_FILE))?;
        writeln!(log, "{name}: {caption}")
    }
}

/// Parse the numeric prefix of a filename like `000012.42.png`.
fn numeric_prefix(name: &str) -> Option<u64> {
    name.split('.').next()?.parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
