//! Resolves a marker's file reference against the base directory.

use std::fs;
use std::path::Path;

use crate::error::SkipReason;
use crate::marker::EmbedMarker;

/// A marker whose referenced file has been loaded into memory.
#[derive(Debug, Clone)]
pub struct ResolvedAttachment {
    pub marker: EmbedMarker,
    pub bytes: Vec<u8>,
}

/// Load the bytes referenced by `marker`, relative to `base_dir`.
///
/// A missing or unreadable file is a recoverable [`SkipReason::FileNotFound`];
/// the pipeline logs it and moves on to the next marker. No size limit is
/// imposed here.
pub fn resolve(base_dir: &Path, marker: &EmbedMarker) -> Result<ResolvedAttachment, SkipReason> {
    let path = base_dir.join(&marker.file);
    let bytes = fs::read(&path).map_err(|_| SkipReason::FileNotFound(path.clone()))?;
    Ok(ResolvedAttachment {
        marker: marker.clone(),
        bytes,
    })
}
