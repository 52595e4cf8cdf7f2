//! Run report accumulated by the pipeline driver.

use serde::Serialize;

/// Outcome of one run: how many files were embedded, how many annotations
/// were placed, and which markers were skipped and why. Always produced,
/// including for a run that found zero markers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbedReport {
    /// Embed markers returned by the query (before resolution).
    pub markers: usize,
    /// New entries added to the embedded-file collection.
    pub embedded: u32,
    /// Clickable annotations placed on pages.
    pub annotated: u32,
    pub skipped: Vec<SkippedMarker>,
}

/// A marker that did not get the full embed-and-annotate treatment.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedMarker {
    pub file: String,
    pub page: Option<u32>,
    pub reason: String,
}

impl EmbedReport {
    pub fn record_skip(
        &mut self,
        file: impl Into<String>,
        page: Option<u32>,
        reason: impl std::fmt::Display,
    ) {
        self.skipped.push(SkippedMarker {
            file: file.into(),
            page,
            reason: reason.to_string(),
        });
    }

    /// One-line summary for the end of a run.
    pub fn summary(&self) -> String {
        format!(
            "embedded={} annotated={} skipped={}",
            self.embedded,
            self.annotated,
            self.skipped.len()
        )
    }
}
