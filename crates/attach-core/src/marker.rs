//! Embed-marker records produced by the metadata query.
//!
//! `typst query` returns every `metadata` element in the document; only
//! the ones whose value carries `"kind": "embed-file"` concern us. Kind
//! filtering is the driver's job (see [`record_kind`]), so a record of a
//! different kind never reaches [`EmbedMarker::from_value`] and a parse
//! failure always means a genuinely malformed embed marker.

use serde::Deserialize;
use serde_json::Value;

use crate::error::SkipReason;

/// Discriminator value identifying an embed-file marker record.
pub const EMBED_KIND: &str = "embed-file";

/// One file-attachment request declared in the source document.
///
/// `x`/`y` are points from the page's top-left corner. They identify the
/// source position of the marker but do not drive final placement; the
/// annotation placer uses a deterministic top-right stacking layout.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedMarker {
    pub file: String,
    pub desc: String,
    /// 1-based page number.
    pub page: u32,
    pub x: f64,
    pub y: f64,
}

/// Wire shape of a marker value, before validation.
#[derive(Debug, Deserialize)]
struct RawMarker {
    file: String,
    #[serde(default)]
    desc: Option<String>,
    page: i64,
    x: f64,
    y: f64,
}

impl EmbedMarker {
    /// Parse a query record's `value` into a validated marker.
    ///
    /// The caller must have filtered on [`record_kind`] first; this
    /// function treats every shape mismatch as [`SkipReason::MalformedMarker`].
    pub fn from_value(value: &Value) -> Result<EmbedMarker, SkipReason> {
        let raw: RawMarker = serde_json::from_value(value.clone())
            .map_err(|e| SkipReason::MalformedMarker(e.to_string()))?;

        if raw.file.is_empty() {
            return Err(SkipReason::MalformedMarker("empty file name".into()));
        }
        if raw.page < 1 || raw.page > u32::MAX as i64 {
            return Err(SkipReason::MalformedMarker(format!(
                "page must be a positive integer, got {}",
                raw.page
            )));
        }
        if !raw.x.is_finite() || !raw.y.is_finite() {
            return Err(SkipReason::MalformedMarker(format!(
                "non-finite position ({}, {})",
                raw.x, raw.y
            )));
        }

        let desc = match raw.desc {
            Some(d) if !d.is_empty() => d,
            _ => raw.file.clone(),
        };

        Ok(EmbedMarker {
            file: raw.file,
            desc,
            page: raw.page as u32,
            x: raw.x,
            y: raw.y,
        })
    }
}

/// The `kind` discriminator of a query record's value, if any.
pub fn record_kind(value: &Value) -> Option<&str> {
    value.get("kind")?.as_str()
}

/// Unwrap query record wrappers (`{ "func": ..., "value": ... }`) and keep
/// only the values tagged as embed-file markers.
pub fn embed_values(records: &[Value]) -> Vec<&Value> {
    records
        .iter()
        .filter_map(|record| record.get("value"))
        .filter(|value| record_kind(value) == Some(EMBED_KIND))
        .collect()
}

/// Best-effort file name for reporting on records that fail to parse.
pub fn file_hint(value: &Value) -> String {
    value
        .get("file")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string()
}
