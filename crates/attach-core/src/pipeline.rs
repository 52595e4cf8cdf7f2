//! Pipeline driver: compile, query, embed, annotate, persist.
//!
//! The driver owns the document for the whole run and processes markers
//! strictly in input order; per-marker failures are logged and recorded
//! in the report while the run continues. Only compile, query, open and
//! persist failures abort.

use std::fs;
use std::path::{Path, PathBuf};

use lopdf::{Document, IncrementalDocument};
use tracing::{debug, info, warn};

use crate::annotate::AnnotationPlacer;
use crate::error::{AttachError, SkipReason};
use crate::marker::{self, EmbedMarker};
use crate::report::EmbedReport;
use crate::resolver;
use crate::store::{AttachmentStore, StoreOutcome};
use crate::typst::TypstTools;

/// Query selector that returns all metadata records.
const METADATA_SELECTOR: &str = "metadata";

/// Stages of one run. Fatal errors know which stage they aborted
/// ([`AttachError::stage`]); the error itself is the absorbing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Compiling,
    Querying,
    Embedding,
    Persisting,
    Done,
}

/// Inputs of one run; `output` and `base_dir` fall back to paths derived
/// from `source`.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// The `.typ` source document.
    pub source: PathBuf,
    /// Target PDF; defaults to `source` with a `.pdf` extension.
    pub output: Option<PathBuf>,
    /// Directory attachment paths resolve against; defaults to the
    /// source's containing directory.
    pub base_dir: Option<PathBuf>,
}

impl RunRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        RunRequest {
            source: source.into(),
            output: None,
            base_dir: None,
        }
    }
}

/// Run the full pipeline and return the accumulated report.
pub fn run(tools: &dyn TypstTools, request: &RunRequest) -> Result<EmbedReport, AttachError> {
    let source = &request.source;
    if !source.is_file() {
        return Err(AttachError::SourceNotFound(source.clone()));
    }
    let output = request
        .output
        .clone()
        .unwrap_or_else(|| source.with_extension("pdf"));
    let base_dir = request.base_dir.clone().unwrap_or_else(|| {
        match source.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    });

    info!(stage = ?Stage::Compiling, "compiling {} -> {}", source.display(), output.display());
    let compiled = tools.compile(source, &output)?;
    for line in &compiled.diagnostics {
        if line.to_ascii_lowercase().contains("error") {
            warn!("typst: {line}");
        } else {
            debug!("typst: {line}");
        }
    }

    info!(stage = ?Stage::Querying, "querying embed-file markers");
    let records = tools.query(source, METADATA_SELECTOR)?;
    let values = marker::embed_values(&records);

    let mut report = EmbedReport {
        markers: values.len(),
        ..Default::default()
    };
    if values.is_empty() {
        info!("no embed-file markers found; document left as compiled");
        return Ok(report);
    }
    info!("found {} embed-file marker(s)", values.len());

    info!(stage = ?Stage::Embedding, "embedding attachments");
    let mut doc = open_incremental(&output)?;
    let mut store = AttachmentStore::scan(doc.get_prev_documents());
    let mut placer = AnnotationPlacer::new(doc.get_prev_documents());

    for value in values {
        let embed_marker = match EmbedMarker::from_value(value) {
            Ok(m) => m,
            Err(reason) => {
                let file = marker::file_hint(value);
                warn!("skipping {file}: {reason}");
                report.record_skip(file, None, reason);
                continue;
            }
        };

        let resolved = match resolver::resolve(&base_dir, &embed_marker) {
            Ok(r) => r,
            Err(reason) => {
                warn!("skipping {}: {reason}", embed_marker.file);
                report.record_skip(&embed_marker.file, Some(embed_marker.page), reason);
                continue;
            }
        };

        let size = resolved.bytes.len();
        let filespec_id = match store.insert(
            &mut doc,
            &embed_marker.file,
            &embed_marker.desc,
            resolved.bytes,
        ) {
            StoreOutcome::Inserted(id) => {
                report.embedded += 1;
                info!("embedded {} ({size} bytes)", embed_marker.file);
                id
            }
            StoreOutcome::Duplicate(id) => {
                let reason = SkipReason::DuplicateAttachment(embed_marker.file.clone());
                warn!("{reason}");
                report.record_skip(&embed_marker.file, Some(embed_marker.page), reason);
                id
            }
        };

        match placer.place(&mut doc, &embed_marker, filespec_id) {
            Ok((x, y)) => {
                report.annotated += 1;
                info!(
                    "annotation on page {} at ({x:.1}, {y:.1}): {}",
                    embed_marker.page, embed_marker.file
                );
            }
            Err(err) => {
                warn!("no annotation for {}: {err}", embed_marker.file);
                report.record_skip(&embed_marker.file, Some(embed_marker.page), err);
            }
        }
    }

    if store.added() > 0 || placer.placed() > 0 {
        info!(stage = ?Stage::Persisting, "appending incremental update to {}", output.display());
        persist(&mut doc, &store, &output)?;
    } else {
        info!("no mutations; document left as compiled");
    }

    info!(stage = ?Stage::Done, "{}", report.summary());
    Ok(report)
}

/// Write the name tree and append the incremental section in one go.
fn persist(
    doc: &mut IncrementalDocument,
    store: &AttachmentStore,
    output: &Path,
) -> Result<(), AttachError> {
    let persist_err = |reason: String| AttachError::PersistFailed {
        path: output.to_path_buf(),
        reason,
    };

    store
        .finalize(doc)
        .map_err(|e| persist_err(e.to_string()))?;

    // The incremental trailer must point at the same catalog.
    if let Ok(root) = doc
        .get_prev_documents()
        .trailer
        .get(b"Root")
        .and_then(|obj| obj.as_reference())
    {
        doc.new_document.trailer.set("Root", root);
    }

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| persist_err(e.to_string()))?;
    fs::write(output, buffer).map_err(|e| persist_err(e.to_string()))
}

fn open_incremental(path: &Path) -> Result<IncrementalDocument, AttachError> {
    let open_err = |reason: String| AttachError::DocumentOpen {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| open_err(e.to_string()))?;
    incremental_from_bytes(bytes).map_err(|e| open_err(e.to_string()))
}

/// Wrap freshly parsed bytes for append-only mutation. New object ids must
/// continue after the highest previous id.
pub(crate) fn incremental_from_bytes(bytes: Vec<u8>) -> Result<IncrementalDocument, lopdf::Error> {
    let prev = Document::load_mem(&bytes)?;
    let mut doc = IncrementalDocument::create_from(bytes, prev);
    let max_id = doc.get_prev_documents().max_id;
    doc.new_document.max_id = max_id;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testpdf;
    use crate::typst::CompileOutput;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    struct FakeTools {
        pdf: Vec<u8>,
        records: Vec<Value>,
        /// When false, an existing output file is kept as-is, simulating a
        /// rerun against an already-processed document.
        overwrite: bool,
        fail_compile: bool,
        fail_query: bool,
    }

    impl FakeTools {
        fn new(pdf: Vec<u8>, records: Vec<Value>) -> Self {
            FakeTools {
                pdf,
                records,
                overwrite: true,
                fail_compile: false,
                fail_query: false,
            }
        }
    }

    impl TypstTools for FakeTools {
        fn compile(&self, _source: &Path, output: &Path) -> Result<CompileOutput, AttachError> {
            if self.fail_compile {
                return Err(AttachError::CompileFailed("forced failure".into()));
            }
            if self.overwrite || !output.exists() {
                std::fs::write(output, &self.pdf).unwrap();
            }
            Ok(CompileOutput {
                diagnostics: vec!["warning: unused variable".into()],
            })
        }

        fn query(&self, _source: &Path, _selector: &str) -> Result<Vec<Value>, AttachError> {
            if self.fail_query {
                return Err(AttachError::QueryFailed("forced failure".into()));
            }
            Ok(self.records.clone())
        }
    }

    fn embed_record(file: &str, page: u32, x: f64, y: f64) -> Value {
        json!({
            "func": "metadata",
            "value": { "kind": "embed-file", "file": file, "page": page, "x": x, "y": y },
        })
    }

    fn setup(files: &[(&str, &[u8])]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("report.typ");
        std::fs::write(&source, "#metadata((kind: \"embed-file\"))").unwrap();
        for (name, bytes) in files {
            std::fs::write(dir.path().join(name), bytes).unwrap();
        }
        (dir, source)
    }

    #[test]
    fn test_end_to_end_three_pages() {
        let (dir, source) = setup(&[("a.txt", b"A"), ("b.txt", b"B"), ("c.txt", b"C")]);
        let records = vec![
            embed_record("a.txt", 1, 0.0, 0.0),
            embed_record("b.txt", 1, 50.0, 50.0),
            embed_record("c.txt", 2, 0.0, 0.0),
            // Unrelated metadata must be ignored, not reported.
            json!({ "func": "metadata", "value": { "kind": "figure-index", "caption": "x" } }),
        ];
        let tools = FakeTools::new(testpdf::letter_doc_bytes(3), records);

        let report = run(&tools, &RunRequest::new(&source)).unwrap();
        assert_eq!(report.markers, 3);
        assert_eq!(report.embedded, 3);
        assert_eq!(report.annotated, 3);
        assert!(report.skipped.is_empty());

        let doc = Document::load(dir.path().join("report.pdf")).unwrap();
        let store = AttachmentStore::scan(&doc);
        assert_eq!(
            store.names(),
            vec!["a.txt".to_string(), "b.txt".to_string(), "c.txt".to_string()]
        );
        assert_eq!(
            testpdf::file_annotation_rects(&doc, 1),
            vec![
                [576.0, 756.0, 596.0, 776.0],
                [576.0, 730.0, 596.0, 750.0],
            ]
        );
        assert_eq!(
            testpdf::file_annotation_rects(&doc, 2),
            vec![[576.0, 756.0, 596.0, 776.0]]
        );
        assert!(testpdf::file_annotation_rects(&doc, 3).is_empty());
    }

    #[test]
    fn test_zero_markers_short_circuits() {
        let (dir, source) = setup(&[]);
        let pdf = testpdf::letter_doc_bytes(2);
        let records = vec![json!({ "func": "metadata", "value": { "kind": "outline" } })];
        let tools = FakeTools::new(pdf.clone(), records);

        let report = run(&tools, &RunRequest::new(&source)).unwrap();
        assert_eq!(report.markers, 0);
        assert_eq!(report.summary(), "embedded=0 annotated=0 skipped=0");

        // The compiled artifact is left byte-for-byte untouched.
        let written = std::fs::read(dir.path().join("report.pdf")).unwrap();
        assert_eq!(written, pdf);
    }

    #[test]
    fn test_missing_file_is_skipped_and_run_succeeds() {
        let (dir, source) = setup(&[("a.txt", b"A")]);
        let records = vec![
            embed_record("a.txt", 1, 0.0, 0.0),
            embed_record("missing.csv", 1, 0.0, 0.0),
        ];
        let tools = FakeTools::new(testpdf::letter_doc_bytes(1), records);

        let report = run(&tools, &RunRequest::new(&source)).unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.annotated, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].file, "missing.csv");
        assert!(report.skipped[0].reason.contains("not found"));

        let doc = Document::load(dir.path().join("report.pdf")).unwrap();
        assert_eq!(AttachmentStore::scan(&doc).names(), vec!["a.txt".to_string()]);
        assert_eq!(testpdf::file_annotation_rects(&doc, 1).len(), 1);
    }

    #[test]
    fn test_duplicate_name_embeds_once_but_still_annotates() {
        let (dir, source) = setup(&[("report.csv", b"x,y\n")]);
        let records = vec![
            embed_record("report.csv", 1, 0.0, 0.0),
            embed_record("report.csv", 1, 10.0, 10.0),
        ];
        let tools = FakeTools::new(testpdf::letter_doc_bytes(1), records);

        let report = run(&tools, &RunRequest::new(&source)).unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.annotated, 2);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("already embedded"));

        let doc = Document::load(dir.path().join("report.pdf")).unwrap();
        assert_eq!(AttachmentStore::scan(&doc).len(), 1);
        assert_eq!(
            testpdf::file_annotation_rects(&doc, 1),
            vec![
                [576.0, 756.0, 596.0, 776.0],
                [576.0, 730.0, 596.0, 750.0],
            ]
        );
    }

    #[test]
    fn test_page_out_of_range_keeps_file_embedded() {
        let (dir, source) = setup(&[("a.txt", b"A")]);
        let records = vec![embed_record("a.txt", 9, 0.0, 0.0)];
        let tools = FakeTools::new(testpdf::letter_doc_bytes(3), records);

        let report = run(&tools, &RunRequest::new(&source)).unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.annotated, 0);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("out of range"));

        let doc = Document::load(dir.path().join("report.pdf")).unwrap();
        assert!(AttachmentStore::scan(&doc).contains("a.txt"));
        for page in 1..=3 {
            assert!(testpdf::file_annotation_rects(&doc, page).is_empty());
        }
    }

    #[test]
    fn test_malformed_marker_is_skipped_individually() {
        let (_dir, source) = setup(&[("a.txt", b"A")]);
        let records = vec![
            embed_record("a.txt", 1, 0.0, 0.0),
            json!({
                "func": "metadata",
                "value": { "kind": "embed-file", "file": "bad.bin", "page": 0, "x": 0, "y": 0 },
            }),
        ];
        let tools = FakeTools::new(testpdf::letter_doc_bytes(1), records);

        let report = run(&tools, &RunRequest::new(&source)).unwrap();
        assert_eq!(report.markers, 2);
        assert_eq!(report.embedded, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].file, "bad.bin");
        assert!(report.skipped[0].reason.contains("malformed"));
    }

    #[test]
    fn test_rerun_appends_and_reports_duplicates() {
        let (dir, source) = setup(&[("a.txt", b"A"), ("b.txt", b"B"), ("c.txt", b"C")]);
        let records = vec![
            embed_record("a.txt", 1, 0.0, 0.0),
            embed_record("b.txt", 1, 50.0, 50.0),
            embed_record("c.txt", 2, 0.0, 0.0),
        ];
        let mut tools = FakeTools::new(testpdf::letter_doc_bytes(3), records);
        tools.overwrite = false;

        let first = run(&tools, &RunRequest::new(&source)).unwrap();
        assert_eq!(first.summary(), "embedded=3 annotated=3 skipped=0");
        let after_first = std::fs::read(dir.path().join("report.pdf")).unwrap();

        let second = run(&tools, &RunRequest::new(&source)).unwrap();
        assert_eq!(second.embedded, 0);
        assert_eq!(second.annotated, 3);
        assert_eq!(second.skipped.len(), 3);

        // Append-only: the first run's bytes are a strict prefix.
        let after_second = std::fs::read(dir.path().join("report.pdf")).unwrap();
        assert!(after_second.starts_with(&after_first));
        assert!(after_second.len() > after_first.len());

        let doc = Document::load_mem(&after_second).unwrap();
        assert_eq!(AttachmentStore::scan(&doc).len(), 3);
        let rects = testpdf::file_annotation_rects(&doc, 1);
        assert_eq!(rects.len(), 4);
        // Second run stacked below the first run's icons.
        assert_eq!(rects[2], [576.0, 704.0, 596.0, 724.0]);
        assert_eq!(rects[3], [576.0, 678.0, 596.0, 698.0]);
    }

    #[test]
    fn test_explicit_output_and_base_dir() {
        let (dir, source) = setup(&[]);
        let assets = dir.path().join("assets");
        std::fs::create_dir(&assets).unwrap();
        std::fs::write(assets.join("raw.bin"), [7u8; 32]).unwrap();
        let output = dir.path().join("final.pdf");

        let tools = FakeTools::new(
            testpdf::letter_doc_bytes(1),
            vec![embed_record("raw.bin", 1, 0.0, 0.0)],
        );
        let request = RunRequest {
            source: source.clone(),
            output: Some(output.clone()),
            base_dir: Some(assets),
        };

        let report = run(&tools, &request).unwrap();
        assert_eq!(report.embedded, 1);
        assert!(AttachmentStore::scan(&Document::load(&output).unwrap()).contains("raw.bin"));
    }

    #[test]
    fn test_compile_failure_is_fatal() {
        let (_dir, source) = setup(&[]);
        let mut tools = FakeTools::new(testpdf::letter_doc_bytes(1), vec![]);
        tools.fail_compile = true;

        let err = run(&tools, &RunRequest::new(&source)).unwrap_err();
        assert!(matches!(err, AttachError::CompileFailed(_)));
        assert_eq!(err.stage(), Stage::Compiling);
    }

    #[test]
    fn test_query_failure_is_fatal() {
        let (_dir, source) = setup(&[]);
        let mut tools = FakeTools::new(testpdf::letter_doc_bytes(1), vec![]);
        tools.fail_query = true;

        let err = run(&tools, &RunRequest::new(&source)).unwrap_err();
        assert!(matches!(err, AttachError::QueryFailed(_)));
        assert_eq!(err.stage(), Stage::Querying);
    }

    #[test]
    fn test_missing_source_fails_before_compiling() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools::new(testpdf::letter_doc_bytes(1), vec![]);

        let err = run(&tools, &RunRequest::new(dir.path().join("absent.typ"))).unwrap_err();
        assert!(matches!(err, AttachError::SourceNotFound(_)));
    }
}
