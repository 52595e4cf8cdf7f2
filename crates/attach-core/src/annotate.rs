//! Page-level file-attachment annotations.
//!
//! Placement ignores the marker's declared `x`/`y` and anchors every icon
//! in the page's top-right region, stacking downward in processing order.
//! Stacking position is the count of `/FileAttachment` annotations already
//! on the page at placement time, so a rerun continues below the previous
//! run's icons and two markers never share an anchor. The declared
//! coordinates are a reconciliation point with the marker-declaration
//! contract, not something to silently honor here.

use std::collections::BTreeMap;

use lopdf::{dictionary, Document, IncrementalDocument, Object, ObjectId};
use thiserror::Error;

use crate::error::SkipReason;
use crate::marker::EmbedMarker;

pub const MARGIN: f64 = 16.0;
pub const ICON_SIZE: f64 = 20.0;
pub const SPACING: f64 = ICON_SIZE + 6.0;

/// Dark blue stroke, visibly distinct from default-rendered annotations.
pub const STROKE_COLOR: [f64; 3] = [0.1, 0.2, 0.5];

/// US Letter fallback for pages with no resolvable `/MediaBox`.
const LETTER: [f64; 4] = [0.0, 0.0, 612.0, 792.0];

#[derive(Error, Debug)]
pub enum AnnotateError {
    /// Recoverable: the marker is skipped, the run continues.
    #[error(transparent)]
    Skip(#[from] SkipReason),

    /// The page objects did not have the expected shape.
    #[error("document structure: {0}")]
    Structure(#[from] lopdf::Error),
}

/// Anchor point, in top-left page space, for the Nth icon on a page.
pub fn anchor_for_slot(page_width: f64, slot: usize) -> (f64, f64) {
    (
        page_width - MARGIN - ICON_SIZE,
        MARGIN + slot as f64 * SPACING,
    )
}

/// Page box used to translate top-left anchors into PDF user space.
#[derive(Debug, Clone, Copy)]
pub struct PageGeometry {
    /// `[llx, lly, urx, ury]`.
    pub media_box: [f64; 4],
}

impl PageGeometry {
    pub fn width(&self) -> f64 {
        self.media_box[2] - self.media_box[0]
    }

    pub fn height(&self) -> f64 {
        self.media_box[3] - self.media_box[1]
    }

    /// Icon `/Rect` in PDF space (origin bottom-left, y up) for an anchor
    /// given in top-left page space (y down).
    pub fn icon_rect(&self, anchor: (f64, f64)) -> [f64; 4] {
        let [llx, _, _, ury] = self.media_box;
        let (ax, ay) = anchor;
        [
            llx + ax,
            ury - ay - ICON_SIZE,
            llx + ax + ICON_SIZE,
            ury - ay,
        ]
    }
}

/// Places annotations, one page-local slot counter at a time.
///
/// Counters are explicit per-page state seeded from the document when a
/// page is first touched; placement order is input order, which keeps the
/// stacking deterministic across replays.
#[derive(Debug)]
pub struct AnnotationPlacer {
    pages: BTreeMap<u32, ObjectId>,
    slots: BTreeMap<u32, usize>,
    placed: usize,
}

impl AnnotationPlacer {
    pub fn new(doc: &Document) -> Self {
        AnnotationPlacer {
            pages: doc.get_pages(),
            slots: BTreeMap::new(),
            placed: 0,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Annotations placed by this run.
    pub fn placed(&self) -> usize {
        self.placed
    }

    /// Add a clickable paperclip for `marker` referencing `filespec_id`.
    ///
    /// Returns the anchor point in top-left page space. A page outside the
    /// document is a recoverable skip; the file stays embedded globally.
    pub fn place(
        &mut self,
        doc: &mut IncrementalDocument,
        marker: &EmbedMarker,
        filespec_id: ObjectId,
    ) -> Result<(f64, f64), AnnotateError> {
        let Some(&page_id) = self.pages.get(&marker.page) else {
            return Err(SkipReason::PageOutOfRange {
                page: marker.page,
                page_count: self.page_count(),
            }
            .into());
        };

        let (geometry, existing) = {
            let prev = doc.get_prev_documents();
            (
                PageGeometry {
                    media_box: media_box(prev, page_id).unwrap_or(LETTER),
                },
                count_file_annotations(prev, page_id),
            )
        };

        let slot = self.slots.entry(marker.page).or_insert(existing);
        let anchor = anchor_for_slot(geometry.width(), *slot);
        *slot += 1;

        let rect = geometry.icon_rect(anchor);
        let annot_id = doc.new_document.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "FileAttachment",
            "Rect" => Object::Array(rect.iter().map(|&v| v.into()).collect()),
            "Contents" => Object::string_literal(marker.desc.as_str()),
            "Name" => "Paperclip",
            "C" => Object::Array(STROKE_COLOR.iter().map(|&v| v.into()).collect()),
            "F" => Object::Integer(4),
            "FS" => filespec_id,
        });

        attach_to_page(doc, page_id, annot_id)?;
        self.placed += 1;
        Ok(anchor)
    }
}

/// Append an annotation reference to the page's `/Annots`, which may be a
/// direct array, a reference to an array, or absent.
fn attach_to_page(
    doc: &mut IncrementalDocument,
    page_id: ObjectId,
    annot_id: ObjectId,
) -> Result<(), lopdf::Error> {
    doc.opt_clone_object_to_new_document(page_id)?;

    let indirect = {
        let page = doc.new_document.get_object(page_id)?.as_dict()?;
        match page.get(b"Annots") {
            Ok(Object::Reference(id)) => Some(*id),
            _ => None,
        }
    };

    match indirect {
        Some(array_id) => {
            doc.opt_clone_object_to_new_document(array_id)?;
            let annots = doc.new_document.get_object_mut(array_id)?.as_array_mut()?;
            annots.push(Object::Reference(annot_id));
        }
        None => {
            let page = doc.new_document.get_object_mut(page_id)?.as_dict_mut()?;
            match page.get_mut(b"Annots") {
                Ok(Object::Array(annots)) => annots.push(Object::Reference(annot_id)),
                _ => page.set("Annots", vec![Object::Reference(annot_id)]),
            }
        }
    }
    Ok(())
}

/// `/MediaBox` of a page, walking `/Parent` for inherited boxes.
fn media_box(doc: &Document, page_id: ObjectId) -> Option<[f64; 4]> {
    let mut id = page_id;
    loop {
        let dict = doc.get_object(id).ok()?.as_dict().ok()?;
        if let Ok(raw) = dict.get(b"MediaBox") {
            return parse_rect(crate::store::resolve(doc, raw));
        }
        id = dict.get(b"Parent").ok()?.as_reference().ok()?;
    }
}

pub(crate) fn parse_rect(obj: &Object) -> Option<[f64; 4]> {
    let arr = obj.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let mut rect = [0.0; 4];
    for (slot, value) in rect.iter_mut().zip(arr.iter()) {
        *slot = number(value)?;
    }
    Some(rect)
}

pub(crate) fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// FileAttachment annotations already present on a page.
fn count_file_annotations(doc: &Document, page_id: ObjectId) -> usize {
    let Ok(Ok(page)) = doc.get_object(page_id).map(Object::as_dict) else {
        return 0;
    };
    let Ok(annots) = page.get(b"Annots") else {
        return 0;
    };
    let Ok(annots) = crate::store::resolve(doc, annots).as_array() else {
        return 0;
    };
    annots
        .iter()
        .filter_map(|a| crate::store::resolve(doc, a).as_dict().ok())
        .filter(|d| {
            matches!(d.get(b"Subtype"), Ok(Object::Name(name)) if name.as_slice() == b"FileAttachment")
        })
        .count()
}
