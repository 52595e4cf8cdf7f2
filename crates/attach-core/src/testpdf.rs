//! Fixture builders shared by the unit tests.

use lopdf::{dictionary, Dictionary, Document, Object, Stream};

/// Build a letter-size (612x792) PDF with `num_pages` pages of
/// identifiable text, returned as serialized bytes.
pub(crate) fn letter_doc_bytes(num_pages: u32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let catalog_id = doc.new_object_id();

    let mut kids = Vec::new();
    for page_num in 0..num_pages {
        let content_id = doc.new_object_id();
        let page_id = doc.new_object_id();

        let content = format!("BT /F1 12 Tf 50 700 Td (Page-{}) Tj ET", page_num + 1);
        doc.objects.insert(
            content_id,
            Object::Stream(Stream::new(Dictionary::new(), content.into_bytes())),
        );

        let page_dict = dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => Object::Array(vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(612),
                Object::Integer(792),
            ]),
        };
        doc.objects.insert(page_id, Object::Dictionary(page_dict));
        kids.push(Object::Reference(page_id));
    }

    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Count" => Object::Integer(num_pages as i64),
        "Kids" => Object::Array(kids),
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));

    let catalog_dict = dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    };
    doc.objects.insert(catalog_id, Object::Dictionary(catalog_dict));
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}

/// `/Rect` values of the FileAttachment annotations on a page, in
/// `/Annots` array order.
pub(crate) fn file_annotation_rects(doc: &Document, page_no: u32) -> Vec<[f64; 4]> {
    let pages = doc.get_pages();
    let Some(&page_id) = pages.get(&page_no) else {
        return Vec::new();
    };
    let Ok(page) = doc.get_object(page_id).and_then(|obj| obj.as_dict()) else {
        return Vec::new();
    };
    let Ok(annots) = page.get(b"Annots") else {
        return Vec::new();
    };
    let Ok(annots) = crate::store::resolve(doc, annots).as_array() else {
        return Vec::new();
    };

    annots
        .iter()
        .filter_map(|a| crate::store::resolve(doc, a).as_dict().ok())
        .filter(|d| {
            matches!(d.get(b"Subtype"), Ok(Object::Name(n)) if n.as_slice() == b"FileAttachment")
        })
        .filter_map(|d| d.get(b"Rect").ok())
        .filter_map(|r| crate::annotate::parse_rect(crate::store::resolve(doc, r)))
        .collect()
}
