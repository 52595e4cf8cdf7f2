//! Document-global embedded-file collection.
//!
//! Attachments live in the catalog's `/Names /EmbeddedFiles` name tree,
//! independent of any visual placement. The store scans the tree that is
//! already in the document (so reruns see prior embeds), inserts an
//! `/EmbeddedFile` stream plus `/Filespec` per new name, and rewrites the
//! tree root on finalize. Duplicate names are a no-op reported to the
//! caller; the existing filespec is returned so an annotation can still
//! reference the already-embedded bytes.

use std::collections::BTreeMap;

use lopdf::{dictionary, Dictionary, Document, IncrementalDocument, Object, ObjectId, Stream};

/// Result of one insertion attempt. Both variants carry the filespec
/// object the annotation placer should reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted(ObjectId),
    Duplicate(ObjectId),
}

/// Name-keyed view of the document's embedded-file collection.
#[derive(Debug)]
pub struct AttachmentStore {
    /// Name to filespec object, existing entries and this run's inserts.
    entries: BTreeMap<String, ObjectId>,
    added: usize,
}

impl AttachmentStore {
    /// Read the existing embedded-file entries out of `doc`.
    ///
    /// Structural oddities (no catalog, no name tree) simply yield an
    /// empty store; a freshly compiled PDF has no tree at all.
    pub fn scan(doc: &Document) -> Self {
        let mut entries = BTreeMap::new();
        if let Some(root) = embedded_files_root(doc) {
            collect_tree(doc, root, &mut entries);
        }
        AttachmentStore { entries, added: 0 }
    }

    /// Embed `bytes` under `name`, or report a duplicate without touching
    /// the document.
    pub fn insert(
        &mut self,
        doc: &mut IncrementalDocument,
        name: &str,
        desc: &str,
        bytes: Vec<u8>,
    ) -> StoreOutcome {
        if let Some(&existing) = self.entries.get(name) {
            return StoreOutcome::Duplicate(existing);
        }

        let size = bytes.len() as i64;
        let stream = Stream::new(
            dictionary! {
                "Type" => "EmbeddedFile",
                "Params" => dictionary! { "Size" => size },
            },
            bytes,
        );
        let stream_id = doc.new_document.add_object(Object::Stream(stream));

        let filespec_id = doc.new_document.add_object(dictionary! {
            "Type" => "Filespec",
            "F" => Object::string_literal(name),
            "UF" => Object::string_literal(name),
            "Desc" => Object::string_literal(desc),
            "EF" => dictionary! { "F" => stream_id, "UF" => stream_id },
        });

        self.entries.insert(name.to_string(), filespec_id);
        self.added += 1;
        StoreOutcome::Inserted(filespec_id)
    }

    /// Write the merged name tree back through the catalog.
    ///
    /// The entry map carries every previously scanned name, so replacing
    /// the tree root with a flat sorted `/Names` array loses nothing.
    pub fn finalize(&self, doc: &mut IncrementalDocument) -> Result<(), lopdf::Error> {
        if self.added == 0 {
            return Ok(());
        }

        let mut names = Vec::with_capacity(self.entries.len() * 2);
        for (name, id) in &self.entries {
            names.push(Object::string_literal(name.as_str()));
            names.push(Object::Reference(*id));
        }
        let tree_id = doc.new_document.add_object(dictionary! { "Names" => names });

        let catalog_id = doc
            .get_prev_documents()
            .trailer
            .get(b"Root")?
            .as_reference()?;
        doc.opt_clone_object_to_new_document(catalog_id)?;

        // /Names may be an indirect dictionary, an inline one, or absent.
        let names_dict_id = {
            let catalog = doc.new_document.get_object(catalog_id)?.as_dict()?;
            match catalog.get(b"Names") {
                Ok(Object::Reference(id)) => Some(*id),
                _ => None,
            }
        };
        match names_dict_id {
            Some(id) => {
                doc.opt_clone_object_to_new_document(id)?;
                let names_dict = doc.new_document.get_object_mut(id)?.as_dict_mut()?;
                names_dict.set("EmbeddedFiles", tree_id);
            }
            None => {
                let catalog = doc.new_document.get_object_mut(catalog_id)?.as_dict_mut()?;
                let mut names_dict = match catalog.get(b"Names") {
                    Ok(Object::Dictionary(existing)) => existing.clone(),
                    _ => Dictionary::new(),
                };
                names_dict.set("EmbeddedFiles", tree_id);
                catalog.set("Names", names_dict);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entries inserted by this run.
    pub fn added(&self) -> usize {
        self.added
    }

    /// Sorted attachment names currently in the store.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Follow a reference one hop; direct objects pass through.
pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        other => other,
    }
}

fn embedded_files_root(doc: &Document) -> Option<&Dictionary> {
    let catalog = doc.catalog().ok()?;
    let names = resolve(doc, catalog.get(b"Names").ok()?).as_dict().ok()?;
    resolve(doc, names.get(b"EmbeddedFiles").ok()?).as_dict().ok()
}

fn collect_tree(doc: &Document, node: &Dictionary, entries: &mut BTreeMap<String, ObjectId>) {
    if let Ok(kids) = node.get(b"Kids") {
        if let Ok(kids) = resolve(doc, kids).as_array() {
            for kid in kids {
                if let Ok(kid) = resolve(doc, kid).as_dict() {
                    collect_tree(doc, kid, entries);
                }
            }
        }
    }
    if let Ok(pairs) = node.get(b"Names") {
        if let Ok(pairs) = resolve(doc, pairs).as_array() {
            for pair in pairs.chunks(2) {
                if let [key, value] = pair {
                    if let (Object::String(name, _), Ok(id)) =
                        (resolve(doc, key), value.as_reference())
                    {
                        entries.insert(String::from_utf8_lossy(name).into_owned(), id);
                    }
                }
            }
        }
    }
}
