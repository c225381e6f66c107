//! Checks that an incremental update did nothing but add one signature.
//!
//! A signature or timestamp only vouches for the bytes it covers. If an
//! increment between the reference document and a signature also changed a
//! page, the signature would appear to cover the reference document while the
//! rendered document differs. So every object the increment touched must be
//! reachable through the handful of keys a signature needs: the catalog's
//! `/AcroForm`, the form's `/Fields` and `/SigFlags`, and one page's `/Annots`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use anyhow::Result;
use lopdf::{xref::XrefEntry, Dictionary, Document, Object, ObjectId};
use thiserror::Error;

use crate::verify::{ExactArrayOrNone, Signature};

#[derive(Error, Debug)]
pub enum IncrementError {
    #[error("mismatch between /Catalog dictionaries")]
    CatalogMismatch,
    #[error("mismatch between /AcroForm dictionaries")]
    AcroFormMismatch,
    #[error("array does not differ by exactly one added reference")]
    NotSingleArrayIncrement,
    #[error("multiple pages changed in the increment")]
    MultiplePagesChanged,
    #[error("intermediate /Pages node changed in the increment")]
    PageTreeModified,
    #[error("mismatch between /Page dictionaries")]
    PageMismatch,
    #[error("invalid annotation")]
    InvalidAnnotation,
    #[error("invalid signature field")]
    InvalidForm,
    #[error("signature dictionary was modified")]
    SignatureModified,
    #[error("wrong SigFlags value")]
    WrongSigFlags,
    #[error("mismatch between xref tables")]
    XrefMismatch,
}

/// Value of /SigFlags once a signature is present: SignaturesExist and
/// AppendOnly.
const SIG_FLAGS: i64 = 3;

/// Nesting limit of the page tree.
const MAX_PAGE_TREE_DEPTH: usize = 64;

/// The widget annotation that came with a signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Index of the page in document order.
    pub page_idx: usize,
    pub rect: [f32; 4],
}

impl Annotation {
    /// Whether the rectangle covers any area on the page.
    pub fn is_visible(&self) -> bool {
        let [x0, y0, x1, y1] = self.rect;
        x0 != x1 && y0 != y1
    }
}

/// Records which objects of the previous revision were looked at. Those are
/// the only ones the increment may replace.
struct DocTracker<'a> {
    visited: RefCell<HashMap<u32, u16>>,
    doc: &'a Document,
}

impl<'a> DocTracker<'a> {
    fn new(doc: &'a Document) -> Self {
        DocTracker {
            visited: RefCell::new(HashMap::new()),
            doc,
        }
    }

    fn catalog(&self) -> Result<DictTracker> {
        let root = self.doc.trailer.get(b"Root")?;
        self.deref_dict(root)
    }

    fn get(&self, id: ObjectId) -> Result<&Object> {
        if let Some(generation) = self.visited.borrow_mut().insert(id.0, id.1) {
            if generation != id.1 {
                return Err(lopdf::Error::ObjectIdMismatch.into());
            }
        }
        Ok(self.doc.get_object(id)?)
    }

    /// Only the first reference of a chain is recorded; an increment has no
    /// business adding indirections.
    fn deref<'b>(&'b self, obj: &'b Object) -> Result<&'b Object> {
        match obj {
            Object::Reference(id) => self.get(*id),
            _ => Ok(obj),
        }
    }

    fn deref_dict<'b>(&'b self, obj: &'b Object) -> Result<DictTracker<'b>> {
        Ok(DictTracker {
            tracker: self,
            dict: self.deref(obj)?.as_dict()?,
        })
    }

    /// Every xref entry not visited must be identical in `other`.
    fn verify_unvisited_unchanged(self, other: &Document) -> Result<()> {
        let visited = self.visited.into_inner();

        for (id, entry) in self.doc.reference_table.entries.iter() {
            if visited.contains_key(id) {
                continue;
            }

            let Some(other_entry) = other.reference_table.entries.get(id) else {
                return Err(IncrementError::XrefMismatch.into());
            };
            if !same_entry(entry, other_entry) {
                return Err(IncrementError::XrefMismatch.into());
            }
        }

        Ok(())
    }
}

struct DictTracker<'a> {
    tracker: &'a DocTracker<'a>,
    dict: &'a Dictionary,
}

/// `XrefEntry` has no `PartialEq`.
fn same_entry(a: &XrefEntry, b: &XrefEntry) -> bool {
    match (a, b) {
        (
            XrefEntry::Normal { offset, generation },
            XrefEntry::Normal {
                offset: b_offset,
                generation: b_generation,
            },
        ) => offset == b_offset && generation == b_generation,
        (
            XrefEntry::Compressed { container, index },
            XrefEntry::Compressed {
                container: b_container,
                index: b_index,
            },
        ) => container == b_container && index == b_index,
        (XrefEntry::Free, XrefEntry::Free) | (XrefEntry::UnusableFree, XrefEntry::UnusableFree) => {
            true
        }
        _ => false,
    }
}

/// Checks the increment between `previous_doc` and `curr_doc`, which must
/// consist of `curr_sig` and its field, and nothing else.
///
/// Returns the widget annotation of the field, if it was placed on a page.
pub(crate) fn verify_increment(
    curr_sig: &Signature,
    curr_doc: &Document,
    previous_doc: &Document,
) -> Result<Option<Annotation>> {
    // The signature object must sit where the byte range says it does.
    let xref_entry = curr_doc
        .reference_table
        .entries
        .get(&curr_sig.obj_id.0)
        .ok_or(IncrementError::SignatureModified)?;
    let expected = XrefEntry::Normal {
        offset: curr_sig.offset,
        generation: curr_sig.obj_id.1,
    };
    if !same_entry(xref_entry, &expected) {
        return Err(IncrementError::SignatureModified.into());
    }

    let prev_tracker = DocTracker::new(previous_doc);
    let annotation = verify_catalogs(curr_sig.obj_id, curr_doc, &prev_tracker)?;
    prev_tracker.verify_unvisited_unchanged(curr_doc)?;

    Ok(annotation)
}

fn verify_catalogs(
    curr_sig_id: ObjectId,
    curr_doc: &Document,
    previous_doc: &DocTracker,
) -> Result<Option<Annotation>> {
    let curr_catalog = curr_doc.catalog()?;
    let prev_catalog = previous_doc.catalog()?;

    let mut prev_acro_form = None;
    let mut pages = None;

    for (key, obj) in prev_catalog.dict.iter() {
        match key.as_slice() {
            b"AcroForm" => {
                prev_acro_form = Some(previous_doc.deref_dict(obj)?);
                continue;
            }
            // The page tree root must stay the same object; its leaves are
            // checked one by one.
            b"Pages" => pages = Some(curr_doc.get_dictionary(obj.as_reference()?)?),
            _ => (),
        }

        if curr_catalog.get(key)? != obj {
            return Err(IncrementError::CatalogMismatch.into());
        }
    }

    let expected_len = prev_catalog.dict.len() + usize::from(prev_acro_form.is_none());
    if curr_catalog.len() != expected_len {
        return Err(IncrementError::CatalogMismatch.into());
    }

    verify_acro_forms(
        curr_doc,
        curr_doc.get_dict_in_dict(curr_catalog, b"AcroForm")?,
        prev_acro_form,
        curr_sig_id,
    )?;

    verify_pages(curr_doc, previous_doc, pages.ok_or(lopdf::Error::DictKey)?)
}

fn verify_acro_forms(
    curr_doc: &Document,
    curr_acro_form: &Dictionary,
    prev_acro_form: Option<DictTracker>,
    signature: ObjectId,
) -> Result<()> {
    let mut prev_fields = None;
    let mut unmatched: HashSet<&[u8]> = curr_acro_form.iter().map(|(k, _)| k.as_slice()).collect();

    if let Some(prev_acro_form) = prev_acro_form {
        for (key, obj) in prev_acro_form.dict.iter() {
            unmatched.remove(key.as_slice());
            match key.as_slice() {
                b"Fields" => prev_fields = Some(prev_acro_form.tracker.deref(obj)?.as_array()?),
                // Checked below; adding a signature may raise it.
                b"SigFlags" => (),
                _ => {
                    if curr_acro_form.get(key)? != obj {
                        return Err(IncrementError::AcroFormMismatch.into());
                    }
                }
            }
        }
    }

    // Keys a signing increment may introduce.
    for key in [b"Fields".as_slice(), b"SigFlags", b"DA", b"DR"] {
        unmatched.remove(key);
    }
    if !unmatched.is_empty() {
        return Err(IncrementError::AcroFormMismatch.into());
    }

    if curr_acro_form.get(b"SigFlags")?.as_i64()? != SIG_FLAGS {
        return Err(IncrementError::WrongSigFlags.into());
    }

    let curr_fields = curr_acro_form.get_deref(b"Fields", curr_doc)?.as_array()?;
    let new_field = single_extra_ref(curr_fields, prev_fields)?;

    verify_field(curr_doc, new_field, signature)
}

/// The added field must be a signature field whose value is `signature`.
fn verify_field(doc: &Document, field_id: ObjectId, signature: ObjectId) -> Result<()> {
    let field = doc.get_dictionary(field_id)?;

    if field.get_deref(b"FT", doc)?.as_name()? != b"Sig" {
        return Err(IncrementError::InvalidForm.into());
    }
    if field.get(b"V")?.as_reference()? != signature {
        return Err(IncrementError::InvalidForm.into());
    }

    Ok(())
}

/// Returns the one reference found in `curr_refs` but not in `prev_refs`.
///
/// Both arrays must hold only references, and `curr_refs` must be
/// `prev_refs` plus that reference, in any order.
fn single_extra_ref(curr_refs: &[Object], prev_refs: Option<&Vec<Object>>) -> Result<ObjectId> {
    fn sorted(array: &[Object]) -> lopdf::Result<Vec<ObjectId>> {
        let mut ids = array
            .iter()
            .map(Object::as_reference)
            .collect::<lopdf::Result<Vec<_>>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    let prev = sorted(prev_refs.map_or(&[][..], Vec::as_slice))?;
    let mut curr = sorted(curr_refs)?;
    if curr.len() != prev.len() + 1 {
        return Err(IncrementError::NotSingleArrayIncrement.into());
    }

    let split = curr
        .iter()
        .zip(&prev)
        .position(|(c, p)| c != p)
        .unwrap_or(prev.len());
    let extra = curr.remove(split);
    if curr != prev {
        return Err(IncrementError::NotSingleArrayIncrement.into());
    }

    Ok(extra)
}

fn verify_pages(
    curr_doc: &Document,
    prev_doc: &DocTracker,
    pages: &Dictionary,
) -> Result<Option<Annotation>> {
    let mut walker = PageTreeWalker {
        curr_doc,
        prev_doc,
        page_idx: 0,
        annotation: None,
    };
    walker.visit(pages, 0)?;

    // None if no page was changed.
    Ok(walker.annotation)
}

/// Walks the page tree of the current document in page order. Intermediate
/// /Pages nodes must be untouched, and at most one leaf page may differ.
struct PageTreeWalker<'a> {
    curr_doc: &'a Document,
    prev_doc: &'a DocTracker<'a>,
    page_idx: usize,
    annotation: Option<Annotation>,
}

impl PageTreeWalker<'_> {
    fn visit(&mut self, node: &Dictionary, depth: usize) -> Result<()> {
        if depth > MAX_PAGE_TREE_DEPTH {
            return Err(lopdf::Error::ReferenceLimit.into());
        }

        let kids = node.get_deref(b"Kids", self.curr_doc)?.as_array()?;
        for kid in kids {
            let kid_id = kid.as_reference()?;
            let changed = object_has_changed(self.curr_doc, self.prev_doc.doc, kid_id)?;
            let kid_dict = self.curr_doc.get_dictionary(kid_id)?;

            if is_pages_node(kid_dict) {
                if changed.is_some() {
                    return Err(IncrementError::PageTreeModified.into());
                }
                self.visit(kid_dict, depth + 1)?;
                continue;
            }

            if let Some(page_id) = changed {
                if self.annotation.is_some() {
                    return Err(IncrementError::MultiplePagesChanged.into());
                }

                let curr_page = self.curr_doc.get_dictionary(page_id)?;
                let prev_page = self.prev_doc.deref_dict(kid)?;
                self.annotation = Some(Annotation {
                    page_idx: self.page_idx,
                    rect: verify_page(self.curr_doc, page_id, curr_page, prev_page)?,
                });
            }
            self.page_idx += 1;
        }

        Ok(())
    }
}

fn is_pages_node(dict: &Dictionary) -> bool {
    matches!(dict.get(b"Type"), Ok(Object::Name(name)) if name == b"Pages")
}

/// Follows the reference chain starting at `id` and returns the first object
/// whose xref entry differs between the two revisions, if any.
fn object_has_changed(
    curr_doc: &Document,
    prev_doc: &Document,
    mut id: ObjectId,
) -> Result<Option<ObjectId>> {
    let mut seen = HashSet::from([id.0]);

    while let (Some(curr_entry), Some(prev_entry)) = (
        curr_doc.reference_table.entries.get(&id.0),
        prev_doc.reference_table.entries.get(&id.0),
    ) {
        if !same_entry(curr_entry, prev_entry) {
            return Ok(Some(id));
        }

        match curr_doc.get_object(id)? {
            Object::Reference(next_id) if seen.insert(next_id.0) => id = *next_id,
            Object::Reference(_) => return Err(lopdf::Error::ReferenceLimit.into()),
            _ => return Ok(None),
        }
    }

    Err(lopdf::Error::ObjectNotFound.into())
}

/// The page may only differ by one more entry in /Annots.
fn verify_page(
    curr_doc: &Document,
    curr_page_id: ObjectId,
    curr_page: &Dictionary,
    prev_page: DictTracker,
) -> Result<[f32; 4]> {
    let mut prev_annots = None;

    for (key, obj) in prev_page.dict.iter() {
        if key == b"Annots" {
            prev_annots = Some(prev_page.tracker.deref(obj)?.as_array()?);
            continue;
        }

        if curr_page.get(key)? != obj {
            return Err(IncrementError::PageMismatch.into());
        }
    }

    let expected_len = prev_page.dict.len() + usize::from(prev_annots.is_none());
    if curr_page.len() != expected_len {
        return Err(IncrementError::PageMismatch.into());
    }

    let curr_annots = curr_page.get_deref(b"Annots", curr_doc)?.as_array()?;
    let new_annot = single_extra_ref(curr_annots, prev_annots)?;

    verify_annotation(curr_doc, curr_page_id, new_annot)
}

/// The added annotation must be a widget on this page. Its rectangle is
/// returned; nothing stops a widget from drawing over the page, but callers
/// can at least see where it is.
fn verify_annotation(doc: &Document, page_id: ObjectId, annot_id: ObjectId) -> Result<[f32; 4]> {
    let dict = doc.get_dictionary(annot_id)?;

    match dict.get_deref(b"Type", doc) {
        Ok(obj) => {
            if obj.as_name()? != b"Annot" {
                return Err(IncrementError::InvalidAnnotation.into());
            }
        }
        Err(lopdf::Error::DictKey) => (),
        Err(e) => return Err(e.into()),
    };

    if let Ok(p) = dict.get(b"P") {
        if p.as_reference()? != page_id {
            return Err(IncrementError::InvalidAnnotation.into());
        }
    }

    if dict.get_deref(b"Subtype", doc)?.as_name()? != b"Widget" {
        return Err(IncrementError::InvalidAnnotation.into());
    }

    Ok(dict
        .get_deref(b"Rect", doc)?
        .as_array()?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_float()))
        .collect::<lopdf::Result<ExactArrayOrNone<f32, 4>>>()?
        .0
        .ok_or(lopdf::Error::Type)?)
}
