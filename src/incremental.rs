//! Builds the incremental update that carries a document timestamp.
//!
//! The update is serialized with placeholders for `/ByteRange` and
//! `/Contents`. Once the placeholders are located in the output, the byte
//! range is patched in place, the signed ranges are hashed, and the token
//! obtained for that digest is written over the `/Contents` placeholder. None
//! of the patches change the length of the file.

use std::collections::HashSet;
use std::ops::Range;

use lopdf::{dictionary, Dictionary, Document, IncrementalDocument, Object, ObjectId, StringFormat};

use crate::{DigestAlgorithm, TimestampError};

/// Bytes reserved for the token when nothing else is configured. Tokens from
/// public TSAs carrying the TSA certificate chain are around 6 to 8 KiB.
pub const DEFAULT_TOKEN_SIZE: usize = 16 * 1024;

/// Wide enough for any offset in a file below 10 GB, so the real byte range
/// always fits in the space written for the placeholder.
const BYTE_RANGE_PLACEHOLDER: i64 = 9_999_999_999;

/// /F value of the widget: Print and Locked.
const WIDGET_FLAGS: i64 = 132;

const FIELD_NAME_PREFIX: &str = "Timestamp";

/// A serialized document with a document timestamp signature whose
/// `/Contents` is still a zero filled placeholder.
#[derive(Debug)]
pub struct PreparedUpdate {
    bytes: Vec<u8>,
    original_len: usize,
    contents: Range<usize>,
}

impl PreparedUpdate {
    /// Appends an incremental update to `pdf_bytes` holding an invisible
    /// `/DocTimeStamp` signature field, with `token_size` bytes reserved for
    /// the token.
    pub fn new(pdf_bytes: &[u8], token_size: usize) -> Result<Self, TimestampError> {
        let mut doc: IncrementalDocument = pdf_bytes.try_into()?;
        let plan = UpdatePlan::inspect(doc.get_prev_documents())?;
        plan.apply(&mut doc, token_size)?;

        let mut bytes = Vec::with_capacity(pdf_bytes.len() + 2 * token_size + 4096);
        doc.save_to(&mut bytes).map_err(lopdf::Error::from)?;
        if !bytes.starts_with(pdf_bytes) {
            return Err(TimestampError::MalformedPdf(
                "incremental update rewrote the original document",
            ));
        }

        let original_len = pdf_bytes.len();
        let contents = find_contents_placeholder(&bytes, original_len, token_size)?;
        let byte_range = find_byte_range_placeholder(&bytes, original_len)?;

        let range_text = format!(
            "[0 {} {} {}",
            contents.start,
            contents.end,
            bytes.len() - contents.end
        );
        // The closing bracket stays where it was; the gap is filled with spaces.
        let span = byte_range.start..byte_range.end - 1;
        if range_text.len() > span.len() {
            return Err(TimestampError::MalformedPdf("document too large for /ByteRange"));
        }
        bytes[span.clone()].fill(b' ');
        bytes[span.start..span.start + range_text.len()].copy_from_slice(range_text.as_bytes());

        Ok(Self {
            bytes,
            original_len,
            contents,
        })
    }

    /// The two slices covered by the signature: everything except the
    /// `/Contents` hex string, delimiters included.
    pub fn signed_ranges(&self) -> [&[u8]; 2] {
        [
            &self.bytes[..self.contents.start],
            &self.bytes[self.contents.end..],
        ]
    }

    pub fn digest(&self, algorithm: DigestAlgorithm) -> Vec<u8> {
        algorithm.digest(&self.signed_ranges())
    }

    /// Length of the document the update was appended to.
    pub fn original_len(&self) -> usize {
        self.original_len
    }

    /// Writes `token` into the `/Contents` placeholder and returns the final
    /// document.
    pub fn embed_token(mut self, token: &[u8]) -> Result<Vec<u8>, TimestampError> {
        // Placeholder without the '<' and '>' delimiters.
        let hex_span = self.contents.start + 1..self.contents.end - 1;
        let reserved = hex_span.len() / 2;
        if token.len() > reserved {
            return Err(TimestampError::TokenTooLarge {
                token: token.len(),
                reserved,
            });
        }

        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let hex = &mut self.bytes[hex_span];
        for (byte, pair) in token.iter().zip(hex.chunks_exact_mut(2)) {
            pair[0] = HEX[usize::from(byte >> 4)];
            pair[1] = HEX[usize::from(byte & 0x0f)];
        }

        Ok(self.bytes)
    }
}

/// Where the AcroForm dictionary lives in the previous revision.
enum AcroFormLocation {
    Indirect(ObjectId),
    InCatalog,
    Absent,
}

/// Everything read from the previous revision, collected before the new
/// revision is mutated.
struct UpdatePlan {
    catalog_id: ObjectId,
    page_id: ObjectId,
    page_annots: Vec<Object>,
    acro_form: AcroFormLocation,
    fields: Vec<Object>,
    field_name: String,
}

impl UpdatePlan {
    fn inspect(prev: &Document) -> Result<Self, TimestampError> {
        let catalog_id = prev.trailer.get(b"Root")?.as_reference()?;
        let catalog = prev.get_dictionary(catalog_id)?;

        let page_id = *prev
            .get_pages()
            .values()
            .next()
            .ok_or(TimestampError::MalformedPdf("document has no pages"))?;
        let page = prev.get_dictionary(page_id)?;
        let page_annots = match page.get(b"Annots") {
            Ok(annots) => deref_array(prev, annots)?,
            Err(lopdf::Error::DictKey) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (acro_form, form_dict) = match catalog.get(b"AcroForm") {
            Ok(Object::Reference(id)) => (
                AcroFormLocation::Indirect(*id),
                Some(prev.get_dictionary(*id)?),
            ),
            Ok(Object::Dictionary(dict)) => (AcroFormLocation::InCatalog, Some(dict)),
            Ok(_) => return Err(lopdf::Error::Type.into()),
            Err(lopdf::Error::DictKey) => (AcroFormLocation::Absent, None),
            Err(e) => return Err(e.into()),
        };

        let fields = match form_dict.map(|form| form.get(b"Fields")) {
            Some(Ok(fields)) => deref_array(prev, fields)?,
            Some(Err(lopdf::Error::DictKey)) | None => Vec::new(),
            Some(Err(e)) => return Err(e.into()),
        };

        let field_name = unique_field_name(prev, &fields)?;

        Ok(Self {
            catalog_id,
            page_id,
            page_annots,
            acro_form,
            fields,
            field_name,
        })
    }

    fn apply(self, doc: &mut IncrementalDocument, token_size: usize) -> Result<(), TimestampError> {
        let prev = doc.get_prev_documents();
        let prev_max_id = prev.max_id;
        let prev_trailer = prev.trailer.clone();
        let prev_xref_start = prev.xref_start;

        let new = &mut doc.new_document;
        new.max_id = new.max_id.max(prev_max_id);
        new.trailer.set("Root", self.catalog_id);
        new.trailer.set("Prev", prev_xref_start as i64);
        if !new.trailer.has(b"ID") {
            if let Ok(id) = prev_trailer.get(b"ID") {
                new.trailer.set("ID", id.clone());
            }
        }

        let signature_id = new.add_object(dictionary! {
            "Type" => "DocTimeStamp",
            "Filter" => "Adobe.PPKLite",
            "SubFilter" => "ETSI.RFC3161",
            "ByteRange" => vec![
                Object::Integer(0),
                Object::Integer(BYTE_RANGE_PLACEHOLDER),
                Object::Integer(BYTE_RANGE_PLACEHOLDER),
                Object::Integer(BYTE_RANGE_PLACEHOLDER),
            ],
            "Contents" => Object::String(vec![0; token_size], StringFormat::Hexadecimal),
        });

        let field_id = new.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Widget",
            "FT" => "Sig",
            "T" => Object::string_literal(self.field_name),
            "V" => signature_id,
            "F" => WIDGET_FLAGS,
            "Rect" => vec![Object::Real(0.0); 4],
            "P" => self.page_id,
        });

        let mut fields = self.fields;
        fields.push(field_id.into());

        match self.acro_form {
            AcroFormLocation::Indirect(form_id) => {
                doc.opt_clone_object_to_new_document(form_id)?;
                let form = doc.new_document.get_dictionary_mut(form_id)?;
                form.set("Fields", fields);
                form.set("SigFlags", 3);
            }
            AcroFormLocation::InCatalog => {
                doc.opt_clone_object_to_new_document(self.catalog_id)?;
                let catalog = doc.new_document.get_dictionary_mut(self.catalog_id)?;
                let form = catalog.get_mut(b"AcroForm")?.as_dict_mut()?;
                form.set("Fields", fields);
                form.set("SigFlags", 3);
            }
            AcroFormLocation::Absent => {
                let form_id = doc.new_document.add_object(dictionary! {
                    "Fields" => fields,
                    "SigFlags" => 3,
                });
                doc.opt_clone_object_to_new_document(self.catalog_id)?;
                doc.new_document
                    .get_dictionary_mut(self.catalog_id)?
                    .set("AcroForm", form_id);
            }
        }

        let mut annots = self.page_annots;
        annots.push(field_id.into());
        doc.opt_clone_object_to_new_document(self.page_id)?;
        doc.new_document
            .get_dictionary_mut(self.page_id)?
            .set("Annots", annots);

        Ok(())
    }
}

/// Resolves an array that may be stored directly or behind a reference.
fn deref_array(doc: &Document, obj: &Object) -> Result<Vec<Object>, TimestampError> {
    Ok(doc.dereference(obj)?.1.as_array()?.clone())
}

/// First `Timestamp<N>` not already used as a top level field name.
fn unique_field_name(doc: &Document, fields: &[Object]) -> Result<String, TimestampError> {
    let mut taken = HashSet::new();
    for field in fields {
        let field: &Dictionary = doc.dereference(field)?.1.as_dict()?;
        if let Ok(name) = field.get_deref(b"T", doc).and_then(Object::as_str) {
            taken.insert(name.to_vec());
        }
    }

    Ok((1..)
        .map(|n| format!("{FIELD_NAME_PREFIX}{n}"))
        .find(|name| !taken.contains(name.as_bytes()))
        .unwrap_or_else(|| FIELD_NAME_PREFIX.to_string()))
}

/// Finds `/Contents<000...>` written after `from`, returning the span of the
/// hex string including its delimiters.
///
/// Other dictionaries in the update (the page, notably) also have a
/// `/Contents` key, but theirs is a reference or an array.
fn find_contents_placeholder(
    bytes: &[u8],
    from: usize,
    token_size: usize,
) -> Result<Range<usize>, TimestampError> {
    for key_end in find_all(bytes, b"/Contents", from) {
        let start = skip_whitespace(bytes, key_end);
        if bytes.get(start) != Some(&b'<') || bytes.get(start + 1) == Some(&b'<') {
            continue;
        }
        let end = start + 2 * token_size + 2;
        if bytes.len() >= end
            && bytes[end - 1] == b'>'
            && bytes[start + 1..end - 1].iter().all(|&b| b == b'0')
        {
            return Ok(start..end);
        }
    }

    Err(TimestampError::MalformedPdf("signature /Contents placeholder not found"))
}

/// Finds the `/ByteRange [...]` array written after `from`, returning its
/// span including the brackets.
fn find_byte_range_placeholder(bytes: &[u8], from: usize) -> Result<Range<usize>, TimestampError> {
    let not_found = TimestampError::MalformedPdf("signature /ByteRange placeholder not found");

    let key_end = find_all(bytes, b"/ByteRange", from)
        .next()
        .ok_or(not_found)?;
    let start = skip_whitespace(bytes, key_end);
    if bytes.get(start) != Some(&b'[') {
        return Err(TimestampError::MalformedPdf(
            "signature /ByteRange is not an array",
        ));
    }
    let len = bytes[start..]
        .iter()
        .position(|&b| b == b']')
        .ok_or(TimestampError::MalformedPdf("unterminated /ByteRange array"))?;

    Ok(start..start + len + 1)
}

/// Offsets right after each occurrence of `needle` at or after `from`.
fn find_all<'a>(
    haystack: &'a [u8],
    needle: &'a [u8],
    from: usize,
) -> impl Iterator<Item = usize> + 'a {
    haystack
        .get(from..)
        .unwrap_or_default()
        .windows(needle.len())
        .enumerate()
        .filter(move |(_, window)| *window == needle)
        .map(move |(pos, _)| from + pos + needle.len())
}

fn skip_whitespace(bytes: &[u8], mut pos: usize) -> usize {
    while bytes.get(pos).is_some_and(|b| b.is_ascii_whitespace()) {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn prepared_update_extends_original() {
        let original = test_support::unsigned_pdf();
        let prepared = PreparedUpdate::new(&original, 1024).unwrap();

        let [head, tail] = prepared.signed_ranges();
        assert!(head.starts_with(&original));
        assert_eq!(prepared.original_len(), original.len());
        assert_eq!(prepared.bytes[prepared.contents.start], b'<');
        assert_eq!(prepared.bytes[prepared.contents.end - 1], b'>');

        let total = head.len() + tail.len() + 2 * 1024 + 2;
        assert_eq!(total, prepared.bytes.len());
    }

    #[test]
    fn byte_range_is_patched() {
        let original = test_support::unsigned_pdf();
        let prepared = PreparedUpdate::new(&original, 512).unwrap();

        let doc = Document::load_mem(&prepared.bytes).unwrap();
        let range = find_byte_range_placeholder(&prepared.bytes, original.len()).unwrap();
        let text = std::str::from_utf8(&prepared.bytes[range]).unwrap();
        let numbers: Vec<usize> = text
            .trim_matches(|c| c == '[' || c == ']')
            .split_whitespace()
            .map(|n| n.parse().unwrap())
            .collect();

        assert_eq!(
            numbers,
            [
                0,
                prepared.contents.start,
                prepared.contents.end,
                prepared.bytes.len() - prepared.contents.end
            ]
        );
        assert!(doc.get_pages().len() >= 1);
    }

    #[test]
    fn embeds_token_in_placeholder() {
        let original = test_support::unsigned_pdf();
        let prepared = PreparedUpdate::new(&original, 64).unwrap();
        let digest_before = prepared.digest(DigestAlgorithm::Sha256);
        let contents = prepared.contents.clone();

        let stamped = prepared.embed_token(&[0xAB, 0x01]).unwrap();
        assert_eq!(&stamped[contents.start..contents.start + 5], b"<AB01");
        assert_eq!(stamped[contents.end - 1], b'>');

        let after = DigestAlgorithm::Sha256.digest(&[
            &stamped[..contents.start],
            &stamped[contents.end..],
        ]);
        assert_eq!(after, digest_before);
    }

    #[test]
    fn refuses_oversized_token() {
        let original = test_support::unsigned_pdf();
        let prepared = PreparedUpdate::new(&original, 8).unwrap();
        let err = prepared.embed_token(&[1u8; 9]).unwrap_err();
        assert!(matches!(
            err,
            TimestampError::TokenTooLarge {
                token: 9,
                reserved: 8
            }
        ));
    }

    #[test]
    fn extends_existing_form_and_annotations() {
        let original = test_support::pdf_with_form();
        let prepared = PreparedUpdate::new(&original, 64).unwrap();
        let doc = Document::load_mem(&prepared.bytes).unwrap();

        let form = doc
            .get_dict_in_dict(doc.catalog().unwrap(), b"AcroForm")
            .unwrap();
        assert_eq!(form.get(b"SigFlags").unwrap().as_i64().unwrap(), 3);
        let fields = form.get_deref(b"Fields", &doc).unwrap().as_array().unwrap();
        assert_eq!(fields.len(), 2);

        let names: Vec<Vec<u8>> = fields
            .iter()
            .map(|f| {
                let field = doc.dereference(f).unwrap().1.as_dict().unwrap();
                field.get(b"T").unwrap().as_str().unwrap().to_vec()
            })
            .collect();
        assert!(names.contains(&b"Timestamp1".to_vec()));
        assert!(names.contains(&b"Timestamp2".to_vec()));

        let page_id = *doc.get_pages().values().next().unwrap();
        let annots = doc
            .get_dictionary(page_id)
            .unwrap()
            .get_deref(b"Annots", &doc)
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(annots.len(), 2);
    }

    #[test]
    fn rejects_document_without_pages() {
        let original = test_support::pdf_without_pages();
        let err = PreparedUpdate::new(&original, 64).unwrap_err();
        assert!(matches!(err, TimestampError::MalformedPdf(_)));
    }
}
