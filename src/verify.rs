//! Reading signatures and document timestamps back from a PDF.
//!
//! Verification answers two questions about a stamped document: does it still
//! contain the reference document unchanged, and does every timestamp token
//! cover the bytes it claims to cover. Checking who signed a token is
//! delegated to a [`Pkcs7Verifier`], see the optional [`crate::openssl`]
//! module.

use std::ops::Range;

use anyhow::Result;
use lopdf::{xref::XrefEntry, Dictionary, Document, Object, ObjectId};
use regex::bytes::Regex;
use thiserror::Error;

use crate::increment_validation::{self, Annotation};
use crate::rfc3161::{TimestampInfo, TimestampToken};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("reference document does not end like a PDF file")]
    InvalidReferenceDocument,
    #[error("end of the reference increment is bigger than the signed document")]
    ReferenceIncrementOutOfBounds,
    #[error("can not guarantee the contents of the signed document match the original")]
    PossibleContentChange,
    #[error("invalid signature object")]
    InvalidSignatureObject,
    #[error("file is not signed from the beginning")]
    WrongRangeStart,
    #[error("signature range does not end at the end of a PDF file")]
    WrongRangeEnd,
    #[error("invalid signature range")]
    InvalidRange,
    #[error("signature coverage skips over wrong sections of the document")]
    InvalidCoverage,
    #[error("last signature does not cover the whole document")]
    IncompleteCoverage,
    #[error("can not ensure that the incremental update didn't change the document")]
    InternalConsistency,
    #[error("timestamp token uses an unsupported digest algorithm")]
    UnsupportedImprintAlgorithm,
    #[error("timestamp token does not match the digest of the signed byte ranges")]
    ImprintMismatch,
}

/// How a signature dictionary relates to the bytes it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// `/Type /DocTimeStamp`: the contents are an RFC 3161 token whose
    /// message imprint is the digest of the signed ranges.
    DocTimeStamp,
    /// A regular signature: the contents are a CMS signature detached over
    /// the signed ranges.
    Signature,
}

/// Checks the CMS structure found in a signature's `/Contents`.
pub trait Pkcs7Verifier {
    /// Whatever the verifier wants to report about a successful verification.
    type Return;

    /// `pkcs7_der` is the signature contents, `signed_data` the two byte
    /// ranges it covers. For [`SignatureKind::DocTimeStamp`] the covered
    /// bytes are already known to match the token's message imprint.
    fn verify(
        &self,
        kind: SignatureKind,
        pkcs7_der: &[u8],
        signed_data: [&[u8]; 2],
    ) -> Result<Self::Return>;
}

/// Accepts every signature. Only the structural checks are performed.
pub struct NoVerifier;

impl Pkcs7Verifier for NoVerifier {
    type Return = ();

    fn verify(&self, _: SignatureKind, _: &[u8], _: [&[u8]; 2]) -> Result<()> {
        Ok(())
    }
}

/// Information about a signature found in the PDF document.
#[derive(Debug)]
pub struct SignatureInfo<T> {
    pub kind: SignatureKind,

    /// If the signature was added after the reference document and
    /// corresponds to an annotation, this field holds the details about it.
    /// Document timestamps written by this crate have an empty rectangle.
    pub annotation: Option<Annotation>,

    /// The byte ranges of the document that were signed. The skipped range
    /// contains the signature itself, as an hexadecimal encoded PDF string.
    pub signed_byte_ranges: [Range<usize>; 2],

    /// The signature itself, as decoded from the PDF string. Document
    /// timestamps are trimmed to their exact DER encoding; other signatures
    /// keep the padding.
    pub pkcs7_der: Vec<u8>,

    /// Contents of the token, for document timestamps.
    pub timestamp: Option<TimestampInfo>,

    /// What the [`Pkcs7Verifier`] returned.
    pub verification: T,
}

/// Verifies if the contents of a signed PDF matches a reference document.
///
/// The `reference_pdf_bytes` parameter is the reference document, and the
/// `signed_pdf_bytes` parameter is the signed document.
pub fn verify_from_reference<V: Pkcs7Verifier>(
    reference_pdf_bytes: impl AsRef<[u8]>,
    signed_pdf_bytes: impl AsRef<[u8]>,
    verifier: V,
) -> Result<Vec<SignatureInfo<V::Return>>> {
    let signed = signed_pdf_bytes.as_ref();
    let reference = reference_pdf_bytes.as_ref();

    if !signed.starts_with(reference) {
        return Err(VerifyError::PossibleContentChange.into());
    }
    let end_of_reference_pdf = reference.len();

    Verifier::parse(signed)?.verify(end_of_reference_pdf, verifier)
}

/// State machine for parsing and then verifying.
pub struct Verifier<'a> {
    doc: Document,
    pdf_bytes: &'a [u8],
}

impl<'a> Verifier<'a> {
    /// Parse a PDF document and creates the verification structure.
    pub fn parse(pdf_bytes: &'a [u8]) -> Result<Self> {
        let doc = Document::load_mem(pdf_bytes)?;
        Ok(Self { doc, pdf_bytes })
    }

    /// Verifies if the contents of a signed PDF file matches an earlier
    /// version.
    ///
    /// The `end_of_reference_pdf` is the byte offset that limits the original
    /// PDF document inside the full signed document. Every increment after it
    /// must do nothing but add one signature.
    pub fn verify<V: Pkcs7Verifier>(
        &self,
        end_of_reference_pdf: usize,
        verifier: V,
    ) -> Result<Vec<SignatureInfo<V::Return>>> {
        let doc = &self.doc;
        let pdf_bytes = self.pdf_bytes;

        basic_file_buff_checks(pdf_bytes, end_of_reference_pdf)?;

        if end_of_reference_pdf == pdf_bytes.len() {
            return Ok(Vec::new());
        }

        let acro_form = doc.get_dict_in_dict(doc.catalog()?, b"AcroForm")?;
        let mut signatures = get_signature_objects(pdf_bytes, doc, acro_form)?;

        // Sort the signatures by decreasing coverage of the document.
        signatures.sort_by_key(|s| -s.coverage_end);

        // The biggest signature must cover the whole document.
        match signatures.first() {
            Some(last) => {
                if last.coverage_end as usize != pdf_bytes.len() {
                    return Err(VerifyError::IncompleteCoverage.into());
                }
            }
            None => {
                return Err(VerifyError::PossibleContentChange.into());
            }
        }

        // Signatures covering only the reference document are not checked
        // for how they were added.
        let partition_point =
            signatures.partition_point(|s| s.coverage_end as usize > end_of_reference_pdf);
        let added_signatures = &signatures[..partition_point];

        // The increments we compare against, in decreasing order.
        let incremental_updates = added_signatures[1..]
            .iter()
            .map(|s| s.coverage_end as usize)
            .chain([end_of_reference_pdf]);

        let mut annotations = Vec::new();
        {
            let mut tmp_storage;
            let mut curr_doc = doc;
            for (sig, previous_doc) in added_signatures.iter().zip(incremental_updates) {
                // Signature offset must be after the previous document.
                if (sig.offset as usize) < previous_doc {
                    return Err(VerifyError::InvalidSignatureObject.into());
                }

                let previous_doc = Document::load_mem(&pdf_bytes[..previous_doc])?;
                let annot = increment_validation::verify_increment(sig, curr_doc, &previous_doc)?;
                annotations.push(annot);

                tmp_storage = previous_doc;
                curr_doc = &tmp_storage;
            }
        }

        // Signatures over the reference document have no annotation to
        // report, and they sort last.
        let extra_none_count = signatures.len() - annotations.len();
        let padded_annotations = annotations
            .into_iter()
            .chain(std::iter::repeat_with(|| None).take(extra_none_count));
        padded_annotations
            .zip(signatures)
            .map(|(annotation, signature)| -> Result<SignatureInfo<V::Return>> {
                let signed_byte_ranges = [
                    0..signature.skipped_range.start,
                    signature.skipped_range.end..signature.coverage_end as usize,
                ];
                let signed_data = [
                    &pdf_bytes[signed_byte_ranges[0].clone()],
                    &pdf_bytes[signed_byte_ranges[1].clone()],
                ];

                let (pkcs7_der, timestamp) = match signature.kind {
                    SignatureKind::DocTimeStamp => {
                        let token = TimestampToken::parse(&signature.pkcs7_ber)?;
                        check_imprint(&token, signed_data)?;
                        (token.as_der().to_vec(), Some(token.info()?))
                    }
                    SignatureKind::Signature => (signature.pkcs7_ber, None),
                };

                let verification = verifier.verify(signature.kind, &pkcs7_der, signed_data)?;
                Ok(SignatureInfo {
                    kind: signature.kind,
                    annotation,
                    signed_byte_ranges,
                    pkcs7_der,
                    timestamp,
                    verification,
                })
            })
            .collect()
    }
}

fn check_imprint(token: &TimestampToken, signed_data: [&[u8]; 2]) -> Result<()> {
    let imprint = &token.tst_info().message_imprint;
    let algorithm = imprint
        .algorithm()
        .ok_or(VerifyError::UnsupportedImprintAlgorithm)?;
    if algorithm.digest(&signed_data) != imprint.hashed_message.as_bytes() {
        return Err(VerifyError::ImprintMismatch.into());
    }
    Ok(())
}

fn basic_file_buff_checks(pdf_bytes: &[u8], end_of_reference_pdf: usize) -> Result<()> {
    if end_of_reference_pdf > pdf_bytes.len() {
        return Err(VerifyError::ReferenceIncrementOutOfBounds.into());
    }

    if !pdf_ends_with_eof(&pdf_bytes[..end_of_reference_pdf]) {
        return Err(VerifyError::InvalidReferenceDocument.into());
    }

    Ok(())
}

pub(crate) struct ExactArrayOrNone<T, const N: usize>(pub(crate) Option<[T; N]>);

impl<T, const N: usize> FromIterator<T> for ExactArrayOrNone<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut iter = iter.into_iter();
        let result = array_init::from_iter(&mut iter);
        let result = if iter.next().is_none() { result } else { None };
        ExactArrayOrNone(result)
    }
}

pub(crate) struct Signature {
    pub(crate) obj_id: ObjectId,
    pub(crate) offset: u32,
    kind: SignatureKind,
    coverage_end: i64,
    skipped_range: Range<usize>,
    pkcs7_ber: Vec<u8>,
}

fn get_signature_objects(
    pdf_bytes: &[u8],
    doc: &Document,
    acro_form: &Dictionary,
) -> Result<Vec<Signature>> {
    let mut signatures = Vec::new();

    for field in acro_form
        .get_deref(b"Fields", doc)?
        .as_array()?
        .iter()
        .map(|f| doc.dereference(f))
    {
        let field = field?.1.as_dict()?;

        if !is_signature(field) {
            continue;
        }

        signatures.push(process_signature(pdf_bytes, doc, field.get(b"V")?)?);
    }

    Ok(signatures)
}

fn process_signature(
    pdf_bytes: &[u8],
    doc: &Document,
    sig_reference: &Object,
) -> Result<Signature> {
    let (Some(obj_id), Object::Dictionary(signature)) = doc.dereference(sig_reference)? else {
        // Signature object must be an indirect dictionary.
        return Err(VerifyError::InvalidSignatureObject.into());
    };

    let signed_range = signature
        .get_deref(b"ByteRange", doc)?
        .as_array()?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_i64()))
        .collect::<lopdf::Result<ExactArrayOrNone<i64, 4>>>()?
        .0
        .ok_or(lopdf::Error::Type)?;

    if signed_range[0] != 0 {
        return Err(VerifyError::WrongRangeStart.into());
    }

    // The signature object must be inside the signed range.
    let offset = if let XrefEntry::Normal { offset, generation } = doc
        .reference_table
        .get(obj_id.0)
        .ok_or(VerifyError::InternalConsistency)?
    {
        if *generation != obj_id.1 {
            return Err(VerifyError::InternalConsistency.into());
        }
        if *offset as i64 >= signed_range[1] {
            return Err(VerifyError::InvalidCoverage.into());
        }
        *offset
    } else {
        return Err(VerifyError::InvalidSignatureObject.into());
    };

    for &range in &signed_range[1..] {
        if range < 0 {
            return Err(VerifyError::InvalidRange.into());
        }
    }
    let signed_range_end = signed_range[2]
        .checked_add(signed_range[3])
        .ok_or(VerifyError::InvalidRange)?;
    if signed_range[1] > signed_range[2] || signed_range_end > pdf_bytes.len() as i64 {
        return Err(VerifyError::InvalidRange.into());
    }

    // The bytes skipped by the range must be exactly the hex encoded /Contents.
    let skipped_bytes =
        decode_pdf_hex_string(&pdf_bytes[signed_range[1] as usize..signed_range[2] as usize])
            .ok_or(VerifyError::InvalidCoverage)?;
    let contents = signature.get_deref(b"Contents", doc)?.as_str()?;
    if contents != skipped_bytes {
        return Err(VerifyError::InvalidCoverage.into());
    }

    if !pdf_ends_with_eof(&pdf_bytes[..signed_range_end as usize]) {
        return Err(VerifyError::WrongRangeEnd.into());
    }

    Ok(Signature {
        obj_id,
        offset,
        kind: signature_kind(signature),
        coverage_end: signed_range_end,
        skipped_range: signed_range[1] as usize..signed_range[2] as usize,
        pkcs7_ber: skipped_bytes,
    })
}

fn signature_kind(signature: &Dictionary) -> SignatureKind {
    let name_is = |key: &[u8], expected: &[u8]| {
        matches!(signature.get(key), Ok(Object::Name(name)) if name == expected)
    };

    if name_is(b"Type", b"DocTimeStamp") || name_is(b"SubFilter", b"ETSI.RFC3161") {
        SignatureKind::DocTimeStamp
    } else {
        SignatureKind::Signature
    }
}

fn is_signature(annot_dict: &Dictionary) -> bool {
    matches!(annot_dict.get(b"FT"), Ok(Object::Name(ft)) if ft == b"Sig")
}

/// Decodes a PDF hex string, including the delimiters '<' and '>'.
///
/// Returns None if the string doesn't match the pattern "^<[0-9A-Fa-f]*>$".
fn decode_pdf_hex_string(hex_input: &[u8]) -> Option<Vec<u8>> {
    if hex_input.first() != Some(&b'<') || hex_input.last() != Some(&b'>') {
        return None;
    }
    let hex_input = &hex_input[1..hex_input.len() - 1];

    let mut bytes = Vec::with_capacity(hex_input.len() / 2);
    let mut hex_iter = hex_input.iter().map(|&b| (b as char).to_digit(16));

    while let Some(first) = hex_iter.next() {
        let first = first? as u8;
        let second = hex_iter.next().unwrap_or(Some(0))? as u8;
        bytes.push(first << 4 | second);
    }

    Some(bytes)
}

lazy_static::lazy_static! {
    static ref EOF_REGEX: Regex = Regex::new(r"(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();
}

/// Tests if the PDF ends with the %%EOF marker.
pub(crate) fn pdf_ends_with_eof(pdf_bytes: &[u8]) -> bool {
    EOF_REGEX.is_match(pdf_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incremental::PreparedUpdate;
    use crate::test_support::{self, FakeTsa};
    use crate::{DigestAlgorithm, TimestampAuthority};

    fn stamp(original: &[u8], algorithm: DigestAlgorithm) -> Vec<u8> {
        let prepared = PreparedUpdate::new(original, 4096).unwrap();
        let digest = prepared.digest(algorithm);
        let token = FakeTsa::default()
            .request_token(algorithm, &digest)
            .unwrap();
        prepared.embed_token(&token).unwrap()
    }

    /// Appends an incremental update to `pdf`, made of whatever `edit` puts
    /// in the new revision.
    fn append_update(pdf: &[u8], edit: impl FnOnce(&mut lopdf::IncrementalDocument)) -> Vec<u8> {
        let mut doc: lopdf::IncrementalDocument = pdf.try_into().unwrap();
        let prev = doc.get_prev_documents();
        let root = prev.trailer.get(b"Root").unwrap().clone();
        let prev_xref_start = prev.xref_start as i64;
        let prev_max_id = prev.max_id;

        doc.new_document.max_id = prev_max_id;
        doc.new_document.trailer.set("Root", root);
        doc.new_document.trailer.set("Prev", prev_xref_start);
        edit(&mut doc);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    /// Id of the signature dictionary of the last field of the form.
    fn last_signature_id(doc: &Document) -> ObjectId {
        let form = doc
            .get_dict_in_dict(doc.catalog().unwrap(), b"AcroForm")
            .unwrap();
        let fields = form.get_deref(b"Fields", doc).unwrap().as_array().unwrap();
        let field = doc
            .dereference(fields.last().unwrap())
            .unwrap()
            .1
            .as_dict()
            .unwrap();
        field.get(b"V").unwrap().as_reference().unwrap()
    }

    #[test]
    fn hex_strings() {
        assert_eq!(decode_pdf_hex_string(b"<0aFF>"), Some(vec![0x0a, 0xff]));
        assert_eq!(decode_pdf_hex_string(b"<A>"), Some(vec![0xa0]));
        assert_eq!(decode_pdf_hex_string(b"<>"), Some(vec![]));
        assert_eq!(decode_pdf_hex_string(b"0aFF"), None);
        assert_eq!(decode_pdf_hex_string(b"<0G>"), None);
    }

    #[test]
    fn eof_marker() {
        assert!(pdf_ends_with_eof(b"startxref\n42\n%%EOF"));
        assert!(pdf_ends_with_eof(b"startxref\n42\r\n%%EOF \r\n"));
        assert!(!pdf_ends_with_eof(b"startxref\n42\n%%EOF\n1 0 obj"));
    }

    #[test]
    fn unchanged_document_has_no_signatures() {
        let original = test_support::unsigned_pdf();
        let result = verify_from_reference(&original, &original, NoVerifier).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn reports_document_timestamp() {
        let original = test_support::unsigned_pdf();
        let stamped = stamp(&original, DigestAlgorithm::Sha384);

        let result = verify_from_reference(&original, &stamped, NoVerifier).unwrap();
        assert_eq!(result.len(), 1);

        let sig = &result[0];
        assert_eq!(sig.kind, SignatureKind::DocTimeStamp);
        assert_eq!(sig.signed_byte_ranges[0].start, 0);
        assert_eq!(sig.signed_byte_ranges[1].end, stamped.len());
        let timestamp = sig.timestamp.as_ref().unwrap();
        assert_eq!(timestamp.digest_algorithm, Some(DigestAlgorithm::Sha384));

        let annotation = sig.annotation.as_ref().unwrap();
        assert_eq!(annotation.page_idx, 0);
        assert!(!annotation.is_visible());
    }

    #[test]
    fn detects_tampered_contents() {
        let original = test_support::unsigned_pdf();
        let mut stamped = stamp(&original, DigestAlgorithm::Sha256);

        // Flip one byte of the page content, inside the signed range.
        let pos = stamped
            .windows(9)
            .position(|w| w == b"horodater")
            .unwrap();
        stamped[pos] = b'H';

        let err = verify_from_reference(&original, &stamped, NoVerifier).unwrap_err();
        assert!(err.downcast_ref::<VerifyError>().is_some());
    }

    #[test]
    fn detects_mismatched_imprint() {
        let original = test_support::unsigned_pdf();
        let prepared = PreparedUpdate::new(&original, 4096).unwrap();
        let token = FakeTsa::default()
            .request_token(DigestAlgorithm::Sha256, &[0u8; 32])
            .unwrap();
        let stamped = prepared.embed_token(&token).unwrap();

        let err = verify_from_reference(&original, &stamped, NoVerifier).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::ImprintMismatch)
        ));
    }

    #[test]
    fn detects_appended_bytes() {
        let original = test_support::unsigned_pdf();
        let stamped = stamp(&original, DigestAlgorithm::Sha256);
        // A well formed but unsigned revision after the timestamp.
        let extended = append_update(&stamped, |_| ());
        assert!(extended.len() > stamped.len());

        let err = verify_from_reference(&original, &extended, NoVerifier).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::IncompleteCoverage)
        ));
    }

    #[test]
    fn rejects_overflowing_byte_range() {
        let original = test_support::unsigned_pdf();
        let stamped = stamp(&original, DigestAlgorithm::Sha256);

        let half = i64::MAX / 2;
        let hostile = append_update(&stamped, |doc| {
            let sig_id = last_signature_id(doc.get_prev_documents());
            doc.opt_clone_object_to_new_document(sig_id).unwrap();
            doc.new_document
                .get_dictionary_mut(sig_id)
                .unwrap()
                .set(
                    "ByteRange",
                    vec![
                        Object::Integer(0),
                        Object::Integer(half),
                        Object::Integer(half + 1),
                        Object::Integer(half + 1),
                    ],
                );
        });

        let err = verify_from_reference(&original, &hostile, NoVerifier).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::InvalidRange)
        ));
    }

    #[test]
    fn rejects_other_reference() {
        let original = test_support::unsigned_pdf();
        let stamped = stamp(&original, DigestAlgorithm::Sha256);
        let other = test_support::pdf_with_form();

        let err = verify_from_reference(&other, &stamped, NoVerifier).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::PossibleContentChange)
        ));
    }

    #[test]
    fn passes_contents_to_verifier() {
        struct Recorder;
        impl Pkcs7Verifier for Recorder {
            type Return = (SignatureKind, usize);
            fn verify(
                &self,
                kind: SignatureKind,
                pkcs7_der: &[u8],
                signed_data: [&[u8]; 2],
            ) -> Result<Self::Return> {
                assert!(TimestampToken::parse(pkcs7_der).is_ok());
                Ok((kind, signed_data[0].len() + signed_data[1].len()))
            }
        }

        let original = test_support::unsigned_pdf();
        let stamped = stamp(&original, DigestAlgorithm::Sha256);
        let result = verify_from_reference(&original, &stamped, Recorder).unwrap();

        let (kind, covered) = result[0].verification;
        assert_eq!(kind, SignatureKind::DocTimeStamp);
        assert_eq!(covered, stamped.len() - (2 * 4096 + 2));
    }
}
