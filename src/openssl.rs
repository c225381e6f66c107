//! Optional OpenSSL module for signature verification.
//!
//! [`OpenSslVerifier`] checks the CMS signature of every signature and
//! document timestamp found by [`crate::verify_from_reference`]. It is enabled
//! by the `openssl` feature.

use std::path::Path;

use anyhow::Result;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::{
    store::{X509Store, X509StoreBuilder},
    X509PurposeId, X509,
};

use crate::verify::{Pkcs7Verifier, SignatureKind};

/// OpenSSL implementation of the signature verifier.
pub struct OpenSslVerifier {
    ca_store: X509Store,
    intermediaries: Stack<X509>,
}

impl OpenSslVerifier {
    /// Creates a new verifier with the given CA store and a set of untrusted
    /// intermediary certificates that might be needed in the verification.
    ///
    /// For document timestamps, build the store with
    /// [`load_timestamping_ca_bundle_from_dir`] so that the TSA certificate
    /// must be valid for timestamping.
    pub fn new(ca_store: X509Store, intermediaries: Stack<X509>) -> Self {
        Self {
            ca_store,
            intermediaries,
        }
    }
}

/// Verified signatures are reported as the OpenSSL [`Pkcs7`] structure, with
/// the signer certificates, plus the signed content for document timestamps.
pub struct Verified {
    pub pkcs7: Pkcs7,
    /// DER encoded TSTInfo for document timestamps, empty otherwise.
    pub content: Vec<u8>,
}

impl Pkcs7Verifier for &OpenSslVerifier {
    type Return = Verified;

    fn verify(
        &self,
        kind: SignatureKind,
        pkcs7_der: &[u8],
        signed_data: [&[u8]; 2],
    ) -> Result<Verified> {
        let pkcs7 = Pkcs7::from_der(pkcs7_der)?;
        let mut content = Vec::new();

        match kind {
            // The token signs its own TSTInfo. Its link to the document is the
            // message imprint, already compared with the signed ranges.
            SignatureKind::DocTimeStamp => {
                pkcs7.verify(
                    &self.intermediaries,
                    &self.ca_store,
                    None,
                    Some(&mut content),
                    Pkcs7Flags::empty(),
                )?;
            }
            SignatureKind::Signature => {
                // OpenSSL wants the detached content in one piece.
                let mut contiguous =
                    Vec::with_capacity(signed_data[0].len() + signed_data[1].len());
                contiguous.extend_from_slice(signed_data[0]);
                contiguous.extend_from_slice(signed_data[1]);

                pkcs7.verify(
                    &self.intermediaries,
                    &self.ca_store,
                    Some(&contiguous),
                    None,
                    Pkcs7Flags::empty(),
                )?;
            }
        }

        Ok(Verified { pkcs7, content })
    }
}

/// Loads CA certificates from a directory containing PEM files.
pub fn load_ca_bundle_from_dir<P: AsRef<Path>>(dir: P) -> Result<X509StoreBuilder> {
    let mut builder = X509StoreBuilder::new()?;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let cert = X509::from_pem(&std::fs::read(&path)?)?;
        builder.add_cert(cert)?;
    }

    Ok(builder)
}

/// Like [`load_ca_bundle_from_dir`], but the leaf certificate must be allowed
/// to sign timestamps.
pub fn load_timestamping_ca_bundle_from_dir<P: AsRef<Path>>(dir: P) -> Result<X509StoreBuilder> {
    let mut builder = load_ca_bundle_from_dir(dir)?;
    builder.set_purpose(X509PurposeId::TIMESTAMP_SIGN)?;
    Ok(builder)
}
