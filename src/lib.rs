#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

#[cfg(feature = "openssl")]
pub mod openssl;

pub mod incremental;
pub mod rfc3161;
pub mod tsa;
pub mod verify;

mod config;
mod digest;
mod error;
mod increment_validation;
mod timestamper;

#[cfg(test)]
mod test_support;

pub use config::{TimestamperConfig, DEFAULT_INPUT, DEFAULT_OUTPUT};
pub use digest::DigestAlgorithm;
pub use error::{Error, TimestampError};
pub use increment_validation::{Annotation, IncrementError};
pub use rfc3161::{TimestampInfo, TimestampToken};
pub use timestamper::PdfTimestamper;
pub use tsa::{HttpTimestamper, TimestampAuthority, DEFAULT_TSA_URL};
pub use verify::{
    verify_from_reference, NoVerifier, Pkcs7Verifier, SignatureInfo, SignatureKind, Verifier,
    VerifyError,
};
