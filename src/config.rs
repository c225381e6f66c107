use std::path::PathBuf;

use crate::incremental::DEFAULT_TOKEN_SIZE;
use crate::tsa::DEFAULT_TSA_URL;
use crate::DigestAlgorithm;

/// Input file used when none is given.
pub const DEFAULT_INPUT: &str = "document_a_horodater.pdf";

/// Output file used when none is given.
pub const DEFAULT_OUTPUT: &str = "document_horodate.pdf";

/// Everything a timestamping run needs to know.
///
/// The [`Default`] values reproduce a run without any argument: the DigiCert
/// TSA, SHA-256, and the two fixed file names in the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestamperConfig {
    /// RFC 3161 endpoint, `http` or `https`.
    pub tsa_url: String,
    pub digest_algorithm: DigestAlgorithm,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Bytes reserved in the document for the timestamp token.
    pub token_size: usize,
}

impl Default for TimestamperConfig {
    fn default() -> Self {
        Self {
            tsa_url: DEFAULT_TSA_URL.to_string(),
            digest_algorithm: DigestAlgorithm::default(),
            input: PathBuf::from(DEFAULT_INPUT),
            output: PathBuf::from(DEFAULT_OUTPUT),
            token_size: DEFAULT_TOKEN_SIZE,
        }
    }
}
