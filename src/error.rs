use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`crate::PdfTimestamper`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("input file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("timestamping failed")]
    Timestamping(#[from] TimestampError),
    #[error("unexpected error")]
    Unexpected(#[source] anyhow::Error),
}

/// The cause of a failed timestamping operation.
///
/// Each variant names the step that failed; the underlying error, if any, is
/// available through [`std::error::Error::source`].
#[derive(Error, Debug)]
pub enum TimestampError {
    #[error("input file must be a PDF: {}", .0.display())]
    NotPdf(PathBuf),
    #[error("output path is the same file as the input: {}", .0.display())]
    OutputIsInput(PathBuf),
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigest(String),
    #[error("invalid TSA URL {url:?}")]
    InvalidTsaUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported TSA URL scheme {0:?}, expected http or https")]
    UnsupportedScheme(String),
    #[error("I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF error")]
    Pdf(#[from] lopdf::Error),
    #[error("malformed PDF document: {0}")]
    MalformedPdf(&'static str),
    #[error("request to the TSA failed")]
    Transport(#[source] Box<ureq::Transport>),
    #[error("TSA answered with HTTP status {0}")]
    HttpStatus(u16),
    #[error("TSA answered with unexpected content type {0:?}")]
    UnexpectedContentType(String),
    #[error("failed to read the TSA response")]
    ResponseBody(#[source] std::io::Error),
    #[error("malformed timestamp data")]
    Asn1(#[from] der::Error),
    #[error("TSA rejected the request with status {status}{}", .text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
    Rejected { status: u8, text: Option<String> },
    #[error("TSA response does not contain a timestamp token")]
    MissingToken,
    #[error("timestamp token is not a signed TSTInfo")]
    NotATimestampToken,
    #[error("TSA response nonce does not match the request")]
    NonceMismatch,
    #[error("TSA response message imprint does not match the request")]
    ImprintMismatch,
    #[error("timestamp token is {token} bytes, but only {reserved} bytes were reserved")]
    TokenTooLarge { token: usize, reserved: usize },
}

impl From<ureq::Error> for TimestampError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(status, _) => TimestampError::HttpStatus(status),
            ureq::Error::Transport(transport) => TimestampError::Transport(Box::new(transport)),
        }
    }
}
