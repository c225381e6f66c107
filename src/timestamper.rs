use std::io::Write;
use std::path::{Path, PathBuf};

use crate::incremental::{PreparedUpdate, DEFAULT_TOKEN_SIZE};
use crate::tsa::{HttpTimestamper, TimestampAuthority, DEFAULT_TSA_URL};
use crate::{DigestAlgorithm, Error, TimestampError, TimestamperConfig};

/// Applies RFC 3161 document timestamps to PDF files.
///
/// Each call to [`PdfTimestamper::timestamp`] reads one PDF, obtains one
/// token from the authority and writes one new PDF: the input followed by an
/// incremental update carrying the token in an invisible signature field.
pub struct PdfTimestamper<A = HttpTimestamper> {
    authority: A,
    token_size: usize,
}

impl PdfTimestamper<HttpTimestamper> {
    /// Timestamper talking to the TSA at `tsa_url`, or to DigiCert's public
    /// endpoint if `None`. No connection is made yet.
    pub fn new(tsa_url: Option<&str>) -> Result<Self, Error> {
        let tsa_url = tsa_url.unwrap_or(DEFAULT_TSA_URL);
        tracing::info!(tsa_url, "initializing timestamper");

        Ok(Self::with_authority(HttpTimestamper::new(tsa_url)?))
    }

    pub fn from_config(config: &TimestamperConfig) -> Result<Self, Error> {
        Ok(Self::new(Some(&config.tsa_url))?.with_token_size(config.token_size))
    }
}

impl<A: TimestampAuthority> PdfTimestamper<A> {
    /// Timestamper obtaining its tokens from `authority`.
    pub fn with_authority(authority: A) -> Self {
        Self {
            authority,
            token_size: DEFAULT_TOKEN_SIZE,
        }
    }

    /// Bytes reserved in the document for the token. A token that does not
    /// fit fails the operation with [`TimestampError::TokenTooLarge`].
    pub fn with_token_size(mut self, token_size: usize) -> Self {
        self.token_size = token_size;
        self
    }

    pub fn authority(&self) -> &A {
        &self.authority
    }

    /// Timestamps `input` into `output`, hashing with the algorithm named by
    /// `digest_algorithm` (`"sha256"` unless there is a reason otherwise).
    ///
    /// `output` is replaced if it exists. It is written atomically: on
    /// failure, whatever was at `output` before is left untouched.
    pub fn timestamp(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        digest_algorithm: &str,
    ) -> Result<(), Error> {
        let input = input.as_ref();
        check_input(input)?;
        let algorithm = DigestAlgorithm::from_name(digest_algorithm)?;

        self.stamp(input, output.as_ref(), algorithm)
    }

    /// Same as [`PdfTimestamper::timestamp`], with an already parsed
    /// algorithm.
    pub fn timestamp_with_algorithm(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        algorithm: DigestAlgorithm,
    ) -> Result<(), Error> {
        let input = input.as_ref();
        check_input(input)?;

        self.stamp(input, output.as_ref(), algorithm)
    }

    fn stamp(&self, input: &Path, output: &Path, algorithm: DigestAlgorithm) -> Result<(), Error> {
        if is_same_file(input, output) {
            return Err(TimestampError::OutputIsInput(output.to_path_buf()).into());
        }

        tracing::info!(input = %input.display(), "processing document");
        tracing::info!(output = %output.display(), "output will be saved to");
        let original = std::fs::read(input).map_err(|source| TimestampError::Io {
            path: input.to_path_buf(),
            source,
        })?;

        let prepared = PreparedUpdate::new(&original, self.token_size)?;
        drop(original);

        tracing::info!(%algorithm, "applying timestamp");
        let digest = prepared.digest(algorithm);
        let token = self.authority.request_token(algorithm, &digest)?;
        tracing::debug!(
            token_bytes = token.len(),
            reserved = self.token_size,
            "embedding timestamp token"
        );
        let stamped = prepared.embed_token(&token)?;

        write_atomically(output, &stamped)?;

        tracing::info!(output = %output.display(), "successfully timestamped document");
        Ok(())
    }
}

fn check_input(input: &Path) -> Result<(), Error> {
    if !input.exists() {
        return Err(Error::FileNotFound(input.to_path_buf()));
    }

    let is_pdf = input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
    if !is_pdf {
        return Err(TimestampError::NotPdf(input.to_path_buf()).into());
    }

    Ok(())
}

/// True if both paths name the same existing file, hard links included.
#[cfg(unix)]
fn is_same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (a.metadata(), b.metadata()) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

/// True if both paths resolve to the same existing file. Hard links are not
/// detected.
#[cfg(not(unix))]
fn is_same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Writes to a temporary file next to `path`, then renames it over `path`.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), TimestampError> {
    let io_error = |source| TimestampError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
    file.write_all(bytes).map_err(io_error)?;
    file.as_file().sync_all().map_err(io_error)?;
    file.persist(path).map_err(|e| io_error(e.error))?;

    Ok(())
}
