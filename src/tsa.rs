//! Time-Stamp Authority transport.

use std::io::Read;
use std::time::{Duration, Instant};

use der::{Decode, Encode};
use url::Url;

use crate::rfc3161::{MessageImprint, TimeStampReq, TimeStampResp};
use crate::{DigestAlgorithm, TimestampError};

/// DigiCert's public RFC 3161 endpoint.
pub const DEFAULT_TSA_URL: &str = "http://timestamp.digicert.com";

const CONTENT_TYPE_QUERY: &str = "application/timestamp-query";
const CONTENT_TYPE_REPLY: &str = "application/timestamp-reply";
const CONTENT_TYPE_REPLY_ALT: &str = "application/timestamp-response";

const MAX_RESPONSE_SIZE: u64 = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Something that can produce a timestamp token over a digest.
pub trait TimestampAuthority {
    /// Requests a token over `digest`, which was computed with `algorithm`.
    ///
    /// Returns the DER encoded token (a CMS ContentInfo), already checked to
    /// cover the requested digest.
    fn request_token(
        &self,
        algorithm: DigestAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, TimestampError>;
}

impl<T: TimestampAuthority + ?Sized> TimestampAuthority for &T {
    fn request_token(
        &self,
        algorithm: DigestAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, TimestampError> {
        (**self).request_token(algorithm, digest)
    }
}

/// RFC 3161 over HTTP: one POST per token.
pub struct HttpTimestamper {
    url: Url,
    agent: ureq::Agent,
}

impl HttpTimestamper {
    /// Validates `url` and prepares the HTTP agent. No connection is made.
    pub fn new(url: &str) -> Result<Self, TimestampError> {
        let url = Url::parse(url).map_err(|source| TimestampError::InvalidTsaUrl {
            url: url.to_string(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TimestampError::UnsupportedScheme(url.scheme().to_string()));
        }

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build();

        Ok(Self { url, agent })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn post(&self, request_der: &[u8]) -> Result<Vec<u8>, TimestampError> {
        let response = self
            .agent
            .post(self.url.as_str())
            .set("Content-Type", CONTENT_TYPE_QUERY)
            .set("Accept", CONTENT_TYPE_REPLY)
            .send_bytes(request_der)?;

        let content_type = response.content_type();
        if content_type != CONTENT_TYPE_REPLY && content_type != CONTENT_TYPE_REPLY_ALT {
            return Err(TimestampError::UnexpectedContentType(
                content_type.to_string(),
            ));
        }

        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_RESPONSE_SIZE)
            .read_to_end(&mut body)
            .map_err(TimestampError::ResponseBody)?;
        Ok(body)
    }
}

impl TimestampAuthority for HttpTimestamper {
    fn request_token(
        &self,
        algorithm: DigestAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, TimestampError> {
        let request = TimeStampReq::new(MessageImprint::new(algorithm, digest)?)?;
        let request_der = request.to_der()?;

        tracing::debug!(url = %self.url, bytes = request_der.len(), "sending timestamp request");
        let started = Instant::now();
        let body = self.post(&request_der)?;
        tracing::debug!(
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "received timestamp response"
        );

        TimeStampResp::from_der(&body)?.into_token(&request)
    }
}
