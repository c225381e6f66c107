//! DER types of the RFC 3161 Time-Stamp Protocol, and the checks applied to
//! the token returned by a TSA.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use cms::{content_info::ContentInfo, signed_data::SignedData};
use const_oid::ObjectIdentifier;
use der::{
    asn1::{BitString, Int, OctetString, Uint},
    Any, Decode, DecodeValue, Encode, EncodeValue, FixedTag, Header, Length, Reader, Sequence,
    SliceReader, Tag, Writer,
};
use rand::Rng;
use spki::AlgorithmIdentifierOwned;
use x509_cert::ext::{pkix::name::GeneralName, Extensions};

use crate::{DigestAlgorithm, TimestampError};

/// id-signedData: 1.2.840.113549.1.7.2
pub const ID_SIGNED_DATA: ObjectIdentifier = const_oid::db::rfc5911::ID_SIGNED_DATA;

/// id-ct-TSTInfo: 1.2.840.113549.1.9.16.1.4
pub const ID_CT_TST_INFO: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.4");

fn default_false() -> bool {
    false
}

/// MessageImprint ::= SEQUENCE { hashAlgorithm, hashedMessage }
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct MessageImprint {
    pub hash_algorithm: AlgorithmIdentifierOwned,
    pub hashed_message: OctetString,
}

impl MessageImprint {
    pub fn new(algorithm: DigestAlgorithm, digest: &[u8]) -> der::Result<Self> {
        Ok(Self {
            hash_algorithm: AlgorithmIdentifierOwned {
                oid: algorithm.oid(),
                parameters: Some(Any::null()),
            },
            hashed_message: OctetString::new(digest)?,
        })
    }

    pub fn algorithm(&self) -> Option<DigestAlgorithm> {
        DigestAlgorithm::from_oid(&self.hash_algorithm.oid)
    }

    /// Compares algorithm and digest. Algorithm parameters are ignored, since
    /// an absent parameter and an explicit NULL mean the same thing for the
    /// SHA-2 family and TSAs are not consistent about which one they echo.
    pub fn matches(&self, other: &MessageImprint) -> bool {
        self.hash_algorithm.oid == other.hash_algorithm.oid
            && self.hashed_message.as_bytes() == other.hashed_message.as_bytes()
    }
}

/// TimeStampReq, RFC 3161 section 2.4.1.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampReq {
    pub version: u8,
    pub message_imprint: MessageImprint,
    #[asn1(optional = "true")]
    pub req_policy: Option<ObjectIdentifier>,
    #[asn1(optional = "true")]
    pub nonce: Option<Uint>,
    #[asn1(default = "default_false")]
    pub cert_req: bool,
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
    pub extensions: Option<Extensions>,
}

impl TimeStampReq {
    /// Version 1 request with a fresh random nonce, asking the TSA to include
    /// its certificate in the token.
    pub fn new(message_imprint: MessageImprint) -> der::Result<Self> {
        Ok(Self {
            version: 1,
            message_imprint,
            req_policy: None,
            nonce: Some(random_nonce()?),
            cert_req: true,
            extensions: None,
        })
    }
}

/// A positive 64 bit nonce whose first byte is neither zero nor has the high
/// bit set, so it has the same minimal encoding as INTEGER and as unsigned.
fn random_nonce() -> der::Result<Uint> {
    let mut bytes: [u8; 8] = rand::thread_rng().gen();
    bytes[0] = (bytes[0] & 0x7f).max(1);
    Uint::new(&bytes)
}

/// PKIStatus values, RFC 3161 section 2.4.2.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PkiStatus {
    Granted = 0,
    GrantedWithMods = 1,
    Rejection = 2,
    Waiting = 3,
    RevocationWarning = 4,
    RevocationNotification = 5,
}

/// PKIStatusInfo ::= SEQUENCE { status, statusString OPTIONAL, failInfo OPTIONAL }
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PkiStatusInfo {
    pub status: u8,
    #[asn1(optional = "true")]
    pub status_string: Option<Vec<String>>,
    #[asn1(optional = "true")]
    pub fail_info: Option<BitString>,
}

impl PkiStatusInfo {
    pub fn is_granted(&self) -> bool {
        self.status == PkiStatus::Granted as u8 || self.status == PkiStatus::GrantedWithMods as u8
    }
}

/// TimeStampResp ::= SEQUENCE { status, timeStampToken OPTIONAL }
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampResp {
    pub status: PkiStatusInfo,
    #[asn1(optional = "true")]
    pub time_stamp_token: Option<Any>,
}

impl TimeStampResp {
    /// Checks the response against the request it answers and returns the
    /// DER encoded token.
    ///
    /// The token must be granted, carry a TSTInfo, echo the request nonce and
    /// cover the same message imprint.
    pub fn into_token(self, request: &TimeStampReq) -> Result<Vec<u8>, TimestampError> {
        if !self.status.is_granted() {
            return Err(TimestampError::Rejected {
                status: self.status.status,
                text: self.status.status_string.map(|s| s.join("; ")),
            });
        }

        let token = self
            .time_stamp_token
            .ok_or(TimestampError::MissingToken)?
            .to_der()?;
        let token = TimestampToken::parse(&token)?;

        let tst_info = token.tst_info();
        if tst_info.nonce != request.nonce {
            return Err(TimestampError::NonceMismatch);
        }
        if !tst_info.message_imprint.matches(&request.message_imprint) {
            return Err(TimestampError::ImprintMismatch);
        }

        Ok(token.der)
    }
}

/// Accuracy ::= SEQUENCE { seconds, millis [0], micros [1] }
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct Accuracy {
    #[asn1(optional = "true")]
    pub seconds: Option<u64>,
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
    pub millis: Option<u16>,
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", optional = "true")]
    pub micros: Option<u16>,
}

/// TSTInfo, RFC 3161 section 2.4.2.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TstInfo {
    pub version: u8,
    pub policy: ObjectIdentifier,
    pub message_imprint: MessageImprint,
    pub serial_number: Int,
    pub gen_time: GenTime,
    #[asn1(optional = "true")]
    pub accuracy: Option<Accuracy>,
    #[asn1(default = "default_false")]
    pub ordering: bool,
    #[asn1(optional = "true")]
    pub nonce: Option<Uint>,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    pub tsa: Option<GeneralName>,
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", optional = "true")]
    pub extensions: Option<Extensions>,
}

/// GeneralizedTime as found in TSTInfo.
///
/// Kept as text because TSAs routinely include fractional seconds, which the
/// strict DER time type refuses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GenTime(String);

impl GenTime {
    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        GenTime(time.format("%Y%m%d%H%M%SZ").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_datetime(&self) -> der::Result<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.0, "%Y%m%d%H%M%S%.fZ")
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|_| Self::TAG.value_error())
    }
}

impl FixedTag for GenTime {
    const TAG: Tag = Tag::GeneralizedTime;
}

impl<'a> DecodeValue<'a> for GenTime {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        let bytes = reader.read_vec(header.length)?;
        String::from_utf8(bytes)
            .map(GenTime)
            .map_err(|_| Self::TAG.value_error())
    }
}

impl EncodeValue for GenTime {
    fn value_len(&self) -> der::Result<Length> {
        Length::try_from(self.0.len())
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        writer.write(self.0.as_bytes())
    }
}

/// A timestamp token: a CMS ContentInfo holding SignedData over a TSTInfo.
#[derive(Clone, Debug)]
pub struct TimestampToken {
    der: Vec<u8>,
    tst_info: TstInfo,
}

impl TimestampToken {
    /// Parses a token. Bytes after the token are ignored, which is how it
    /// sits inside the zero padded `/Contents` of a PDF signature.
    pub fn parse(bytes: &[u8]) -> Result<Self, TimestampError> {
        let mut reader = SliceReader::new(bytes)?;
        let content_info = ContentInfo::decode(&mut reader)?;
        let len = usize::try_from(reader.position())?;

        if content_info.content_type != ID_SIGNED_DATA {
            return Err(TimestampError::NotATimestampToken);
        }
        let signed_data = SignedData::from_der(&content_info.content.to_der()?)?;

        let encap = signed_data.encap_content_info;
        if encap.econtent_type != ID_CT_TST_INFO {
            return Err(TimestampError::NotATimestampToken);
        }
        let econtent: OctetString = encap
            .econtent
            .ok_or(TimestampError::NotATimestampToken)?
            .decode_as()?;
        let tst_info = TstInfo::from_der(econtent.as_bytes())?;

        Ok(Self {
            der: bytes[..len].to_vec(),
            tst_info,
        })
    }

    /// The exact DER encoding of the token, without padding.
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn tst_info(&self) -> &TstInfo {
        &self.tst_info
    }

    /// Summary of the TSTInfo fields relevant to a reader of the document.
    pub fn info(&self) -> Result<TimestampInfo, TimestampError> {
        let tst_info = &self.tst_info;
        Ok(TimestampInfo {
            gen_time: tst_info.gen_time.to_datetime()?,
            digest_algorithm: tst_info.message_imprint.algorithm(),
            policy: tst_info.policy,
            serial_number: tst_info.serial_number.as_bytes().to_vec(),
            nonce: tst_info.nonce.as_ref().map(|n| n.as_bytes().to_vec()),
        })
    }
}

/// What a document timestamp attests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimestampInfo {
    /// Time at which the TSA created the token.
    pub gen_time: DateTime<Utc>,
    /// Algorithm of the message imprint, if it is one this crate knows.
    pub digest_algorithm: Option<DigestAlgorithm>,
    pub policy: ObjectIdentifier,
    pub serial_number: Vec<u8>,
    pub nonce: Option<Vec<u8>>,
}
