//! Fixtures shared by the unit tests: sample documents, fake tokens, a fake
//! TSA and a one-shot HTTP server. Nothing here touches the network.

use std::cell::{Cell, RefCell};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use chrono::Utc;
use cms::{
    content_info::{CmsVersion, ContentInfo},
    signed_data::{EncapsulatedContentInfo, SignedData, SignerInfos},
};
use const_oid::ObjectIdentifier;
use der::{
    asn1::{Int, SetOfVec, Uint},
    Any, Decode, Encode, Tag,
};
use lopdf::{dictionary, Document, Object, Stream};

use crate::rfc3161::{
    Accuracy, GenTime, MessageImprint, PkiStatusInfo, TimeStampReq, TimeStampResp, TstInfo,
    ID_CT_TST_INFO, ID_SIGNED_DATA,
};
use crate::{DigestAlgorithm, TimestampAuthority, TimestampError};

/// DigiCert's timestamping policy, as found in real tokens.
const TEST_POLICY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.114412.7.1");

pub fn test_data(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("test_data").join(name)
}

pub fn unsigned_pdf() -> Vec<u8> {
    std::fs::read(test_data("unsigned.pdf")).unwrap()
}

/// A one page document whose AcroForm already has a text field named
/// `Timestamp1`, which is also the only annotation of the page.
pub fn pdf_with_form() -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let page_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        b"BT /F1 12 Tf 72 712 Td (Form) Tj ET".to_vec(),
    ));
    let field_id = doc.add_object(dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Tx",
        "T" => Object::string_literal("Timestamp1"),
        "Rect" => vec![
            Object::Integer(72),
            Object::Integer(600),
            Object::Integer(272),
            Object::Integer(630),
        ],
        "P" => page_id,
    });

    doc.objects.insert(
        page_id,
        Object::Dictionary(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(612),
                Object::Integer(792),
            ],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
            "Annots" => vec![Object::Reference(field_id)],
        }),
    );
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
        }),
    );

    let form_id = doc.add_object(dictionary! {
        "Fields" => vec![Object::Reference(field_id)],
    });
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
        "AcroForm" => form_id,
    });
    doc.trailer.set("Root", catalog_id);

    save(doc)
}

/// A structurally valid document with an empty page tree.
pub fn pdf_without_pages() -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => Vec::<Object>::new(),
        "Count" => 0,
    });
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    save(doc)
}

fn save(mut doc: Document) -> Vec<u8> {
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

/// An unsigned timestamp token over `imprint`.
///
/// Structurally identical to what a TSA returns, minus the signer infos and
/// certificates.
pub fn token(imprint: &MessageImprint, nonce: Option<Uint>, serial: u8) -> Vec<u8> {
    let tst_info = TstInfo {
        version: 1,
        policy: TEST_POLICY,
        message_imprint: imprint.clone(),
        serial_number: Int::new(&[0x01, serial]).unwrap(),
        gen_time: GenTime::from_datetime(Utc::now()),
        accuracy: Some(Accuracy {
            seconds: Some(1),
            millis: None,
            micros: None,
        }),
        ordering: false,
        nonce,
        tsa: None,
        extensions: None,
    };

    let signed_data = SignedData {
        version: CmsVersion::V3,
        digest_algorithms: SetOfVec::try_from(vec![imprint.hash_algorithm.clone()]).unwrap(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_CT_TST_INFO,
            econtent: Some(Any::new(Tag::OctetString, tst_info.to_der().unwrap()).unwrap()),
        },
        certificates: None,
        crls: None,
        signer_infos: SignerInfos(SetOfVec::new()),
    };

    ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data).unwrap(),
    }
    .to_der()
    .unwrap()
}

/// A granted TimeStampResp answering `request`.
pub fn granted_response(request: &TimeStampReq, serial: u8) -> Vec<u8> {
    let token = token(&request.message_imprint, request.nonce.clone(), serial);
    TimeStampResp {
        status: PkiStatusInfo {
            status: 0,
            status_string: None,
            fail_info: None,
        },
        time_stamp_token: Some(Any::from_der(&token).unwrap()),
    }
    .to_der()
    .unwrap()
}

/// A TimeStampResp with status `rejection` and no token.
pub fn rejected_response(text: &str) -> Vec<u8> {
    TimeStampResp {
        status: PkiStatusInfo {
            status: 2,
            status_string: Some(vec![text.to_string()]),
            fail_info: None,
        },
        time_stamp_token: None,
    }
    .to_der()
    .unwrap()
}

/// In-process TSA issuing unsigned tokens, recording every request.
#[derive(Default)]
pub struct FakeTsa {
    pub requests: RefCell<Vec<(DigestAlgorithm, Vec<u8>)>>,
    serial: Cell<u8>,
}

impl TimestampAuthority for FakeTsa {
    fn request_token(
        &self,
        algorithm: DigestAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, TimestampError> {
        self.requests
            .borrow_mut()
            .push((algorithm, digest.to_vec()));
        let serial = self.serial.get().wrapping_add(1);
        self.serial.set(serial);

        let request = TimeStampReq::new(MessageImprint::new(algorithm, digest)?)?;
        TimeStampResp::from_der(&granted_response(&request, serial))?.into_token(&request)
    }
}

/// What the one-shot server received.
pub struct CapturedRequest {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// HTTP server on a local port that answers exactly one request.
pub struct OneShotServer {
    addr: SocketAddr,
    handle: JoinHandle<CapturedRequest>,
}

impl OneShotServer {
    /// `respond` maps the request body to (status, content type, body).
    pub fn start<F>(respond: F) -> Self
    where
        F: FnOnce(&[u8]) -> (u16, &'static str, Vec<u8>) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut content_type = None;
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    match name.trim().to_ascii_lowercase().as_str() {
                        "content-type" => content_type = Some(value.trim().to_string()),
                        "content-length" => content_length = value.trim().parse().unwrap(),
                        _ => (),
                    }
                }
            }
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();

            let (status, response_type, response) = respond(&body);
            write!(
                stream,
                "HTTP/1.1 {status} Test\r\nContent-Type: {response_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                response.len()
            )
            .unwrap();
            stream.write_all(&response).unwrap();
            stream.flush().unwrap();

            CapturedRequest { content_type, body }
        });

        Self { addr, handle }
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn join(self) -> CapturedRequest {
        self.handle.join().unwrap()
    }
}

/// URL of a local port nothing listens on.
pub fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/")
}
