use std::{sync::Arc, time::SystemTime};
use serde_derive::{Deserialize, Serialize};
use url::Url;
use crate::transfer::{ExclusiveTransferBox, OwnershipViolation};

// Request line and headers as decoded from a child's start message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestHead {

    #[serde(deserialize_with = "crate::de::url_deserialize", serialize_with = "crate::de::url_serialize")]
    pub url: Url,

    #[serde(deserialize_with = "crate::de::method_deserialize")]
    pub method: String,

    #[serde(default)]
    pub referrer: String,

    // Raw CRLF separated header block.
    #[serde(default)]
    pub extra_headers: String,

}

// Upload payload for a request body. Not safe for concurrent mutation, so it
// crosses to the backend inside an ExclusiveTransferBox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadBody {

    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,

}

impl UploadBody {

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// Inbound decoded form of a request. The decoder hands the upload body over
// still refcounted.
#[derive(Debug)]
pub struct WireRequest {

    pub head: RequestHead,

    pub upload: Option<Arc<UploadBody>>,

}

impl WireRequest {
    pub fn upload_size(&self) -> u64 {
        self.upload.as_ref().map(|body| body.len()).unwrap_or(0)
    }
}

// The form forwarded to the execution backend. Building one verifies the
// upload body has exactly one owner, the decoder must not retain it.
#[derive(Debug)]
pub struct TransferableRequest {

    pub head: RequestHead,

    pub upload: Option<ExclusiveTransferBox<UploadBody>>,

}

impl TransferableRequest {

    pub fn take(request: WireRequest) -> Result<Self, OwnershipViolation> {
        let upload = match request.upload {
            Some(body) => Some(ExclusiveTransferBox::new(body)?),
            None => None,
        };
        Ok(TransferableRequest {
            head: request.head,
            upload,
        })
    }
}

// Argument bundle reported by the backend when a response begins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseHead {

    pub mime_type: String,

    // Raw response header block.
    pub headers: String,

    pub content_length: Option<u64>,

    pub last_modified: Option<SystemTime>,

    // Set when the response was a redirect the backend followed.
    #[serde(default)]
    pub redirect_url: Option<String>,

    #[serde(default)]
    pub redirect_status: Option<u16>,

}

// Final status of a request, relayed on response end.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum RequestStatus {
    Success,
    Canceled,
    Failed(String),
}
