use tokio::{sync::mpsc, task::{self, JoinHandle}};
use tracing::Instrument;
use bytes::Bytes;
use url::Url;
use crate::{
    config::Config,
    request::{ProtocolError, ResourceKind},
    table::TableError,
    transfer::OwnershipViolation,
    wire::{RequestStatus, ResponseHead, TransferableRequest, WireRequest},
    ChildId, RelayTx, RequestId, RequestKey, RouteId,
};

mod proxy;
#[cfg(test)]
mod tests;

pub use proxy::CrossProcessRequestProxy;

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
pub type ProxyTx = mpsc::UnboundedSender<ProxyCommand>;
pub type ProxyRx = mpsc::UnboundedReceiver<ProxyCommand>;
pub type BackendTx = mpsc::UnboundedSender<BackendCommand>;
pub type BackendRx = mpsc::UnboundedReceiver<BackendCommand>;
pub type BackendEventTx = mpsc::UnboundedSender<BackendEvent>;
pub type BackendEventRx = mpsc::UnboundedReceiver<BackendEvent>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Ownership(#[from] OwnershipViolation),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("proxy task panicked")]
    ProxyPanic,

}

impl<T> From<mpsc::error::SendError<T>> for ProxyError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        ProxyError::Channel(e.to_string())
    }
}

// Everything decoded from a child's start message.
#[derive(Debug)]
pub struct StartRequest {

    pub child: ChildId,

    pub route: RouteId,

    pub request: RequestId,

    pub kind: ResourceKind,

    pub frame_origin: String,

    pub main_frame_origin: String,

    pub allow_download: bool,

    pub wire: WireRequest,

}

// Control operations decoded from the child side of the boundary.
pub enum ProxyCommand {

    Start(StartRequest),

    Read {
        key: RequestKey,
        bytes_to_read: usize,
    },

    End {
        key: RequestKey,
        status: RequestStatus,
    },

    DownloadInHost {
        key: RequestKey,
    },

    // Cancel everything the child has outstanding, sent on disconnect.
    StopAll {
        child: ChildId,
    },

    Pause {
        key: RequestKey,
    },

    Resume {
        key: RequestKey,
    },

    // The child acknowledged one data message.
    DataAck {
        key: RequestKey,
    },

    // The child acknowledged the in-flight upload progress notification.
    UploadProgressAck {
        key: RequestKey,
    },

    GetCookies {
        child: ChildId,
        url: Url,
        cookie_id: u32,
    },

    SetCookies {
        child: ChildId,
        url: Url,
        cookie: String,
    },

    Shutdown,

}

// Operations forwarded to the execution backend. Fire and forget, completion
// comes back on the event channel.
pub enum BackendCommand {

    Start {
        key: RequestKey,
        request: TransferableRequest,
    },

    Read {
        key: RequestKey,
        bytes_to_read: usize,
    },

    End {
        key: RequestKey,
        status: RequestStatus,
    },

    Download {
        key: RequestKey,
    },

    StopAll {
        child: ChildId,
    },

}

// Reports from the execution backend.
pub enum BackendEvent {

    ResponseStarted {
        key: RequestKey,
        head: ResponseHead,
    },

    ReadComplete {
        key: RequestKey,
        data: Bytes,
    },

    ResponseEnd {
        key: RequestKey,
        status: RequestStatus,
    },

    UploadProgress {
        key: RequestKey,
        position: u64,
    },

}

// Host cookie policy. The defaults decline, telling the transport to run its
// regular same-process path instead.
pub trait CookieHost: Send {

    fn get_cookies(&mut self, _child: ChildId, _url: &Url, _cookie_id: u32) -> Option<String> {
        None
    }

    fn set_cookies(&mut self, _child: ChildId, _url: &Url, _cookie: &str) -> bool {
        false
    }
}

// Policy used when the host installs none.
pub struct DefaultCookieHost;

impl CookieHost for DefaultCookieHost {}

pub fn spawn_proxy(
    config: Config,
    backend_tx: BackendTx,
    relay_tx: RelayTx,
    cookie_host: Box<dyn CookieHost>,
) -> (JoinHandle<()>, ProxyTx, BackendEventTx) {

    let (proxy_tx, proxy_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut proxy = CrossProcessRequestProxy::new(
        config,
        proxy_rx,
        event_rx,
        backend_tx,
        relay_tx,
        cookie_host,
    );
    let handle = task::spawn(async move {
        if let Err(e) = proxy.run().await {
            tracing::error!("proxy runtime error: {:?}", e);
        }
    }.instrument(tracing::info_span!("proxy")));

    (handle, proxy_tx, event_tx)
}
