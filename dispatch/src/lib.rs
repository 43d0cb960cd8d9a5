use tokio::sync::mpsc;
use bytes::Bytes;
use url::Url;

mod config;
mod de;
mod request;
mod stats;
mod table;
mod transfer;
mod wire;
mod proxy;

// Identity of a child process on whose behalf requests are made.
pub type ChildId = u32;

// Logical destination within a child that responses route back to.
pub type RouteId = u32;

// Unique per child connection, reusable once the request is destroyed.
pub type RequestId = u32;

// Table key. Request ids are only unique within one child connection, so
// the pair travels everywhere together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub child: ChildId,
    pub request: RequestId,
}

// Messages the child-facing transport expects to relay back.
pub enum RelayEvent {

    ResponseStarted {
        key: RequestKey,
        route: RouteId,
        head: wire::ResponseHead,
    },

    // One data chunk toward the child, acked to keep the window open.
    DataReceived {
        key: RequestKey,
        data: Bytes,
    },

    UploadProgress {
        key: RequestKey,
        position: u64,
        size: u64,
    },

    RequestComplete {
        key: RequestKey,
        status: wire::RequestStatus,
    },

    // Admission failures surfaced to the requesting child.
    RequestRefused {
        key: RequestKey,
        reason: String,
    },

    CookiesRead {
        child: ChildId,
        cookie_id: u32,
        cookies: String,
    },

    // Host policy declined, the transport runs its default path.
    CookieFallback {
        child: ChildId,
        url: Url,
        cookie_id: u32,
    },

    SetCookieFallback {
        child: ChildId,
        url: Url,
        cookie: String,
    },

    // Sent every second with a snapshot of the dispatch table.
    Stats(stats::TableStats),

}

type RelayTx = mpsc::UnboundedSender<RelayEvent>;
pub type RelayRx = mpsc::UnboundedReceiver<RelayEvent>;

use proxy::{ProxyCommand, ProxyTx};

// Re-exports
pub use config::Config;
pub use proxy::{
    BackendCommand, BackendEvent, BackendEventTx, BackendRx, BackendTx, CookieHost,
    DefaultCookieHost, ProxyError, Result, StartRequest,
};
pub use request::{
    CollaboratorKind, DescriptorParams, ProtocolError, RequestDescriptor, ResourceKind,
};
pub use stats::{ChildStats, TableStats};
pub use table::{RequestDispatchTable, TableError};
pub use transfer::{ExclusiveTransferBox, OwnershipViolation};
pub use wire::{
    RequestHead, RequestStatus, ResponseHead, TransferableRequest, UploadBody, WireRequest,
};

pub fn start_proxy(
    config: Option<Config>,
    backend_tx: BackendTx,
    cookie_host: Option<Box<dyn CookieHost>>,
) -> (Handle, RelayRx) {
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let (proxy_handle, proxy_tx, backend_event_tx) = proxy::spawn_proxy(
        config.unwrap_or_default(),
        backend_tx,
        relay_tx,
        cookie_host.unwrap_or_else(|| Box::new(DefaultCookieHost)),
    );
    (
        Handle {
            proxy_tx,
            backend_event_tx,
            proxy_handle,
        },
        relay_rx,
    )
}

// Handle returned to the embedder to drive the proxy.
pub struct Handle {

    proxy_tx: ProxyTx,

    backend_event_tx: BackendEventTx,

    proxy_handle: tokio::task::JoinHandle<()>,

}

impl Handle {

    pub fn start_request(&self, start: StartRequest) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::Start(start))?;
        Ok(())
    }

    pub fn read(&self, key: RequestKey, bytes_to_read: usize) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::Read { key, bytes_to_read })?;
        Ok(())
    }

    pub fn end(&self, key: RequestKey, status: RequestStatus) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::End { key, status })?;
        Ok(())
    }

    pub fn download_in_host(&self, key: RequestKey) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::DownloadInHost { key })?;
        Ok(())
    }

    pub fn stop_all(&self, child: ChildId) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::StopAll { child })?;
        Ok(())
    }

    pub fn pause(&self, key: RequestKey) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::Pause { key })?;
        Ok(())
    }

    pub fn resume(&self, key: RequestKey) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::Resume { key })?;
        Ok(())
    }

    pub fn data_ack(&self, key: RequestKey) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::DataAck { key })?;
        Ok(())
    }

    pub fn upload_progress_ack(&self, key: RequestKey) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::UploadProgressAck { key })?;
        Ok(())
    }

    pub fn get_cookies(&self, child: ChildId, url: Url, cookie_id: u32) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::GetCookies { child, url, cookie_id })?;
        Ok(())
    }

    pub fn set_cookies(&self, child: ChildId, url: Url, cookie: String) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::SetCookies { child, url, cookie })?;
        Ok(())
    }

    // Cloneable sender the execution backend reports completions with.
    pub fn backend_events(&self) -> BackendEventTx {
        self.backend_event_tx.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.proxy_tx.send(ProxyCommand::Shutdown).ok();
        self.proxy_handle.await.map_err(|_| ProxyError::ProxyPanic)?;
        Ok(())
    }
}
