use std::time::Instant;
use bytes::Bytes;
use crate::{ChildId, RequestId, RouteId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {

    // More data acks than data messages sent. The peers are desynchronized,
    // the request cannot be left half tracked.
    #[error("pending data count underflow")]
    PendingDataUnderflow,

    #[error("upload progress ack with none outstanding")]
    UnexpectedUploadAck,

    #[error("response started reported twice")]
    DuplicateResponse,

}

// Identifies the kind of resource being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    MainFrame,
    SubFrame,
    Media,
    Other,
}

// Privileged collaborator attached to a request, if any. The descriptor
// records the relation only, never the collaborator's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorKind {
    Login,
    SslAuth,
    CrossSite,
}

// Admission parameters decoded from a child's start message.
#[derive(Debug)]
pub struct DescriptorParams {

    pub child_id: ChildId,

    pub route_id: RouteId,

    pub request_id: RequestId,

    pub frame_origin: String,

    pub main_frame_origin: String,

    pub kind: ResourceKind,

    pub upload_size: u64,

    pub allow_download: bool,

}

// Bookkeeping held for one in-flight request made on behalf of a child
// process.
#[derive(Debug)]
pub struct RequestDescriptor {

    child_id: ChildId,

    // Logical destination within the child that responses route back to.
    route_id: RouteId,

    request_id: RequestId,

    // Security origins of the requesting frame and its main frame. Compared,
    // never parsed.
    frame_origin: String,

    main_frame_origin: String,

    kind: ResourceKind,

    // Data messages sent toward the child without an ack yet.
    pending_data_count: u32,

    // Nesting count of pause requests.
    pause_count: u32,

    // Byte count of the upload body, 0 when there is none.
    upload_size: u64,

    // Offset into the upload the last progress notification covered.
    last_upload_position: u64,

    last_upload_time: Option<Instant>,

    // Set while a progress notification is in flight. Gates sending another.
    upload_ack_outstanding: bool,

    // Amount charged against the owning child's ledger. Set exactly once by
    // the owning table, cleared when the charge is released.
    memory_cost: usize,

    responded: bool,

    started_reading: bool,

    // Bytes held back whilst paused. Zero whenever unpaused.
    paused_read_bytes: usize,

    // Read size received whilst paused, forwarded on resume.
    deferred_read: Option<usize>,

    // Data chunks held back whilst paused, flushed on resume.
    deferred_chunks: Vec<Bytes>,

    is_download: bool,

    allow_download: bool,

    collaborator: Option<CollaboratorKind>,

    terminal: bool,

}

impl RequestDescriptor {

    pub(crate) fn new(params: DescriptorParams) -> RequestDescriptor {
        RequestDescriptor {
            child_id: params.child_id,
            route_id: params.route_id,
            request_id: params.request_id,
            frame_origin: params.frame_origin,
            main_frame_origin: params.main_frame_origin,
            kind: params.kind,
            pending_data_count: 0,
            pause_count: 0,
            upload_size: params.upload_size,
            last_upload_position: 0,
            last_upload_time: None,
            upload_ack_outstanding: false,
            memory_cost: 0,
            responded: false,
            started_reading: false,
            paused_read_bytes: 0,
            deferred_read: None,
            deferred_chunks: Vec::new(),
            is_download: false,
            allow_download: params.allow_download,
            collaborator: None,
            terminal: false,
        }
    }

    pub fn child_id(&self) -> ChildId {
        self.child_id
    }

    pub fn route_id(&self) -> RouteId {
        self.route_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn frame_origin(&self) -> &str {
        &self.frame_origin
    }

    pub fn main_frame_origin(&self) -> &str {
        &self.main_frame_origin
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn pending_data_count(&self) -> u32 {
        self.pending_data_count
    }

    pub fn pause_count(&self) -> u32 {
        self.pause_count
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count > 0
    }

    pub fn upload_size(&self) -> u64 {
        self.upload_size
    }

    pub fn last_upload_position(&self) -> u64 {
        self.last_upload_position
    }

    pub fn last_upload_time(&self) -> Option<Instant> {
        self.last_upload_time
    }

    pub fn upload_ack_outstanding(&self) -> bool {
        self.upload_ack_outstanding
    }

    pub fn memory_cost(&self) -> usize {
        self.memory_cost
    }

    pub fn responded(&self) -> bool {
        self.responded
    }

    pub fn started_reading(&self) -> bool {
        self.started_reading
    }

    pub fn paused_read_bytes(&self) -> usize {
        self.paused_read_bytes
    }

    pub fn is_download(&self) -> bool {
        self.is_download
    }

    pub fn allow_download(&self) -> bool {
        self.allow_download
    }

    pub fn collaborator(&self) -> Option<CollaboratorKind> {
        self.collaborator
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub(crate) fn increment_pending_data(&mut self) {
        self.pending_data_count += 1;
    }

    pub(crate) fn decrement_pending_data(&mut self) -> Result<(), ProtocolError> {
        if self.pending_data_count == 0 {
            return Err(ProtocolError::PendingDataUnderflow);
        }
        self.pending_data_count -= 1;
        Ok(())
    }

    pub(crate) fn pause(&mut self) {
        self.pause_count += 1;
    }

    // Returns true when this call unblocked the request. Resuming an
    // unpaused request is a no-op, call sites resume defensively.
    pub(crate) fn resume(&mut self) -> bool {
        if self.pause_count == 0 {
            return false;
        }
        self.pause_count -= 1;
        self.pause_count == 0
    }

    // Throttled: rejected whilst a prior notification is unacknowledged or
    // when the position has not advanced.
    pub(crate) fn record_upload_progress(&mut self, position: u64, now: Instant) -> bool {
        let position = position.min(self.upload_size);
        if self.upload_ack_outstanding || position <= self.last_upload_position {
            return false;
        }
        self.last_upload_position = position;
        self.last_upload_time = Some(now);
        self.upload_ack_outstanding = true;
        true
    }

    pub(crate) fn acknowledge_upload_progress(&mut self) -> Result<(), ProtocolError> {
        if !self.upload_ack_outstanding {
            return Err(ProtocolError::UnexpectedUploadAck);
        }
        self.upload_ack_outstanding = false;
        Ok(())
    }

    pub(crate) fn mark_responded(&mut self) -> Result<(), ProtocolError> {
        if self.responded {
            return Err(ProtocolError::DuplicateResponse);
        }
        self.responded = true;
        Ok(())
    }

    pub(crate) fn mark_started_reading(&mut self) {
        self.started_reading = true;
    }

    pub(crate) fn mark_download(&mut self) {
        self.is_download = true;
    }

    pub(crate) fn mark_terminal(&mut self) {
        self.terminal = true;
    }

    #[allow(dead_code)]
    pub(crate) fn set_collaborator(&mut self, kind: CollaboratorKind) {
        self.collaborator = Some(kind);
    }

    #[allow(dead_code)]
    pub(crate) fn clear_collaborator(&mut self) {
        self.collaborator = None;
    }

    // Charged once by the owning table on admission.
    pub(crate) fn charge_memory_cost(&mut self, bytes: usize) {
        debug_assert_eq!(self.memory_cost, 0, "memory cost charged twice");
        self.memory_cost = bytes;
    }

    // Returns the amount to credit back to the ledger. Idempotent, a second
    // release returns 0.
    pub(crate) fn release_memory_cost(&mut self) -> usize {
        std::mem::take(&mut self.memory_cost)
    }

    pub(crate) fn defer_read(&mut self, bytes_to_read: usize) {
        self.deferred_read = Some(bytes_to_read);
    }

    pub(crate) fn take_deferred_read(&mut self) -> Option<usize> {
        self.deferred_read.take()
    }

    pub(crate) fn defer_chunk(&mut self, data: Bytes) {
        self.paused_read_bytes += data.len();
        self.deferred_chunks.push(data);
    }

    pub(crate) fn take_deferred_chunks(&mut self) -> Vec<Bytes> {
        self.paused_read_bytes = 0;
        std::mem::take(&mut self.deferred_chunks)
    }
}
