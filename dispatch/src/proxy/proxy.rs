use std::time::Instant;
use bytes::Bytes;
use tokio::time;
use crate::{
    request::DescriptorParams,
    table::RequestDispatchTable,
    wire::TransferableRequest,
    RelayEvent,
};
use super::*;

// Control side of the process boundary. Owns the dispatch table, translates
// child control operations into descriptor and backend operations, and
// relays backend reports outward. Nothing here blocks on the backend.
pub struct CrossProcessRequestProxy {

    // All live request bookkeeping, mutated only from this task.
    table: RequestDispatchTable,

    proxy_rx: ProxyRx,

    // Reports back from the execution backend.
    event_rx: BackendEventRx,

    backend_tx: BackendTx,

    // Events relayed outward to the child-facing transport.
    relay_tx: RelayTx,

    cookie_host: Box<dyn CookieHost>,

    config: Config,

}

impl CrossProcessRequestProxy {

    pub(super) fn new(
        config: Config,
        proxy_rx: ProxyRx,
        event_rx: BackendEventRx,
        backend_tx: BackendTx,
        relay_tx: RelayTx,
        cookie_host: Box<dyn CookieHost>,
    ) -> CrossProcessRequestProxy {
        CrossProcessRequestProxy {
            table: RequestDispatchTable::new(config.max_cost_per_child),
            proxy_rx,
            event_rx,
            backend_tx,
            relay_tx,
            cookie_host,
            config,
        }
    }

    #[tracing::instrument(skip_all, name = "proxy")]
    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = time::interval(time::Duration::from_secs(1));

        loop { tokio::select! {

            Some(cmd) = self.proxy_rx.recv() => {
                match cmd {

                    ProxyCommand::Start(start) => self.handle_start(start)?,

                    ProxyCommand::Read { key, bytes_to_read } => self.handle_read(key, bytes_to_read)?,

                    ProxyCommand::End { key, status } => self.handle_end(key, status)?,

                    ProxyCommand::DownloadInHost { key } => self.handle_download(key)?,

                    ProxyCommand::StopAll { child } => self.handle_stop_all(child)?,

                    ProxyCommand::Pause { key } => self.handle_pause(key),

                    ProxyCommand::Resume { key } => self.handle_resume(key)?,

                    ProxyCommand::DataAck { key } => self.handle_data_ack(key)?,

                    ProxyCommand::UploadProgressAck { key } => self.handle_upload_ack(key)?,

                    ProxyCommand::GetCookies { child, url, cookie_id } => self.handle_get_cookies(child, url, cookie_id)?,

                    ProxyCommand::SetCookies { child, url, cookie } => self.handle_set_cookies(child, url, cookie)?,

                    ProxyCommand::Shutdown => {
                        tracing::info!("proxy shutdown");
                        break;
                    },
                }
            }

            Some(event) = self.event_rx.recv() => {
                match event {

                    BackendEvent::ResponseStarted { key, head } => self.on_response_started(key, head)?,

                    BackendEvent::ReadComplete { key, data } => self.on_read_complete(key, data)?,

                    BackendEvent::ResponseEnd { key, status } => self.on_response_end(key, status)?,

                    BackendEvent::UploadProgress { key, position } => self.on_upload_progress(key, position)?,

                }
            }

            _ = ticker.tick() => self.tick()?,

        }}

        Ok(())
    }

    fn handle_start(&mut self, start: StartRequest) -> Result<()> {

        let key = RequestKey { child: start.child, request: start.request };
        let params = DescriptorParams {
            child_id: start.child,
            route_id: start.route,
            request_id: start.request,
            frame_origin: start.frame_origin,
            main_frame_origin: start.main_frame_origin,
            kind: start.kind,
            upload_size: start.wire.upload_size(),
            allow_download: start.allow_download,
        };

        if let Err(e) = self.table.admit(params, &start.wire.head) {
            tracing::warn!("request refused: {}", e);
            self.relay_tx.send(RelayEvent::RequestRefused { key, reason: e.to_string() })?;
            return Ok(());
        }

        // The upload body must be solely owned before it crosses to the
        // backend thread. A violation refuses the request, not the process.
        let request = match TransferableRequest::take(start.wire) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("upload body for {:?} still shared: {}", key, e);
                self.table.remove(key).ok();
                self.relay_tx.send(RelayEvent::RequestRefused { key, reason: e.to_string() })?;
                return Ok(());
            },
        };

        tracing::info!("start {:?}: {} {}", key, request.head.method, request.head.url);
        self.backend_tx.send(BackendCommand::Start { key, request })?;
        Ok(())
    }

    fn handle_read(&mut self, key: RequestKey, bytes_to_read: usize) -> Result<()> {
        match self.table.get_mut(key) {
            Some(descriptor) => {
                if descriptor.is_terminal() {
                    tracing::warn!("read for terminal request {:?}", key);
                    return Ok(());
                }
                if descriptor.is_paused() {
                    descriptor.defer_read(bytes_to_read);
                    return Ok(());
                }
                descriptor.mark_started_reading();
            },
            None => {
                tracing::trace!("read for unknown request {:?}", key);
                return Ok(());
            },
        }
        self.backend_tx.send(BackendCommand::Read { key, bytes_to_read })?;
        Ok(())
    }

    fn handle_end(&mut self, key: RequestKey, status: RequestStatus) -> Result<()> {
        if let Some(descriptor) = self.table.get_mut(key) {
            // Removal happens when the backend reports the response end.
            descriptor.mark_terminal();
            self.backend_tx.send(BackendCommand::End { key, status })?;
        } else {
            tracing::trace!("end for unknown request {:?}", key);
        }
        Ok(())
    }

    fn handle_download(&mut self, key: RequestKey) -> Result<()> {
        match self.table.get_mut(key) {
            Some(descriptor) => {
                if !descriptor.allow_download() {
                    tracing::warn!("download refused for {:?}", key);
                    self.relay_tx.send(RelayEvent::RequestRefused {
                        key,
                        reason: "downloads are allowed only for top level requests".into(),
                    })?;
                    return Ok(());
                }
                descriptor.mark_download();
            },
            None => {
                tracing::trace!("download for unknown request {:?}", key);
                return Ok(());
            },
        }
        self.backend_tx.send(BackendCommand::Download { key })?;
        Ok(())
    }

    fn handle_stop_all(&mut self, child: ChildId) -> Result<()> {
        let removed = self.table.cancel_all(child);
        tracing::info!("cancelled {} requests for child {}", removed, child);
        self.backend_tx.send(BackendCommand::StopAll { child })?;
        Ok(())
    }

    fn handle_pause(&mut self, key: RequestKey) {
        match self.table.get_mut(key) {
            Some(descriptor) => descriptor.pause(),
            None => tracing::trace!("pause for unknown request {:?}", key),
        }
    }

    fn handle_resume(&mut self, key: RequestKey) -> Result<()> {
        let unblocked = match self.table.get_mut(key) {
            Some(descriptor) => descriptor.resume(),
            None => {
                tracing::trace!("resume for unknown request {:?}", key);
                return Ok(());
            },
        };
        if unblocked {
            self.flush_deferred(key)?;
        }
        Ok(())
    }

    fn handle_data_ack(&mut self, key: RequestKey) -> Result<()> {
        let result = match self.table.get_mut(key) {
            Some(descriptor) => descriptor.decrement_pending_data(),
            None => {
                tracing::trace!("data ack for unknown request {:?}", key);
                return Ok(());
            },
        };
        if let Err(e) = result {
            return self.teardown(key, e);
        }

        // Dropping back under the window releases the backpressure pause.
        let unblocked = match self.table.get_mut(key) {
            Some(descriptor) => {
                descriptor.pending_data_count() + 1 == self.config.max_pending_data
                    && descriptor.resume()
            },
            None => false,
        };
        if unblocked {
            self.flush_deferred(key)?;
        }
        Ok(())
    }

    fn handle_upload_ack(&mut self, key: RequestKey) -> Result<()> {
        let result = match self.table.get_mut(key) {
            Some(descriptor) => descriptor.acknowledge_upload_progress(),
            None => {
                tracing::trace!("upload ack for unknown request {:?}", key);
                return Ok(());
            },
        };
        if let Err(e) = result {
            return self.teardown(key, e);
        }
        Ok(())
    }

    fn handle_get_cookies(&mut self, child: ChildId, url: Url, cookie_id: u32) -> Result<()> {
        match self.cookie_host.get_cookies(child, &url, cookie_id) {
            Some(cookies) => {
                self.relay_tx.send(RelayEvent::CookiesRead { child, cookie_id, cookies })?;
            },
            None => {
                self.relay_tx.send(RelayEvent::CookieFallback { child, url, cookie_id })?;
            },
        }
        Ok(())
    }

    fn handle_set_cookies(&mut self, child: ChildId, url: Url, cookie: String) -> Result<()> {
        if !self.cookie_host.set_cookies(child, &url, &cookie) {
            self.relay_tx.send(RelayEvent::SetCookieFallback { child, url, cookie })?;
        }
        Ok(())
    }

    fn on_response_started(&mut self, key: RequestKey, head: ResponseHead) -> Result<()> {
        let result = match self.table.get_mut(key) {
            Some(descriptor) => {
                let route = descriptor.route_id();
                descriptor.mark_responded().map(|_| route)
            },
            None => {
                // Cancelled under the callback, drop.
                tracing::trace!("response for unknown request {:?}", key);
                return Ok(());
            },
        };
        match result {
            Ok(route) => {
                self.relay_tx.send(RelayEvent::ResponseStarted { key, route, head })?;
                Ok(())
            },
            Err(e) => self.teardown(key, e),
        }
    }

    fn on_read_complete(&mut self, key: RequestKey, data: Bytes) -> Result<()> {
        match self.table.get_mut(key) {
            Some(descriptor) => {
                if descriptor.is_paused() {
                    descriptor.defer_chunk(data);
                    return Ok(());
                }
            },
            None => {
                tracing::trace!("data for unknown request {:?}", key);
                return Ok(());
            },
        }
        self.relay_data(key, data)
    }

    fn on_response_end(&mut self, key: RequestKey, status: RequestStatus) -> Result<()> {
        match self.table.remove(key) {
            Ok(_) => self.relay_tx.send(RelayEvent::RequestComplete { key, status })?,
            // Late completion after a cancel, drop.
            Err(_) => tracing::trace!("completion for unknown request {:?}", key),
        }
        Ok(())
    }

    fn on_upload_progress(&mut self, key: RequestKey, position: u64) -> Result<()> {
        let accepted = match self.table.get_mut(key) {
            Some(descriptor) => {
                if descriptor.record_upload_progress(position, Instant::now()) {
                    Some((descriptor.last_upload_position(), descriptor.upload_size()))
                } else {
                    None
                }
            },
            None => {
                tracing::trace!("upload progress for unknown request {:?}", key);
                return Ok(());
            },
        };
        if let Some((position, size)) = accepted {
            self.relay_tx.send(RelayEvent::UploadProgress { key, position, size })?;
        }
        Ok(())
    }

    // Deliver data held back whilst the request was paused, then any read
    // the child asked for in the meantime.
    fn flush_deferred(&mut self, key: RequestKey) -> Result<()> {
        let (chunks, deferred_read) = match self.table.get_mut(key) {
            Some(descriptor) => (descriptor.take_deferred_chunks(), descriptor.take_deferred_read()),
            None => return Ok(()),
        };
        for data in chunks {
            // Relaying the backlog can refill the window and pause again,
            // anything left goes back on the deferred list.
            match self.table.get_mut(key) {
                Some(descriptor) if descriptor.is_paused() => descriptor.defer_chunk(data),
                Some(_) => self.relay_data(key, data)?,
                None => return Ok(()),
            }
        }
        if let Some(bytes_to_read) = deferred_read {
            if let Some(descriptor) = self.table.get_mut(key) {
                if !descriptor.is_paused() {
                    descriptor.mark_started_reading();
                    self.backend_tx.send(BackendCommand::Read { key, bytes_to_read })?;
                } else {
                    // Relaying the backlog refilled the window.
                    descriptor.defer_read(bytes_to_read);
                }
            }
        }
        Ok(())
    }

    // Relay one data chunk toward the child, counting it against the flow
    // control window. Hitting the window pauses the request until acks
    // drain it.
    fn relay_data(&mut self, key: RequestKey, data: Bytes) -> Result<()> {
        let paused = match self.table.get_mut(key) {
            Some(descriptor) => {
                descriptor.increment_pending_data();
                if descriptor.pending_data_count() >= self.config.max_pending_data {
                    descriptor.pause();
                    true
                } else {
                    false
                }
            },
            None => return Ok(()),
        };
        self.relay_tx.send(RelayEvent::DataReceived { key, data })?;
        if paused {
            tracing::debug!("pending data window full, paused {:?}", key);
        }
        Ok(())
    }

    // A desynchronized request is torn down as an end with a failed status
    // rather than left inconsistent.
    fn teardown(&mut self, key: RequestKey, error: ProtocolError) -> Result<()> {
        tracing::error!("protocol desync on {:?}: {}", key, error);
        if self.table.remove(key).is_ok() {
            let status = RequestStatus::Failed(error.to_string());
            self.backend_tx.send(BackendCommand::End { key, status: status.clone() })?;
            self.relay_tx.send(RelayEvent::RequestComplete { key, status })?;
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        self.relay_tx.send(RelayEvent::Stats(self.table.stats()))?;
        Ok(())
    }
}
