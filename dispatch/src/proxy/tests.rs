use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;
use crate::{
    start_proxy, Config, Handle, RelayEvent, RelayRx, RequestHead, RequestStatus, ResourceKind,
    StartRequest, UploadBody, WireRequest,
};
use super::*;

struct Harness {

    handle: Handle,

    relay_rx: RelayRx,

    // What the proxy forwarded to the execution side.
    backend_rx: BackendRx,

    // Reports completions back to the proxy.
    events: BackendEventTx,

}

fn harness(config: Option<Config>) -> Harness {
    harness_with_cookies(config, None)
}

fn harness_with_cookies(config: Option<Config>, cookies: Option<Box<dyn CookieHost>>) -> Harness {
    let (backend_tx, backend_rx) = mpsc::unbounded_channel();
    let (handle, relay_rx) = start_proxy(config, backend_tx, cookies);
    let events = handle.backend_events();
    Harness {
        handle,
        relay_rx,
        backend_rx,
        events,
    }
}

impl Harness {

    // Next relayed event, skipping the periodic stats snapshots.
    async fn next_relay(&mut self) -> RelayEvent {
        loop {
            match self.relay_rx.recv().await.expect("relay channel closed") {
                RelayEvent::Stats(_) => continue,
                event => return event,
            }
        }
    }

    async fn next_backend(&mut self) -> BackendCommand {
        self.backend_rx.recv().await.expect("backend channel closed")
    }
}

fn start_request(key: RequestKey, upload: Option<Arc<UploadBody>>) -> StartRequest {
    StartRequest {
        child: key.child,
        route: 1,
        request: key.request,
        kind: ResourceKind::SubFrame,
        frame_origin: "http://a.test".into(),
        main_frame_origin: "http://a.test".into(),
        allow_download: false,
        wire: WireRequest {
            head: RequestHead {
                url: Url::parse("http://a.test/resource").unwrap(),
                method: "GET".into(),
                referrer: String::new(),
                extra_headers: String::new(),
            },
            upload,
        },
    }
}

const KEY: RequestKey = RequestKey { child: 3, request: 7 };

#[tokio::test]
async fn test_start_forwards_transferable_request() {
    let mut h = harness(None);
    let body = UploadBody { bytes: vec![9; 256] };
    h.handle
        .start_request(start_request(KEY, Some(Arc::new(body.clone()))))
        .unwrap();

    match h.next_backend().await {
        BackendCommand::Start { key, mut request } => {
            assert_eq!(key, KEY);
            assert_eq!(request.head.url.as_str(), "http://a.test/resource");
            assert_eq!(*request.upload.as_mut().unwrap().get(), body);
        },
        _ => panic!("expected start command"),
    }
}

#[tokio::test]
async fn test_duplicate_request_refused() {
    let mut h = harness(None);
    h.handle.start_request(start_request(KEY, None)).unwrap();
    h.handle.start_request(start_request(KEY, None)).unwrap();

    // First admission reaches the backend, the duplicate is refused.
    match h.next_backend().await {
        BackendCommand::Start { key, .. } => assert_eq!(key, KEY),
        _ => panic!("expected start command"),
    }
    match h.next_relay().await {
        RelayEvent::RequestRefused { key, reason } => {
            assert_eq!(key, KEY);
            assert!(reason.contains("reused"));
        },
        _ => panic!("expected refusal"),
    }
}

#[tokio::test]
async fn test_quota_refusal() {
    let config = Config {
        max_cost_per_child: 5000,
        ..Config::default()
    };
    let mut h = harness(Some(config));

    h.handle.start_request(start_request(KEY, None)).unwrap();
    let second = RequestKey { child: KEY.child, request: 8 };
    h.handle.start_request(start_request(second, None)).unwrap();

    match h.next_backend().await {
        BackendCommand::Start { key, .. } => assert_eq!(key, KEY),
        _ => panic!("expected start command"),
    }
    match h.next_relay().await {
        RelayEvent::RequestRefused { key, reason } => {
            assert_eq!(key, second);
            assert!(reason.contains("budget"));
        },
        _ => panic!("expected refusal"),
    }
}

#[tokio::test]
async fn test_shared_upload_body_refused() {
    let mut h = harness(None);
    let body = Arc::new(UploadBody { bytes: vec![1, 2, 3] });
    let _retained = body.clone();
    h.handle.start_request(start_request(KEY, Some(body))).unwrap();

    match h.next_relay().await {
        RelayEvent::RequestRefused { key, reason } => {
            assert_eq!(key, KEY);
            assert!(reason.contains("owners"));
        },
        _ => panic!("expected refusal"),
    }

    // The failed admission left nothing behind, the id is free again.
    h.handle.start_request(start_request(KEY, None)).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { key, .. } => assert_eq!(key, KEY),
        _ => panic!("expected start command"),
    }
}

#[tokio::test]
async fn test_response_read_ack_complete_flow() {
    let mut h = harness(None);
    h.handle.start_request(start_request(KEY, None)).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { .. } => {},
        _ => panic!("expected start command"),
    }

    h.events.send(BackendEvent::ResponseStarted {
        key: KEY,
        head: ResponseHead {
            mime_type: "text/html".into(),
            headers: "HTTP/1.1 200 OK\r\n\r\n".into(),
            content_length: Some(11),
            last_modified: None,
            redirect_url: None,
            redirect_status: None,
        },
    }).unwrap();
    match h.next_relay().await {
        RelayEvent::ResponseStarted { key, route, head } => {
            assert_eq!(key, KEY);
            assert_eq!(route, 1);
            assert_eq!(head.mime_type, "text/html");
        },
        _ => panic!("expected response started"),
    }

    h.handle.read(KEY, 4096).unwrap();
    match h.next_backend().await {
        BackendCommand::Read { key, bytes_to_read } => {
            assert_eq!(key, KEY);
            assert_eq!(bytes_to_read, 4096);
        },
        _ => panic!("expected read command"),
    }

    h.events.send(BackendEvent::ReadComplete {
        key: KEY,
        data: Bytes::from_static(b"hello world"),
    }).unwrap();
    match h.next_relay().await {
        RelayEvent::DataReceived { key, data } => {
            assert_eq!(key, KEY);
            assert_eq!(&data[..], b"hello world");
        },
        _ => panic!("expected data"),
    }
    h.handle.data_ack(KEY).unwrap();

    h.events.send(BackendEvent::ResponseEnd {
        key: KEY,
        status: RequestStatus::Success,
    }).unwrap();
    match h.next_relay().await {
        RelayEvent::RequestComplete { key, status } => {
            assert_eq!(key, KEY);
            assert_eq!(status, RequestStatus::Success);
        },
        _ => panic!("expected completion"),
    }
}

#[tokio::test]
async fn test_pause_defers_read_and_data() {
    let mut h = harness(None);
    h.handle.start_request(start_request(KEY, None)).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { .. } => {},
        _ => panic!("expected start command"),
    }

    h.handle.pause(KEY).unwrap();
    h.handle.read(KEY, 1024).unwrap();
    h.events.send(BackendEvent::ReadComplete {
        key: KEY,
        data: Bytes::from_static(b"held back"),
    }).unwrap();

    // Fence: the cookie round trip proves the commands above were handled
    // and neither the read nor the data went anywhere.
    h.handle.get_cookies(KEY.child, Url::parse("http://a.test").unwrap(), 1).unwrap();
    match h.next_relay().await {
        RelayEvent::CookieFallback { .. } => {},
        _ => panic!("expected cookie fallback"),
    }
    assert!(h.backend_rx.try_recv().is_err());

    h.handle.resume(KEY).unwrap();
    match h.next_relay().await {
        RelayEvent::DataReceived { key, data } => {
            assert_eq!(key, KEY);
            assert_eq!(&data[..], b"held back");
        },
        _ => panic!("expected deferred data"),
    }
    match h.next_backend().await {
        BackendCommand::Read { key, bytes_to_read } => {
            assert_eq!(key, KEY);
            assert_eq!(bytes_to_read, 1024);
        },
        _ => panic!("expected deferred read"),
    }
}

#[tokio::test]
async fn test_backpressure_pauses_at_window() {
    let config = Config {
        max_pending_data: 2,
        ..Config::default()
    };
    let mut h = harness(Some(config));
    h.handle.start_request(start_request(KEY, None)).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { .. } => {},
        _ => panic!("expected start command"),
    }

    for chunk in [&b"one"[..], b"two", b"three"] {
        h.events.send(BackendEvent::ReadComplete {
            key: KEY,
            data: Bytes::copy_from_slice(chunk),
        }).unwrap();
    }

    // Two chunks fill the window, the third is held back.
    match h.next_relay().await {
        RelayEvent::DataReceived { data, .. } => assert_eq!(&data[..], b"one"),
        _ => panic!("expected data"),
    }
    match h.next_relay().await {
        RelayEvent::DataReceived { data, .. } => assert_eq!(&data[..], b"two"),
        _ => panic!("expected data"),
    }

    // One ack reopens the window and flushes the backlog.
    h.handle.data_ack(KEY).unwrap();
    match h.next_relay().await {
        RelayEvent::DataReceived { data, .. } => assert_eq!(&data[..], b"three"),
        _ => panic!("expected flushed data"),
    }
}

#[tokio::test]
async fn test_stop_all_drops_late_completion() {
    let mut h = harness(None);
    h.handle.start_request(start_request(KEY, None)).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { .. } => {},
        _ => panic!("expected start command"),
    }

    h.handle.stop_all(KEY.child).unwrap();
    match h.next_backend().await {
        BackendCommand::StopAll { child } => assert_eq!(child, KEY.child),
        _ => panic!("expected stop all"),
    }

    // Completion racing the cancel observes the id missing and is dropped.
    h.events.send(BackendEvent::ResponseEnd {
        key: KEY,
        status: RequestStatus::Canceled,
    }).unwrap();

    // The child can admit again after the cancel, and completing the new
    // request is the next thing relayed. Had the dropped completion
    // surfaced, its canceled status would arrive first.
    let second = RequestKey { child: KEY.child, request: 8 };
    h.handle.start_request(start_request(second, None)).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { key, .. } => assert_eq!(key, second),
        _ => panic!("expected start command"),
    }
    h.events.send(BackendEvent::ResponseEnd {
        key: second,
        status: RequestStatus::Success,
    }).unwrap();
    match h.next_relay().await {
        RelayEvent::RequestComplete { key, status } => {
            assert_eq!(key, second);
            assert_eq!(status, RequestStatus::Success);
        },
        _ => panic!("expected completion"),
    }
}

#[tokio::test]
async fn test_upload_progress_throttled_until_ack() {
    let mut h = harness(None);
    let body = Arc::new(UploadBody { bytes: vec![0; 1000] });
    h.handle.start_request(start_request(KEY, Some(body))).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { .. } => {},
        _ => panic!("expected start command"),
    }

    h.events.send(BackendEvent::UploadProgress { key: KEY, position: 200 }).unwrap();
    // Unacked, this one must be swallowed.
    h.events.send(BackendEvent::UploadProgress { key: KEY, position: 250 }).unwrap();

    match h.next_relay().await {
        RelayEvent::UploadProgress { key, position, size } => {
            assert_eq!(key, KEY);
            assert_eq!(position, 200);
            assert_eq!(size, 1000);
        },
        _ => panic!("expected upload progress"),
    }

    h.handle.upload_progress_ack(KEY).unwrap();
    h.events.send(BackendEvent::UploadProgress { key: KEY, position: 300 }).unwrap();
    match h.next_relay().await {
        RelayEvent::UploadProgress { position, .. } => assert_eq!(position, 300),
        _ => panic!("expected upload progress"),
    }
}

#[tokio::test]
async fn test_data_ack_underflow_tears_down() {
    let mut h = harness(None);
    h.handle.start_request(start_request(KEY, None)).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { .. } => {},
        _ => panic!("expected start command"),
    }

    // No data message is outstanding, the ack signals a desync.
    h.handle.data_ack(KEY).unwrap();

    match h.next_backend().await {
        BackendCommand::End { key, status } => {
            assert_eq!(key, KEY);
            assert!(matches!(status, RequestStatus::Failed(_)));
        },
        _ => panic!("expected teardown end"),
    }
    match h.next_relay().await {
        RelayEvent::RequestComplete { key, status } => {
            assert_eq!(key, KEY);
            assert!(matches!(status, RequestStatus::Failed(_)));
        },
        _ => panic!("expected failed completion"),
    }
}

#[tokio::test]
async fn test_end_marks_terminal() {
    let mut h = harness(None);
    h.handle.start_request(start_request(KEY, None)).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { .. } => {},
        _ => panic!("expected start command"),
    }

    h.handle.end(KEY, RequestStatus::Canceled).unwrap();
    match h.next_backend().await {
        BackendCommand::End { key, status } => {
            assert_eq!(key, KEY);
            assert_eq!(status, RequestStatus::Canceled);
        },
        _ => panic!("expected end command"),
    }

    // Reads after the end are ignored.
    h.handle.read(KEY, 512).unwrap();

    h.events.send(BackendEvent::ResponseEnd {
        key: KEY,
        status: RequestStatus::Canceled,
    }).unwrap();
    match h.next_relay().await {
        RelayEvent::RequestComplete { status, .. } => {
            assert_eq!(status, RequestStatus::Canceled);
        },
        _ => panic!("expected completion"),
    }
    assert!(h.backend_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_download_requires_top_level() {
    let mut h = harness(None);

    // SubFrame request, downloads not allowed.
    h.handle.start_request(start_request(KEY, None)).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { .. } => {},
        _ => panic!("expected start command"),
    }
    h.handle.download_in_host(KEY).unwrap();
    match h.next_relay().await {
        RelayEvent::RequestRefused { key, .. } => assert_eq!(key, KEY),
        _ => panic!("expected refusal"),
    }

    // Top level request opts in.
    let top = RequestKey { child: 4, request: 1 };
    let mut start = start_request(top, None);
    start.kind = ResourceKind::MainFrame;
    start.allow_download = true;
    h.handle.start_request(start).unwrap();
    match h.next_backend().await {
        BackendCommand::Start { .. } => {},
        _ => panic!("expected start command"),
    }
    h.handle.download_in_host(top).unwrap();
    match h.next_backend().await {
        BackendCommand::Download { key } => assert_eq!(key, top),
        _ => panic!("expected download command"),
    }
}

struct StaticCookieHost;

impl CookieHost for StaticCookieHost {
    fn get_cookies(&mut self, _child: ChildId, _url: &Url, _cookie_id: u32) -> Option<String> {
        Some("session=abc".into())
    }

    fn set_cookies(&mut self, _child: ChildId, _url: &Url, _cookie: &str) -> bool {
        true
    }
}

#[tokio::test]
async fn test_cookie_default_falls_back() {
    let mut h = harness(None);
    let url = Url::parse("http://a.test/").unwrap();

    h.handle.get_cookies(3, url.clone(), 11).unwrap();
    match h.next_relay().await {
        RelayEvent::CookieFallback { child, cookie_id, .. } => {
            assert_eq!(child, 3);
            assert_eq!(cookie_id, 11);
        },
        _ => panic!("expected cookie fallback"),
    }

    h.handle.set_cookies(3, url, "a=b".into()).unwrap();
    match h.next_relay().await {
        RelayEvent::SetCookieFallback { child, cookie, .. } => {
            assert_eq!(child, 3);
            assert_eq!(cookie, "a=b");
        },
        _ => panic!("expected set cookie fallback"),
    }
}

#[tokio::test]
async fn test_cookie_host_override_handles() {
    let mut h = harness_with_cookies(None, Some(Box::new(StaticCookieHost)));
    let url = Url::parse("http://a.test/").unwrap();

    h.handle.get_cookies(3, url.clone(), 11).unwrap();
    match h.next_relay().await {
        RelayEvent::CookiesRead { child, cookie_id, cookies } => {
            assert_eq!(child, 3);
            assert_eq!(cookie_id, 11);
            assert_eq!(cookies, "session=abc");
        },
        _ => panic!("expected cookies read"),
    }

    // A handled set produces no fallback, the next relay is the fence.
    h.handle.set_cookies(3, url.clone(), "a=b".into()).unwrap();
    h.handle.get_cookies(3, url, 12).unwrap();
    match h.next_relay().await {
        RelayEvent::CookiesRead { cookie_id, .. } => assert_eq!(cookie_id, 12),
        _ => panic!("expected cookies read"),
    }
}

#[tokio::test]
async fn test_shutdown_joins_proxy() {
    let h = harness(None);
    h.handle.shutdown().await.unwrap();
}
