use std::sync::Arc;
use bytes::Bytes;
use dispatch::{
    start_proxy, BackendCommand, BackendEvent, RelayEvent, RequestHead, RequestKey,
    RequestStatus, ResourceKind, ResponseHead, StartRequest, UploadBody, WireRequest,
};
use url::Url;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {

    // Set up logging.
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let (backend_tx, mut backend_rx) = tokio::sync::mpsc::unbounded_channel();
    let (handle, mut relay_rx) = start_proxy(None, backend_tx, None);
    let events = handle.backend_events();

    // Loopback backend: answers every request with a canned response.
    tokio::spawn(async move {
        while let Some(cmd) = backend_rx.recv().await {
            match cmd {
                BackendCommand::Start { key, mut request } => {
                    let upload = request.upload.as_mut().map(|body| body.get().len()).unwrap_or(0);
                    tracing::info!("backend starting {:?}, upload {} bytes", key, upload);
                    events.send(BackendEvent::ResponseStarted {
                        key,
                        head: ResponseHead {
                            mime_type: "text/plain".into(),
                            headers: "HTTP/1.1 200 OK\r\n\r\n".into(),
                            content_length: Some(5),
                            last_modified: None,
                            redirect_url: None,
                            redirect_status: None,
                        },
                    }).ok();
                },
                BackendCommand::Read { key, .. } => {
                    events.send(BackendEvent::ReadComplete {
                        key,
                        data: Bytes::from_static(b"hello"),
                    }).ok();
                    events.send(BackendEvent::ResponseEnd {
                        key,
                        status: RequestStatus::Success,
                    }).ok();
                },
                BackendCommand::End { .. } => {},
                BackendCommand::Download { .. } => {},
                BackendCommand::StopAll { .. } => {},
            }
        }
    });

    let key = RequestKey { child: 1, request: 1 };
    handle.start_request(StartRequest {
        child: key.child,
        route: 1,
        request: key.request,
        kind: ResourceKind::MainFrame,
        frame_origin: "http://example.com".into(),
        main_frame_origin: "http://example.com".into(),
        allow_download: true,
        wire: WireRequest {
            head: RequestHead {
                url: Url::parse("http://example.com/hello")?,
                method: "POST".into(),
                referrer: String::new(),
                extra_headers: String::new(),
            },
            upload: Some(Arc::new(UploadBody { bytes: vec![0; 128] })),
        },
    })?;

    while let Some(event) = relay_rx.recv().await {
        match event {
            RelayEvent::ResponseStarted { key, head, .. } => {
                println!("{:?} responded: {}", key, head.mime_type);
                handle.read(key, 4096)?;
            },
            RelayEvent::DataReceived { key, data } => {
                println!("{:?} data: {:?}", key, data);
                handle.data_ack(key)?;
            },
            RelayEvent::RequestComplete { key, status } => {
                println!("{:?} complete: {:?}", key, status);
                break;
            },
            RelayEvent::RequestRefused { key, reason } => {
                println!("{:?} refused: {}", key, reason);
                break;
            },
            _ => {},
        }
    }

    handle.shutdown().await?;

    Ok(())
}
