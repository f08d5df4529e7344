//! Actix Web endpoint serving the latest published frame.
//!
//! The server runs its own actix system on a dedicated thread so the
//! perception loop and the CLI runtime never share an executor with it.

use std::{io, net::{SocketAddr, TcpListener}, sync::{mpsc, Arc}, thread};

use actix_web::{
    http::header,
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::{Context, Result};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{FramePacket, MjpegSink, PacketSlot, StreamConfig};

const BOUNDARY: &str = "frame";

struct ServerState {
    slot: PacketSlot,
}

/// Running HTTP endpoint. `stop` shuts it down and joins its thread.
pub struct StreamServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Bind the endpoint and return the loop-side sink feeding it. Bind failure is
/// a startup error.
pub fn serve(cfg: &StreamConfig) -> Result<(MjpegSink, StreamServer)> {
    let listener = TcpListener::bind(&cfg.bind)
        .with_context(|| format!("bind stream endpoint {}", cfg.bind))?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let sink = MjpegSink::new(cfg.jpeg_quality);
    let slot = sink.subscribe();
    let name: Arc<str> = Arc::from(cfg.name.as_str());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = mpsc::channel::<io::Result<()>>();

    let route_name = name.clone();
    let handle = thread::Builder::new()
        .name("stream-server".into())
        .spawn(move || {
            let res = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState { slot: slot.clone() }))
                        .route("/", web::get().to(stream_handler))
                        .route("/stream.mjpg", web::get().to(stream_handler))
                        .route(&format!("/{}", route_name), web::get().to(stream_handler))
                        .route("/frame.jpg", web::get().to(frame_handler))
                })
                .workers(1)
                .disable_signals()
                .shutdown_timeout(1)
                .listen(listener);

                let server = match server {
                    Ok(server) => server.run(),
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(());
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(false).await;
                });
                server.await
            });
            if let Err(e) = res {
                error!("stream: http server error: {}", e);
            }
        })
        .context("spawn stream server thread")?;

    ready_rx
        .recv()
        .context("stream server thread exited during startup")?
        .context("start http server")?;

    info!("stream: serving http://{}/{} (also /stream.mjpg, /frame.jpg)", local_addr, name);
    Ok((sink, StreamServer { local_addr, shutdown: Some(shutdown_tx), handle: Some(handle) }))
}

/// Latest frame as a single JPEG; 204 until the loop has published once.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    let latest = state.slot.borrow().clone();
    match latest {
        Some(packet) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .insert_header(("X-Sequence", packet.seq.to_string()))
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// One multipart part per published frame. A slow viewer only ever sees the
/// newest packet, so it skips frames rather than queueing them.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let mut slot = state.slot.clone();
    let body = stream! {
        loop {
            let packet = slot.borrow_and_update().clone();
            if let Some(packet) = packet {
                yield Ok::<Bytes, actix_web::Error>(multipart_part(&packet));
            }
            if slot.changed().await.is_err() {
                // sink dropped: the loop is gone
                break;
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)))
        .streaming(body)
}

pub fn multipart_part(packet: &FramePacket) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Sequence: {}\r\n\r\n",
        BOUNDARY,
        packet.jpeg.len(),
        packet.seq
    );
    let mut payload = Vec::with_capacity(head.len() + packet.jpeg.len() + 2);
    payload.extend_from_slice(head.as_bytes());
    payload.extend_from_slice(&packet.jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}
