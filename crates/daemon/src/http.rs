use crate::metrics::Metrics;
use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

/// Serve `/metrics` and `/health` on `port` until the task is dropped.
pub async fn serve_metrics(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind metrics endpoint {}", addr))?;

    info!("📊 Metrics endpoint on http://{}/metrics", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = respond(req.uri().path(), &metrics);
                async move { Ok::<_, Infallible>(response) }
            });

            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                error!("Metrics connection from {} failed: {}", peer, e);
            }
        });
    }
}

fn respond(path: &str, metrics: &Metrics) -> Response<String> {
    let (status, body) = match path {
        "/metrics" => (StatusCode::OK, metrics.to_prometheus()),
        "/health" => (StatusCode::OK, "OK".to_string()),
        _ => (StatusCode::NOT_FOUND, "Not Found".to_string()),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    if path == "/metrics" {
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        );
    }
    response
}
