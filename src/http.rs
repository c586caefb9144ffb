//! The Prometheus scrape endpoint.
//!
//! Serves the rendered registry on the configured telemetry path, a small
//! landing page on `/`, and 404 elsewhere.

use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::registry::Registry;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Serves scrape requests until the task is dropped.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>, metrics_path: String) {
    let metrics_path: Arc<str> = metrics_path.into();
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(error) => {
                warn!(%error, "error accepting scrape connection");
                continue;
            }
        };

        let registry = registry.clone();
        let metrics_path = metrics_path.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                let registry = registry.clone();
                let metrics_path = metrics_path.clone();
                async move {
                    Ok::<_, hyper::Error>(handle_request(&registry, &metrics_path, &request))
                }
            });
            if let Err(error) =
                http1::Builder::new().serve_connection(TokioIo::new(stream), service).await
            {
                warn!(%error, "error serving scrape connection");
            }
        });
    }
}

fn handle_request(
    registry: &Registry,
    metrics_path: &str,
    request: &Request<Incoming>,
) -> Response<Full<Bytes>> {
    let path = request.uri().path();
    if path == metrics_path {
        let mut response = Response::new(Full::from(registry.render()));
        response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
        return response;
    }

    if path == "/" {
        let page = format!(
            "<html>\n\
             <head><title>StatsD Exporter</title></head>\n\
             <body>\n\
             <h1>StatsD Exporter</h1>\n\
             <p><a href=\"{metrics_path}\">Metrics</a></p>\n\
             </body>\n\
             </html>"
        );
        let mut response = Response::new(Full::from(page));
        response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        return response;
    }

    let mut response = Response::new(Full::default());
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
