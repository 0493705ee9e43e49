//! Admin HTTP surface: health, snapshot version, endpoint queries, metrics

use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode, Uri,
};
use hyper_util::rt::tokio::TokioIo;
use reqwest::Url;
use router_api::TagSet;
use router_core::{Discovery, Endpoint};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    version: u64,
}

#[derive(Serialize)]
struct VersionBody {
    version: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointsBody<'a> {
    version: u64,
    service: &'a str,
    tags: &'a TagSet,
    endpoints: Vec<Endpoint>,
}

/// AdminServer answers read-only queries against a running [`Discovery`].
pub struct AdminServer {
    discovery: Arc<Discovery>,
}

impl AdminServer {
    pub fn new(discovery: Arc<Discovery>) -> Self {
        Self { discovery }
    }

    /// Accept connections on `listener` until `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("Admin server listening on {}", addr),
            Err(e) => warn!("Admin listener has no local address: {}", e),
        }

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Error accepting admin connection: {}", e);
                        continue;
                    }
                },
            };
            let io = TokioIo::new(stream);
            let server = Arc::clone(&self);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.handle(req.method(), req.uri())) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving admin connection from {}: {}", peer_addr, e);
                }
            });
        }

        info!("Admin server stopped");
    }

    /// Route one request.
    pub fn handle(&self, method: &Method, uri: &Uri) -> Response<Full<Bytes>> {
        let path = uri.path();
        debug!("{} {}", method, path);

        let known = matches!(path, "/healthz" | "/v1/version" | "/v1/endpoints" | "/metrics");
        if !known {
            return not_found_response(path);
        }
        if method != Method::GET {
            return method_not_allowed_response(method);
        }

        match path {
            "/healthz" => self.health(),
            "/v1/version" => json_response(
                StatusCode::OK,
                &VersionBody {
                    version: self.discovery.current_version(),
                },
            ),
            "/v1/endpoints" => self.endpoints(uri.query().unwrap_or("")),
            _ => self.metrics(),
        }
    }

    /// Always 200: a degraded daemon keeps serving its last snapshot.
    fn health(&self) -> Response<Full<Bytes>> {
        let status = if self.discovery.is_degraded() {
            "degraded"
        } else {
            "ok"
        };
        json_response(
            StatusCode::OK,
            &HealthBody {
                status,
                version: self.discovery.current_version(),
            },
        )
    }

    fn endpoints(&self, query: &str) -> Response<Full<Bytes>> {
        let params = match parse_endpoints_query(query) {
            Ok(params) => params,
            Err(reason) => return bad_request_response(&reason),
        };

        // One snapshot for both the version and the selection.
        let snapshot = self.discovery.snapshot();
        let endpoints = router_core::selector::select(&snapshot, &params.service, &params.tags);
        json_response(
            StatusCode::OK,
            &EndpointsBody {
                version: snapshot.version(),
                service: &params.service,
                tags: &params.tags,
                endpoints,
            },
        )
    }

    fn metrics(&self) -> Response<Full<Bytes>> {
        match self.discovery.metrics().gather() {
            Ok(text) => {
                let mut response = text_response(StatusCode::OK, text);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to gather metrics\n",
                )
            }
        }
    }
}

#[derive(Debug, PartialEq)]
struct EndpointsQuery {
    service: String,
    tags: TagSet,
}

/// `service=NAME&tags=a,b`; `tags` may repeat and is merged.
fn parse_endpoints_query(query: &str) -> Result<EndpointsQuery, String> {
    let url = Url::parse(&format!("http://admin.local/?{}", query))
        .map_err(|e| format!("invalid query: {}", e))?;

    let mut service = None;
    let mut tags = TagSet::new();
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "service" => service = Some(value.trim().to_string()),
            "tags" => {
                for tag in TagSet::parse_list(&value).iter() {
                    tags.insert(tag);
                }
            }
            _ => {}
        }
    }

    match service {
        Some(service) if !service.is_empty() => Ok(EndpointsQuery { service, tags }),
        _ => Err("missing service parameter".to_string()),
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal Server Error: {}\n", e),
        ),
    }
}

/// Create a 400 Bad Request response
fn bad_request_response(reason: &str) -> Response<Full<Bytes>> {
    text_response(StatusCode::BAD_REQUEST, format!("Bad Request: {}\n", reason))
}

/// Create a 404 Not Found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, format!("Not Found: {}\n", path))
}

fn method_not_allowed_response(method: &Method) -> Response<Full<Bytes>> {
    let mut response = text_response(
        StatusCode::METHOD_NOT_ALLOWED,
        format!("Method Not Allowed: {}\n", method),
    );
    response
        .headers_mut()
        .insert(hyper::header::ALLOW, HeaderValue::from_static("GET"));
    response
}
