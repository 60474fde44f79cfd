//! Provides the HTTP transport adapter.
//!
//! The URL shape is `{base}{base_path}{namespace}/{key}` with both segments
//! percent-encoded and `/_cache/` as the default base path. The
//! [serve](serve) endpoint answers:
//!
//! * requests outside the base path or with a malformed remainder -> 400,
//! * an unknown namespace -> 404,
//! * a failing origin loader -> 500,
//! * success -> 200 with `Content-Type: application/octet-stream` and the raw
//!   value bytes.
//!
//! The matching [HttpPeer](HttpPeer) client treats every non-200 response as a
//! peer error (which the namespace then handles by falling back to its origin).
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::cache::Namespace;
use crate::peers::CachePeer;
use crate::platform::Platform;

/// The default base path under which cache lookups are served.
pub const DEFAULT_BASE_PATH: &str = "/_cache/";

/// The characters which have to be escaped within a path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// A peer client fetching values via HTTP.
///
/// # Examples
/// ```no_run
/// # use callisto::peers::CachePeer;
/// # use callisto::transport::http::HttpPeer;
/// # #[tokio::main]
/// # async fn main() {
/// let peer = HttpPeer::new("http://10.0.0.3:8080").with_name("cache-3");
///
/// let value = peer.fetch("assets", "logo.png").await.unwrap();
/// # }
/// ```
pub struct HttpPeer {
    base_url: String,
    base_path: String,
    name: String,
    client: reqwest::Client,
}

impl HttpPeer {
    /// Creates a peer client for the given base URL (scheme, host and port).
    ///
    /// Unless overridden, the base path defaults to
    /// [DEFAULT_BASE_PATH](DEFAULT_BASE_PATH) and the member name to the base URL
    /// plus the base path.
    pub fn new(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_owned();
        HttpPeer {
            name: format!("{}{}", base_url, DEFAULT_BASE_PATH),
            base_url,
            base_path: DEFAULT_BASE_PATH.to_owned(),
            client: reqwest::Client::new(),
        }
    }

    /// Specifies the base path under which the remote node serves lookups.
    pub fn with_base_path(mut self, base_path: &str) -> Self {
        self.base_path = base_path.to_owned();
        self.name = format!("{}{}", self.base_url, self.base_path);
        self
    }

    /// Specifies the member name under which this peer appears on the ring.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }
}

#[async_trait]
impl CachePeer for HttpPeer {
    async fn fetch(&self, namespace: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        if namespace.is_empty() || key.is_empty() {
            anyhow::bail!("A namespace and a key are required");
        }

        let url = format!(
            "{}{}{}/{}",
            self.base_url,
            self.base_path,
            utf8_percent_encode(namespace, SEGMENT),
            utf8_percent_encode(key, SEGMENT)
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if response.status() != reqwest::StatusCode::OK {
            anyhow::bail!("Remote server error: {} responded {}", url, response.status());
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read the response body of {}", url))?;

        Ok(body.to_vec())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> &str {
        "http"
    }
}

/// Serves cache lookups via HTTP on the given address until the platform
/// terminates.
///
/// This is the server-side counterpart of [HttpPeer](HttpPeer). Note that in
/// contrast to the TCP server this endpoint is optional - it is only started if
/// the host asks for it (see the `callisto-io` binary, which reads `http.port`
/// from the config).
pub async fn serve(
    platform: Arc<Platform>,
    address: &str,
    base_path: &str,
) -> anyhow::Result<()> {
    let address: SocketAddr = address
        .parse()
        .with_context(|| format!("Cannot parse HTTP address: {}", address))?;
    let base_path = base_path.to_owned();

    let make_service = make_service_fn(move |_connection| {
        let base_path = base_path.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                handle_request(base_path.clone(), request)
            }))
        }
    });

    let shutdown_platform = platform.clone();
    let server = hyper::Server::try_bind(&address)
        .with_context(|| format!("Cannot bind HTTP endpoint to {}", address))?
        .serve(make_service)
        .with_graceful_shutdown(async move {
            while shutdown_platform.is_running() {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        });

    log::info!("Opened HTTP endpoint on {}...", address);
    server.await.context("The HTTP endpoint failed")?;
    log::info!("Closed HTTP endpoint on {}.", address);

    Ok(())
}

/// Handles a single HTTP request.
async fn handle_request(
    base_path: String,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if request.method() != &Method::GET {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "Only GET is supported",
        ));
    }

    let path = request.uri().path().to_owned();
    if !path.starts_with(&base_path) {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            &format!("Expected a path of the form {}namespace/key", base_path),
        ));
    }

    // The remainder must split into exactly two non-empty segments...
    let segments: Vec<&str> = path[base_path.len()..].split('/').collect();
    if segments.len() != 2 || segments[0].is_empty() || segments[1].is_empty() {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            &format!("Expected a path of the form {}namespace/key", base_path),
        ));
    }

    let (namespace, key) = match (
        percent_decode_str(segments[0]).decode_utf8(),
        percent_decode_str(segments[1]).decode_utf8(),
    ) {
        (Ok(namespace), Ok(key)) => (namespace.into_owned(), key.into_owned()),
        _ => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                "Namespace and key must be valid percent-encoded UTF-8",
            ));
        }
    };

    let instance = match Namespace::find(&namespace) {
        Some(instance) => instance,
        None => {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                &format!("No such namespace: {}", namespace),
            ));
        }
    };

    match instance.get(&key).await {
        Ok(view) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/octet-stream")
            .body(Body::from(view.to_bytes()))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding"))),
        Err(error) => Ok(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("{:#}", error),
        )),
    }
}

/// Builds a plain text error response.
fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_owned()));
    *response.status_mut() = status;
    response
}
