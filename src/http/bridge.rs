//! HTTP/1.1 server forwarding requests to connections.
//!
//! ```text
//!   GET /connections/osc-1/status?x=1
//!        │
//!        ▼
//!   handler("osc-1").handle_http_request({ path: "/status", query: {x: 1} })
//!        │
//!        ├─ reply        ──► status, headers, body from the connection
//!        ├─ unavailable  ──► 404
//!        ├─ no handler   ──► 404
//!        └─ timeout      ──► 504
//! ```

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use super::error::HttpBridgeError;
use crate::host::{ConnectionHost, HandlerError};
use crate::ipc::protocol::{HttpRequestWire, HttpResponseWire};

const PREFIX: &str = "/connections/";

type BridgeBody = BoxBody<Bytes, hyper::Error>;

/// Split `/connections/{id}/{rest}` into the id and `/{rest}`.
///
/// Returns `None` for paths outside the prefix or without an id.
pub fn split_connection_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix(PREFIX)?;
    let (id, tail) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if id.is_empty() {
        return None;
    }
    Some((id, tail))
}

/// Decode a raw query string. Later duplicates win.
fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .into_owned()
        .collect()
}

fn empty_body() -> BridgeBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full_body(content: String) -> BridgeBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode, message: &str) -> Response<BridgeBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response
}

fn into_response(reply: HttpResponseWire) -> Response<BridgeBody> {
    let body = match reply.body {
        Some(body) => full_body(body),
        None => empty_body(),
    };
    let mut response = Response::new(body);
    *response.status_mut() =
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in reply.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => debug!("Dropping invalid response header '{}'", name),
        }
    }
    response
}

/// HTTP server in front of the connection host.
pub struct HttpBridge {
    listen: SocketAddr,
    host: Arc<ConnectionHost>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HttpBridge {
    /// Create a bridge.
    ///
    /// # Arguments
    ///
    /// * `listen` - Address to listen on.
    /// * `host` - Where connection handlers are looked up.
    /// * `shutdown_rx` - Stops the accept loop when set to true.
    pub fn new(listen: SocketAddr, host: Arc<ConnectionHost>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            listen,
            host,
            shutdown_rx,
        }
    }

    /// Bind and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`HttpBridgeError::Bind`] when the address cannot be bound.
    pub async fn run(self) -> Result<(), HttpBridgeError> {
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|source| HttpBridgeError::Bind {
                addr: self.listen,
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpBridgeError> {
        info!("HTTP bridge listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("HTTP connection from {}", peer);
                            spawn_connection(stream, self.host.clone());
                        }
                        Err(e) => warn!("Failed to accept HTTP connection: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("HTTP bridge shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

fn spawn_connection(stream: TcpStream, host: Arc<ConnectionHost>) {
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let host = host.clone();
            async move { route(req, &host).await }
        });
        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            debug!("HTTP connection ended: {}", HttpBridgeError::from(e));
        }
    });
}

/// Forward one request to its connection.
async fn route(req: Request<Incoming>, host: &ConnectionHost) -> Result<Response<BridgeBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let Some((connection_id, tail)) = split_connection_path(&path) else {
        return Ok(status_response(StatusCode::NOT_FOUND, "Not found"));
    };
    let Some(handler) = host.get_handler(connection_id) else {
        debug!("HTTP request for unavailable connection {}", connection_id);
        return Ok(status_response(StatusCode::NOT_FOUND, "Connection unavailable"));
    };

    let method = req.method().to_string();
    let query = parse_query(req.uri().query());
    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    let bytes = req.into_body().collect().await?.to_bytes();
    let body = (!bytes.is_empty()).then(|| String::from_utf8_lossy(&bytes).into_owned());

    let request = HttpRequestWire {
        base_url: format!("{}{}", PREFIX, connection_id),
        path: tail.to_string(),
        method,
        query,
        headers,
        body,
    };

    match handler.handle_http_request(request).await {
        Ok(reply) => Ok(into_response(reply)),
        Err(HandlerError::NoHttpHandler(_)) => Ok(status_response(
            StatusCode::NOT_FOUND,
            "Connection has no HTTP handler",
        )),
        Err(e) if e.is_timeout() => {
            warn!("HTTP request to {} timed out", connection_id);
            Ok(status_response(StatusCode::GATEWAY_TIMEOUT, "Connection timed out"))
        }
        Err(e) => {
            warn!("HTTP request to {} failed: {}", connection_id, e);
            Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR, "Connection error"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{MemoryConnectionRegistry, StaticModuleCatalog};
    use crate::definitions::DefinitionsRegistry;
    use crate::host::osc::UdpOscSender;
    use crate::host::{HostConfig, HostServices, MemoryActionRecorder, StatusTracker};
    use crate::variables::MemoryVariables;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_split_connection_path() {
        assert_eq!(split_connection_path("/connections/osc-1/a/b"), Some(("osc-1", "/a/b")));
        assert_eq!(split_connection_path("/connections/osc-1"), Some(("osc-1", "/")));
        assert_eq!(split_connection_path("/connections/osc-1/"), Some(("osc-1", "/")));
        assert_eq!(split_connection_path("/connections/"), None);
        assert_eq!(split_connection_path("/other/osc-1"), None);
    }

    #[test]
    fn test_parse_query() {
        let query = parse_query(Some("a=1&b=&flag"));
        assert_eq!(query["a"], "1");
        assert_eq!(query["b"], "");
        assert_eq!(query["flag"], "");
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_parse_query_decodes_pairs() {
        let query = parse_query(Some("name=a%20b&q=x+y&caf%C3%A9=%2Fpath%3F"));
        assert_eq!(query["name"], "a b");
        assert_eq!(query["q"], "x y");
        assert_eq!(query["café"], "/path?");
    }

    #[test]
    fn test_reply_headers_and_status() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        headers.insert("bad header".to_string(), "x".to_string());
        let response = into_response(HttpResponseWire {
            status: 201,
            headers,
            body: Some("ok".to_string()),
        });
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.headers().len(), 1);

        let response = into_response(HttpResponseWire {
            status: 42,
            headers: HashMap::new(),
            body: None,
        });
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unavailable_connection_is_404() {
        let services = HostServices {
            registry: Arc::new(MemoryConnectionRegistry::new([])),
            modules: Arc::new(StaticModuleCatalog::default()),
            definitions: Arc::new(DefinitionsRegistry::new()),
            variables: Arc::new(MemoryVariables::new()),
            status: Arc::new(StatusTracker::new()),
            recorder: Arc::new(MemoryActionRecorder::new()),
            osc: Arc::new(UdpOscSender),
        };
        let host = ConnectionHost::new(HostConfig::default(), services);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(HttpBridge::new(addr, host, shutdown_rx).serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /connections/osc-1/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
