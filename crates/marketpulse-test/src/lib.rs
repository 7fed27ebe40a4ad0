//! Helpers for testing the market data services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`MockProvider`], make sure that the provider is held until all requests to
//!    the server have been made. If the server is dropped, the port is closed and all
//!    connections to it will fail. To avoid this, assign it to a variable:
//!    `let provider = MockProvider::new();`.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, OriginalUri, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `marketpulse_service` crate and
///    mutes all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("marketpulse_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Binds the given router to a random local port and serves it in the background.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));

        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A canned response served by the [`MockProvider`].
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: serde_json::Value,
    /// Value of the `Retry-After` header in seconds.
    pub retry_after: Option<u64>,
}

impl Reply {
    /// A `200 OK` reply with the given JSON body.
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            body,
            retry_after: None,
        }
    }

    /// A reply with the given status and an empty JSON object as body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: serde_json::json!({}),
            retry_after: None,
        }
    }

    /// Sets the `Retry-After` header of this reply.
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self.body)).into_response();
        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

#[derive(Clone, Default)]
struct ProviderState {
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    fixed: Arc<Mutex<BTreeMap<String, Reply>>>,
    scripts: Arc<Mutex<BTreeMap<String, VecDeque<Reply>>>>,
}

/// A local HTTP server standing in for an upstream market data provider.
///
/// Every request is counted per full request URI (path and query). Responses under `/json/`
/// are looked up by path (without the `/json/` prefix and without the query string):
///
/// - scripted replies registered with [`script`](Self::script) are served in order, with the
///   last one repeating once the script is exhausted,
/// - otherwise a fixed reply registered with [`set_json`](Self::set_json) or
///   [`set_reply`](Self::set_reply) is served,
/// - otherwise the server responds with `404`.
///
/// Additional routes:
///
/// - `/respond_statuscode/:num/*tail` always responds with the given status code.
/// - `/delay/:time/*path` sleeps for the given humantime duration, then serves `path`.
/// - `/garbage_data/*tail` responds with `200` and a non-JSON body.
pub struct MockProvider {
    server: Server,
    state: ProviderState,
}

async fn count_hits(
    State(state): State<ProviderState>,
    OriginalUri(uri): OriginalUri,
    req: Request,
    next: Next,
) -> Response {
    {
        let mut hits = state.hits.lock().unwrap();
        *hits.entry(uri.to_string()).or_default() += 1;
    }

    next.run(req).await
}

fn lookup_reply(state: &ProviderState, path: &str) -> Reply {
    {
        let mut scripts = state.scripts.lock().unwrap();
        if let Some(script) = scripts.get_mut(path) {
            let reply = match script.len() {
                0 => None,
                1 => script.front().cloned(),
                _ => script.pop_front(),
            };
            if let Some(reply) = reply {
                return reply;
            }
        }
    }

    let fixed = state.fixed.lock().unwrap();
    fixed
        .get(path)
        .cloned()
        .unwrap_or_else(|| Reply::status(404))
}

impl MockProvider {
    pub fn new() -> Self {
        let state = ProviderState::default();

        let router = Router::new()
            .route(
                "/json/*path",
                get(
                    |State(state): State<ProviderState>,
                     extract::Path(path): extract::Path<String>| async move {
                        lookup_reply(&state, &path)
                    },
                )
                .post(
                    |State(state): State<ProviderState>,
                     extract::Path(path): extract::Path<String>| async move {
                        lookup_reply(&state, &path)
                    },
                ),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |State(state): State<ProviderState>,
                     extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        lookup_reply(&state, &path)
                    },
                )
                .post(
                    |State(state): State<ProviderState>,
                     extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        lookup_reply(&state, &path)
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .layer(middleware::from_fn_with_state(state.clone(), count_hits))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self { server, state }
    }

    /// Serves `body` with `200 OK` for `path` until replaced.
    pub fn set_json(&self, path: &str, body: serde_json::Value) {
        self.set_reply(path, Reply::ok(body));
    }

    /// Serves `reply` for `path` until replaced.
    pub fn set_reply(&self, path: &str, reply: Reply) {
        let mut fixed = self.state.fixed.lock().unwrap();
        fixed.insert(path.trim_start_matches('/').to_owned(), reply);
    }

    /// Serves the given replies for `path` in order, repeating the last one.
    pub fn script(&self, path: &str, replies: impl IntoIterator<Item = Reply>) {
        let mut scripts = self.state.scripts.lock().unwrap();
        scripts.insert(
            path.trim_start_matches('/').to_owned(),
            replies.into_iter().collect(),
        );
    }

    /// Returns the number of requests whose URI starts with `/{prefix}`.
    ///
    /// Unlike [`accesses`](Self::accesses), this does not reset the counters.
    pub fn hits(&self, prefix: &str) -> usize {
        let prefix = format!("/{}", prefix.trim_start_matches('/'));
        let hits = self.state.hits.lock().unwrap();
        hits.iter()
            .filter(|(uri, _)| uri.starts_with(&prefix))
            .map(|(_, count)| count)
            .sum()
    }

    /// Returns the total number of requests and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns all hits per URI and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// The base URL for JSON replies, to be used as a source base URL.
    pub fn json_base(&self) -> Url {
        self.server.url("json/")
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}
