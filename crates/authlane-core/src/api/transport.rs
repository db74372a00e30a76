//! HTTP transport for the remote API.
//!
//! [`ApiTransport`] fires requests against a fixed base address, attaching a
//! bearer token obtained from an injected [`TokenSupplier`]. Requests that come
//! back `401 Unauthorized` are parked in a pending queue and a single
//! [`TransportEvent::Unauthorized`] is emitted per refresh cycle. Once the
//! session layer has refreshed its tokens it calls
//! [`RequestIssuer::replay_pending`] (or [`RequestIssuer::discard_pending`] if
//! the refresh failed).

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::ApiError;
use crate::config::{ClientConfig, ConfigError};

/// Callback receiving a successful (2xx) reply.
pub type ReplyHandler = Box<dyn FnOnce(Reply) + Send + 'static>;

/// Callback receiving any non-401 failure.
pub type FailureHandler = Box<dyn FnOnce(Failure) + Send + 'static>;

/// Returns the current access token, if any. Injected by the session layer so
/// the transport never holds credentials itself.
pub type TokenSupplier = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Notifications from the transport to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// A request was rejected with 401 and no refresh is in flight yet.
    Unauthorized,
}

/// A request to be sent relative to the configured base address.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub endpoint: String,
    pub body: Option<Value>,
    /// Whether a 401 parks the request for replay after a token refresh.
    pub reauth: bool,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
            reauth: true,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn patch(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PATCH, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Route a 401 straight to the error handler instead of queueing it.
    /// Used for the login and refresh calls themselves.
    pub fn without_reauth(mut self) -> Self {
        self.reauth = false;
        self
    }
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl Reply {
    /// Parse the body as JSON, reporting failures as [`ApiError::ClientJsonParse`].
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::json_parse(&self.body, &e))
    }
}

/// Why a request did not produce a successful reply.
#[derive(Debug, Clone)]
pub enum Failure {
    /// The server answered with a non-success status. Body is kept raw for
    /// classification downstream.
    Status { status: StatusCode, body: Vec<u8> },
    /// The per-request timeout elapsed.
    Timeout(Duration),
    /// Connection, DNS or protocol failure.
    Network(String),
    /// The endpoint could not be resolved against the base address.
    InvalidEndpoint(String),
    /// The request was queued on a 401 and then dropped because the refresh
    /// failed. Only observable through [`execute`]; raw handlers are never
    /// called in that case.
    Discarded,
}

impl Failure {
    /// Map this failure onto the [`ApiError`] taxonomy.
    pub fn classify(&self) -> ApiError {
        ApiError::from_failure(self)
    }
}

/// The capability to issue requests, as seen by the session and profile
/// services.
pub trait RequestIssuer: Send + Sync {
    /// Fire a request. Exactly one of the handlers runs, unless the request is
    /// parked on a 401 and later discarded, in which case neither does.
    fn issue(&self, request: ApiRequest, on_success: ReplyHandler, on_error: FailureHandler);

    /// Reissue everything parked on a 401 and clear the in-flight marker.
    fn replay_pending(&self);

    /// Drop everything parked on a 401 without calling any handler.
    fn discard_pending(&self);

    fn set_token_supplier(&self, supplier: TokenSupplier);
}

/// Issue a request and wait for its outcome.
///
/// A request parked on a 401 stays pending here until it is replayed; if the
/// queue is discarded instead, this resolves to [`Failure::Discarded`].
pub async fn execute(issuer: &dyn RequestIssuer, request: ApiRequest) -> Result<Reply, Failure> {
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let tx_err = Arc::clone(&tx);

    issuer.issue(
        request,
        Box::new(move |reply| {
            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(Ok(reply));
            }
        }),
        Box::new(move |failure| {
            if let Some(tx) = tx_err.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(Err(failure));
            }
        }),
    );

    rx.await.unwrap_or(Err(Failure::Discarded))
}

struct PendingRequest {
    request: ApiRequest,
    url: Url,
    on_success: ReplyHandler,
    on_error: FailureHandler,
}

#[derive(Default)]
struct PendingQueue {
    requests: Vec<PendingRequest>,
    refresh_in_flight: bool,
}

struct TransportInner {
    client: Client,
    base_url: Url,
    timeout: Duration,
    token_supplier: RwLock<Option<TokenSupplier>>,
    pending: Mutex<PendingQueue>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// reqwest-backed [`RequestIssuer`].
/// Clone is cheap and clones share the pending queue.
#[derive(Clone)]
pub struct ApiTransport {
    inner: Arc<TransportInner>,
}

impl ApiTransport {
    /// Build a transport from configuration.
    ///
    /// Returns the transport together with the receiving end of its event
    /// channel, which the session layer listens on.
    pub fn new(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), ConfigError> {
        let base_url = config.base_url()?;
        let timeout = config.request_timeout();

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let transport = Self {
            inner: Arc::new(TransportInner {
                client,
                base_url,
                timeout,
                token_supplier: RwLock::new(None),
                pending: Mutex::new(PendingQueue::default()),
                events: tx,
            }),
        };
        Ok((transport, rx))
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Number of requests currently parked on a 401.
    pub fn pending_len(&self) -> usize {
        self.inner.lock_pending().requests.len()
    }

    pub fn is_refresh_in_flight(&self) -> bool {
        self.inner.lock_pending().refresh_in_flight
    }

    fn resolve(&self, endpoint: &str) -> Result<Url, Failure> {
        // Relative join keeps any path prefix on the base address
        self.inner
            .base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Failure::InvalidEndpoint(format!("{}: {}", endpoint, e)))
    }
}

impl RequestIssuer for ApiTransport {
    fn issue(&self, request: ApiRequest, on_success: ReplyHandler, on_error: FailureHandler) {
        match self.resolve(&request.endpoint) {
            Ok(url) => dispatch(
                Arc::clone(&self.inner),
                PendingRequest {
                    request,
                    url,
                    on_success,
                    on_error,
                },
            ),
            Err(failure) => {
                warn!(endpoint = %request.endpoint, "Could not resolve endpoint");
                invoke(on_error, failure, &request.endpoint);
            }
        }
    }

    fn replay_pending(&self) {
        let requests = {
            let mut queue = self.inner.lock_pending();
            queue.refresh_in_flight = false;
            std::mem::take(&mut queue.requests)
        };

        if !requests.is_empty() {
            info!(count = requests.len(), "Replaying requests queued during token refresh");
        }
        for pending in requests {
            dispatch(Arc::clone(&self.inner), pending);
        }
    }

    fn discard_pending(&self) {
        let requests = {
            let mut queue = self.inner.lock_pending();
            queue.refresh_in_flight = false;
            std::mem::take(&mut queue.requests)
        };

        if !requests.is_empty() {
            warn!(count = requests.len(), "Discarding requests queued during failed token refresh");
        }
        drop(requests);
    }

    fn set_token_supplier(&self, supplier: TokenSupplier) {
        *self
            .inner
            .token_supplier
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(supplier);
    }
}

impl TransportInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingQueue> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_token(&self) -> Option<String> {
        let supplier = self
            .token_supplier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        supplier().filter(|token| !token.is_empty())
    }

    /// Park a 401'd request. Emits at most one notification per refresh cycle.
    fn enqueue(&self, pending: PendingRequest) {
        let notify = {
            let mut queue = self.lock_pending();
            queue.requests.push(pending);
            if queue.refresh_in_flight {
                false
            } else {
                queue.refresh_in_flight = true;
                true
            }
        };

        if notify {
            info!("Request unauthorized, requesting token refresh");
            if self.events.send(TransportEvent::Unauthorized).is_err() {
                warn!("No session listener for unauthorized events, dropping queued requests");
                let requests = {
                    let mut queue = self.lock_pending();
                    queue.refresh_in_flight = false;
                    std::mem::take(&mut queue.requests)
                };
                drop(requests);
            }
        } else {
            debug!("Refresh already in flight, request queued");
        }
    }

    fn classify_send_error(&self, e: reqwest::Error) -> Failure {
        if e.is_timeout() {
            Failure::Timeout(self.timeout)
        } else {
            Failure::Network(e.to_string())
        }
    }
}

fn dispatch(inner: Arc<TransportInner>, pending: PendingRequest) {
    tokio::spawn(perform(inner, pending));
}

async fn perform(inner: Arc<TransportInner>, pending: PendingRequest) {
    let PendingRequest {
        request,
        url,
        on_success,
        on_error,
    } = pending;

    let mut builder = inner
        .client
        .request(request.method.clone(), url.clone())
        .timeout(inner.timeout);
    if let Some(token) = inner.current_token() {
        builder = builder.bearer_auth(token);
    }
    if let Some(ref body) = request.body {
        builder = builder.json(body);
    }

    debug!(method = %request.method, url = %url, "Sending request");

    let outcome = match builder.send().await {
        Ok(response) => {
            let status = response.status();
            match response.bytes().await {
                Ok(body) => Ok((status, body.to_vec())),
                Err(e) => Err(inner.classify_send_error(e)),
            }
        }
        Err(e) => Err(inner.classify_send_error(e)),
    };

    match outcome {
        Ok((status, _)) if status == StatusCode::UNAUTHORIZED && request.reauth => {
            inner.enqueue(PendingRequest {
                request,
                url,
                on_success,
                on_error,
            });
        }
        Ok((status, body)) if status.is_success() => {
            debug!(url = %url, status = status.as_u16(), "Request succeeded");
            invoke(on_success, Reply { status, body }, url.as_str());
        }
        Ok((status, body)) => {
            debug!(url = %url, status = status.as_u16(), "Request failed with status");
            invoke(on_error, Failure::Status { status, body }, url.as_str());
        }
        Err(failure) => {
            warn!(url = %url, ?failure, "Request failed");
            invoke(on_error, failure, url.as_str());
        }
    }
}

/// Run a handler, containing any panic so it never unwinds into the transport.
fn invoke<T>(handler: Box<dyn FnOnce(T) + Send>, value: T, target: &str) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || handler(value))) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(target_url = %target, reason = %reason, "Response handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn transport_for(
        server: &MockServer,
        timeout_ms: u64,
    ) -> (ApiTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let config = ClientConfig {
            base_url: server.uri(),
            request_timeout_ms: timeout_ms,
            ..Default::default()
        };
        ApiTransport::new(&config).expect("transport should build")
    }

    fn static_token(token: &str) -> TokenSupplier {
        let token = token.to_string();
        Arc::new(move || Some(token.clone()))
    }

    async fn wait_for_pending(transport: &ApiTransport, count: usize) {
        for _ in 0..200 {
            if transport.pending_len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} pending requests, found {}", count, transport.pending_len());
    }

    #[test]
    fn test_request_builders() {
        let req = ApiRequest::put("/update/7").with_json(json!({"email": "a@b.io"}));
        assert_eq!(req.method, Method::PUT);
        assert_eq!(req.endpoint, "/update/7");
        assert!(req.reauth);
        assert!(!ApiRequest::post("/auth/login").without_reauth().reauth);
        assert_eq!(ApiRequest::delete("/x").method, Method::DELETE);
        assert_eq!(ApiRequest::patch("/x").method, Method::PATCH);
    }

    #[tokio::test]
    async fn test_success_attaches_bearer_and_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .and(header("Authorization", "Bearer abc"))
            .and(header("User-Agent", crate::config::DEFAULT_USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let (transport, _events) = transport_for(&server, 5000);
        transport.set_token_supplier(static_token("abc"));

        let reply = execute(&transport, ApiRequest::get("/auth/me")).await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        let body: Value = reply.json().unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_json_body_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/user/register"))
            .and(header("Content-Type", "application/json"))
            .and(body_json(json!({"email": "a@b.io"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (transport, _events) = transport_for(&server, 5000);
        let req = ApiRequest::post("/user/register").with_json(json!({"email": "a@b.io"}));
        assert!(execute(&transport, req).await.is_ok());
    }

    #[tokio::test]
    async fn test_error_status_routes_raw_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let (transport, _events) = transport_for(&server, 5000);
        match execute(&transport, ApiRequest::get("/broken")).await {
            Err(Failure::Status { status, body }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, b"boom");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let (transport, _events) = transport_for(&server, 50);
        let failure = execute(&transport, ApiRequest::get("/slow")).await.unwrap_err();
        assert!(matches!(failure, Failure::Timeout(d) if d == Duration::from_millis(50)));
        assert_eq!(ApiError::from(failure).kind(), crate::api::ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_unauthorized_queues_and_notifies_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/protected"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (transport, mut events) = transport_for(&server, 5000);

        let first = {
            let t = transport.clone();
            tokio::spawn(async move { execute(&t, ApiRequest::get("/protected")).await })
        };
        let second = {
            let t = transport.clone();
            tokio::spawn(async move { execute(&t, ApiRequest::get("/protected")).await })
        };

        assert_eq!(events.recv().await, Some(TransportEvent::Unauthorized));
        wait_for_pending(&transport, 2).await;
        assert!(transport.is_refresh_in_flight());
        assert!(events.try_recv().is_err(), "only one notification per refresh cycle");

        transport.discard_pending();
        assert_eq!(transport.pending_len(), 0);
        assert!(!transport.is_refresh_in_flight());
        assert!(matches!(first.await.unwrap(), Err(Failure::Discarded)));
        assert!(matches!(second.await.unwrap(), Err(Failure::Discarded)));
    }

    #[tokio::test]
    async fn test_replay_uses_fresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .and(header("Authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .and(header("Authorization", "Bearer new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
            .expect(1)
            .mount(&server)
            .await;

        let (transport, mut events) = transport_for(&server, 5000);
        let token = Arc::new(RwLock::new("old".to_string()));
        let supplier_token = Arc::clone(&token);
        transport
            .set_token_supplier(Arc::new(move || Some(supplier_token.read().unwrap().clone())));

        let call = {
            let t = transport.clone();
            tokio::spawn(async move { execute(&t, ApiRequest::get("/data")).await })
        };

        assert_eq!(events.recv().await, Some(TransportEvent::Unauthorized));
        wait_for_pending(&transport, 1).await;

        *token.write().unwrap() = "new".to_string();
        transport.replay_pending();

        let reply = call.await.unwrap().unwrap();
        let body: Value = reply.json().unwrap();
        assert_eq!(body["v"], 1);
        assert!(!transport.is_refresh_in_flight());
    }

    #[tokio::test]
    async fn test_without_reauth_routes_401_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (transport, mut events) = transport_for(&server, 5000);
        let failure = execute(&transport, ApiRequest::post("/auth/refresh").without_reauth())
            .await
            .unwrap_err();
        assert!(matches!(
            failure,
            Failure::Status { status, .. } if status == StatusCode::UNAUTHORIZED
        ));
        assert_eq!(transport.pending_len(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_discard_never_calls_handlers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (transport, mut events) = transport_for(&server, 5000);
        let calls = Arc::new(AtomicUsize::new(0));
        let on_ok = Arc::clone(&calls);
        let on_err = Arc::clone(&calls);
        transport.issue(
            ApiRequest::get("/anything"),
            Box::new(move |_| {
                on_ok.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |_| {
                on_err.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(events.recv().await, Some(TransportEvent::Unauthorized));
        wait_for_pending(&transport, 1).await;
        transport.discard_pending();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (transport, _events) = transport_for(&server, 5000);
        transport.issue(
            ApiRequest::get("/first"),
            Box::new(|_| panic!("handler bug")),
            Box::new(|_| {}),
        );

        // The transport keeps serving requests afterwards
        let reply = execute(&transport, ApiRequest::get("/second")).await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_base_path_prefix_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/auth/me"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig {
            base_url: format!("{}/api/v1", server.uri()),
            ..Default::default()
        };
        let (transport, _events) = ApiTransport::new(&config).unwrap();
        assert!(execute(&transport, ApiRequest::get("/auth/me")).await.is_ok());
    }
}
