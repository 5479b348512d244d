//! Authenticated request interceptor
//!
//! Every API call goes through [`AuthInterceptor::handle`], which attaches
//! the current access token and hides access-token expiry from the caller:
//!
//! 1. The request is sent with `Authorization: Bearer <access token>`.
//! 2. Anything but a 401 goes straight back to the caller.
//! 3. On a 401 the request joins the refresh protocol. The first request in
//!    becomes the leader and calls the refresh endpoint; the rest park in a
//!    FIFO queue until the leader settles.
//! 4. On success the new token is stored and every request is replayed once
//!    with it. On failure the session is cleared and every request fails
//!    with the same error.
//!
//! Replays never re-enter the protocol, so a systemically broken endpoint
//! cannot trigger a refresh loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;
use uuid::Uuid;

use super::refresh::{InFlight, RefreshCoordinator, Ticket};
use super::request::{ApiError, ApiRequest, ApiResponse};
use super::transport::Transport;
use crate::auth::{AuthError, AuthService, TokenStore};

/// Bearer-token interceptor with single-flight refresh.
pub struct AuthInterceptor {
    tokens: TokenStore,
    auth: Arc<dyn AuthService>,
    refresh: RefreshCoordinator,
    refresh_timeout: Duration,
}

impl AuthInterceptor {
    pub fn new(
        tokens: TokenStore,
        auth: Arc<dyn AuthService>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            tokens,
            auth,
            refresh: RefreshCoordinator::new(),
            refresh_timeout,
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Whether a refresh call is currently outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.refresh.is_refreshing()
    }

    /// Requests parked behind the outstanding refresh.
    pub fn pending_refreshes(&self) -> usize {
        self.refresh.pending()
    }

    /// Send `request` through `next`, refreshing the session on a 401.
    pub async fn handle(
        &self,
        request: ApiRequest,
        next: &dyn Transport,
    ) -> Result<ApiResponse, ApiError> {
        let span = tracing::debug_span!(
            "api",
            request_id = %Uuid::new_v4(),
            method = %request.method,
            path = %request.path
        );
        self.intercept(request, next).instrument(span).await
    }

    async fn intercept(
        &self,
        request: ApiRequest,
        next: &dyn Transport,
    ) -> Result<ApiResponse, ApiError> {
        let sent_with = self.tokens.access_token();
        let outgoing = match &sent_with {
            Some(token) => request.with_bearer(token),
            None => request.clone(),
        };

        match next.send(outgoing).await {
            Err(err) if err.is_unauthorized() => {
                tracing::debug!("Received 401");
                self.recover(request, sent_with, next).await
            }
            other => other,
        }
    }

    async fn recover(
        &self,
        request: ApiRequest,
        sent_with: Option<String>,
        next: &dyn Transport,
    ) -> Result<ApiResponse, ApiError> {
        let token = match self.refresh.acquire() {
            Ticket::Leader(flight) => self.lead_refresh(flight, sent_with.as_deref()).await?,
            Ticket::Follower(waiter) => waiter.wait().await?,
        };

        self.replay(&request, &token, next).await
    }

    /// Run the one refresh call and settle every parked request with its
    /// outcome. Logout happens before the flag is released so that a 401
    /// arriving meanwhile queues up and fails with the rest.
    ///
    /// The staleness check runs only while holding leadership: a refresh
    /// that completed earlier has already stored its token by then, so it is
    /// seen here instead of being repeated.
    async fn lead_refresh(
        &self,
        flight: InFlight<'_>,
        sent_with: Option<&str>,
    ) -> Result<String, ApiError> {
        if let Some(current) = self.tokens.access_token() {
            if sent_with != Some(current.as_str()) {
                tracing::debug!("Access token changed since send, replaying without refresh");
                flight.succeed(&current);
                return Ok(current);
            }
        }

        let Some(refresh_token) = self.tokens.refresh_token() else {
            tracing::warn!("Session expired and no refresh token is stored, logging out");
            self.auth.logout().await;
            flight.fail(ApiError::Unauthorized);
            return Err(ApiError::Unauthorized);
        };

        tracing::info!("Access token expired, refreshing...");

        let result = tokio::time::timeout(self.refresh_timeout, self.auth.refresh(&refresh_token))
            .await
            .unwrap_or(Err(AuthError::Timeout(self.refresh_timeout)));

        match result {
            Ok(grant) => {
                self.tokens.store(&grant);
                let resumed = flight.succeed(&grant.access_token);
                tracing::info!("Token refreshed, resuming {} queued request(s)", resumed);
                Ok(grant.access_token)
            }
            Err(e) => {
                tracing::warn!("Token refresh failed, logging out: {}", e);
                let error = ApiError::Refresh(e);
                self.auth.logout().await;
                let aborted = flight.fail(error.clone());
                if aborted > 0 {
                    tracing::debug!("Failed {} queued request(s)", aborted);
                }
                Err(error)
            }
        }
    }

    async fn replay(
        &self,
        request: &ApiRequest,
        token: &str,
        next: &dyn Transport,
    ) -> Result<ApiResponse, ApiError> {
        tracing::debug!("Replaying with renewed token");
        next.send(request.with_bearer(token)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::auth::storage::MemoryStore;
    use crate::auth::tokens::ACCESS_TOKEN_KEY;
    use crate::auth::{KeyValueStore, TokenGrant};

    type Responder = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync>;

    struct MockTransport {
        sent: Mutex<Vec<ApiRequest>>,
        respond: Responder,
    }

    impl MockTransport {
        fn new(
            respond: impl Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        /// 200 for requests carrying `token`, 401 for everything else.
        fn accepting(token: &'static str) -> Self {
            Self::new(move |req| {
                if req.bearer() == Some(token) {
                    Ok(ApiResponse::new(StatusCode::OK, req.path.clone()))
                } else {
                    Err(status_error(StatusCode::UNAUTHORIZED, &req.path))
                }
            })
        }

        fn sent(&self) -> Vec<ApiRequest> {
            self.sent.lock().unwrap().clone()
        }

        fn sent_with(&self, token: &str) -> usize {
            self.sent()
                .iter()
                .filter(|r| r.bearer() == Some(token))
                .count()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
            self.sent.lock().unwrap().push(request.clone());
            (self.respond)(&request)
        }
    }

    struct MockAuth {
        tokens: TokenStore,
        outcome: Result<TokenGrant, AuthError>,
        gate: Option<Arc<Notify>>,
        hang: bool,
        refresh_calls: AtomicUsize,
        logout_calls: AtomicUsize,
        refreshed_with: Mutex<Vec<String>>,
    }

    impl MockAuth {
        fn new(tokens: &TokenStore, outcome: Result<TokenGrant, AuthError>) -> Self {
            Self {
                tokens: tokens.clone(),
                outcome,
                gate: None,
                hang: false,
                refresh_calls: AtomicUsize::new(0),
                logout_calls: AtomicUsize::new(0),
                refreshed_with: Mutex::new(Vec::new()),
            }
        }

        fn granting(tokens: &TokenStore, access: &str, refresh: &str) -> Self {
            Self::new(
                tokens,
                Ok(TokenGrant {
                    access_token: access.into(),
                    refresh_token: refresh.into(),
                    expires_in: Some(3600),
                }),
            )
        }

        fn rejecting(tokens: &TokenStore) -> Self {
            Self::new(tokens, Err(rejected()))
        }

        /// Hold every refresh until the gate is notified.
        fn gated(mut self, gate: &Arc<Notify>) -> Self {
            self.gate = Some(gate.clone());
            self
        }

        fn hanging(mut self) -> Self {
            self.hang = true;
            self
        }

        fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }

        fn logout_calls(&self) -> usize {
            self.logout_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthService for MockAuth {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refreshed_with
                .lock()
                .unwrap()
                .push(refresh_token.to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.outcome.clone()
        }

        async fn logout(&self) {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            self.tokens.clear();
        }
    }

    fn rejected() -> AuthError {
        AuthError::Rejected {
            endpoint: "/auth/refresh-token".into(),
            status: 401,
            body: "refresh token expired".into(),
        }
    }

    fn status_error(status: StatusCode, path: &str) -> ApiError {
        ApiError::Status {
            status,
            path: path.to_string(),
            body: String::new(),
        }
    }

    fn tokens(access: Option<&str>, refresh: Option<&str>) -> TokenStore {
        let store = TokenStore::new(Arc::new(MemoryStore::default()));
        store.set_access_token(access.map(String::from));
        store.set_refresh_token(refresh.map(String::from));
        store
    }

    fn interceptor(tokens: &TokenStore, auth: &Arc<MockAuth>) -> Arc<AuthInterceptor> {
        Arc::new(AuthInterceptor::new(
            tokens.clone(),
            auth.clone(),
            Duration::from_secs(5),
        ))
    }

    /// Fire one request per path on its own task.
    fn spawn_all(
        interceptor: &Arc<AuthInterceptor>,
        transport: &Arc<MockTransport>,
        paths: &[&'static str],
    ) -> Vec<tokio::task::JoinHandle<Result<ApiResponse, ApiError>>> {
        paths
            .iter()
            .map(|&path| {
                let interceptor = interceptor.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    interceptor
                        .handle(ApiRequest::get(path), transport.as_ref())
                        .await
                })
            })
            .collect()
    }

    async fn wait_for_queue(interceptor: &AuthInterceptor, waiting: usize) {
        while interceptor.pending_refreshes() < waiting {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_attaches_bearer_when_token_present() {
        let tokens = tokens(Some("t1"), Some("r1"));
        let auth = Arc::new(MockAuth::rejecting(&tokens));
        let transport = MockTransport::accepting("t1");

        let resp = assert_ok!(
            interceptor(&tokens, &auth)
                .handle(ApiRequest::get("/ads"), &transport)
                .await
        );

        assert_eq!(resp.text(), "/ads");
        assert_eq!(transport.sent_with("t1"), 1);
        assert_eq!(auth.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_token_sends_without_header() {
        let tokens = tokens(None, None);
        let auth = Arc::new(MockAuth::rejecting(&tokens));
        let transport =
            MockTransport::new(|req| Ok(ApiResponse::new(StatusCode::OK, req.path.clone())));

        assert_ok!(
            interceptor(&tokens, &auth)
                .handle(ApiRequest::get("/categories"), &transport)
                .await
        );

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].bearer().is_none());
    }

    #[tokio::test]
    async fn test_non_401_error_passes_through() {
        let tokens = tokens(Some("t1"), Some("r1"));
        let auth = Arc::new(MockAuth::granting(&tokens, "t2", "r1"));
        let transport = MockTransport::new(|req| {
            Err(status_error(StatusCode::INTERNAL_SERVER_ERROR, &req.path))
        });

        let err = assert_err!(
            interceptor(&tokens, &auth)
                .handle(ApiRequest::get("/ads"), &transport)
                .await
        );

        assert_eq!(err, status_error(StatusCode::INTERNAL_SERVER_ERROR, "/ads"));
        assert_eq!(auth.refresh_calls(), 0);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(tokens.access_token().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let tokens = tokens(Some("expired"), Some("valid"));
        let gate = Arc::new(Notify::new());
        let auth = Arc::new(MockAuth::granting(&tokens, "new1", "valid").gated(&gate));
        let interceptor = interceptor(&tokens, &auth);
        let transport = Arc::new(MockTransport::accepting("new1"));

        let handles = spawn_all(&interceptor, &transport, &["/ads", "/chats", "/users/me"]);
        wait_for_queue(&interceptor, 2).await;
        assert!(interceptor.is_refreshing());
        gate.notify_one();

        let mut paths: Vec<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().text())
            .collect();
        paths.sort();

        assert_eq!(paths, ["/ads", "/chats", "/users/me"]);
        assert_eq!(auth.refresh_calls(), 1);
        assert_eq!(*auth.refreshed_with.lock().unwrap(), ["valid"]);
        assert_eq!(tokens.access_token().as_deref(), Some("new1"));
        assert_eq!(tokens.refresh_token().as_deref(), Some("valid"));
        assert_eq!(transport.sent_with("expired"), 3);
        assert_eq!(transport.sent_with("new1"), 3);
        assert_eq!(transport.sent().len(), 6);
        assert!(!interceptor.is_refreshing());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_logs_out() {
        let tokens = tokens(Some("expired"), None);
        let auth = Arc::new(MockAuth::granting(&tokens, "new1", "r1"));
        let transport = MockTransport::accepting("new1");

        let err = assert_err!(
            interceptor(&tokens, &auth)
                .handle(ApiRequest::get("/ads"), &transport)
                .await
        );

        assert_eq!(err, ApiError::Unauthorized);
        assert_eq!(err.to_string(), "Unauthorized: session expired, log in again");
        assert_eq!(auth.refresh_calls(), 0);
        assert_eq!(auth.logout_calls(), 1);
        assert!(tokens.access_token().is_none());
        assert!(tokens.refresh_token().is_none());
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_session_without_retry() {
        let tokens = tokens(Some("expired"), Some("stale"));
        let auth = Arc::new(MockAuth::rejecting(&tokens));
        let transport = MockTransport::accepting("new1");

        let err = assert_err!(
            interceptor(&tokens, &auth)
                .handle(ApiRequest::get("/ads"), &transport)
                .await
        );

        assert_eq!(err, ApiError::Refresh(rejected()));
        assert!(err.requires_login());
        assert_eq!(auth.refresh_calls(), 1);
        assert_eq!(auth.logout_calls(), 1);
        assert!(tokens.access_token().is_none());
        assert!(tokens.refresh_token().is_none());
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_fails_every_waiter() {
        let tokens = tokens(Some("expired"), Some("stale"));
        let gate = Arc::new(Notify::new());
        let auth = Arc::new(MockAuth::rejecting(&tokens).gated(&gate));
        let interceptor = interceptor(&tokens, &auth);
        let transport = Arc::new(MockTransport::accepting("new1"));

        let handles = spawn_all(&interceptor, &transport, &["/a", "/b", "/c", "/d"]);
        wait_for_queue(&interceptor, 3).await;
        gate.notify_one();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err, ApiError::Refresh(rejected()));
        }
        assert_eq!(auth.refresh_calls(), 1);
        assert_eq!(auth.logout_calls(), 1);
        assert!(!tokens.has_session());
        assert_eq!(transport.sent().len(), 4);
        assert!(!interceptor.is_refreshing());
    }

    #[tokio::test]
    async fn test_replay_401_is_not_refreshed_again() {
        let tokens = tokens(Some("expired"), Some("valid"));
        let auth = Arc::new(MockAuth::granting(&tokens, "new1", "valid"));
        let transport =
            MockTransport::new(|req| Err(status_error(StatusCode::UNAUTHORIZED, &req.path)));

        let err = assert_err!(
            interceptor(&tokens, &auth)
                .handle(ApiRequest::get("/ads"), &transport)
                .await
        );

        assert!(err.is_unauthorized());
        assert_eq!(auth.refresh_calls(), 1);
        assert_eq!(auth.logout_calls(), 0);
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(tokens.access_token().as_deref(), Some("new1"));
    }

    #[tokio::test]
    async fn test_replay_failure_is_returned_unchanged() {
        let tokens = tokens(Some("expired"), Some("valid"));
        let auth = Arc::new(MockAuth::granting(&tokens, "new1", "valid"));
        let transport = MockTransport::new(|req| match req.bearer() {
            Some("new1") => Err(status_error(StatusCode::NOT_FOUND, &req.path)),
            _ => Err(status_error(StatusCode::UNAUTHORIZED, &req.path)),
        });

        let err = assert_err!(
            interceptor(&tokens, &auth)
                .handle(ApiRequest::delete("/ads/9"), &transport)
                .await
        );

        assert_eq!(err, status_error(StatusCode::NOT_FOUND, "/ads/9"));
        assert_eq!(auth.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_token_renewed_in_flight_skips_refresh() {
        let tokens = tokens(Some("expired"), Some("valid"));
        let auth = Arc::new(MockAuth::granting(&tokens, "unused", "valid"));
        let renewer = tokens.clone();
        let transport = MockTransport::new(move |req| match req.bearer() {
            Some("fresh") => Ok(ApiResponse::new(StatusCode::OK, "ok")),
            _ => {
                // Another request renewed the session while this one was out
                renewer.set_access_token(Some("fresh".into()));
                Err(status_error(StatusCode::UNAUTHORIZED, &req.path))
            }
        });

        assert_ok!(
            interceptor(&tokens, &auth)
                .handle(ApiRequest::get("/ads"), &transport)
                .await
        );

        assert_eq!(auth.refresh_calls(), 0);
        assert_eq!(transport.sent_with("fresh"), 1);
    }

    /// Serves `stale` for the first `stale_reads` access-token reads, then
    /// the token another caller stored in the meantime.
    struct RenewedBehindBackend {
        inner: MemoryStore,
        stale: &'static str,
        renewed: &'static str,
        stale_reads: AtomicUsize,
    }

    impl KeyValueStore for RenewedBehindBackend {
        fn get(&self, key: &str) -> Option<String> {
            if key == ACCESS_TOKEN_KEY {
                let left = self.stale_reads.load(Ordering::SeqCst);
                if left > 0 {
                    self.stale_reads.store(left - 1, Ordering::SeqCst);
                    return Some(self.stale.to_string());
                }
                if self.inner.get(key).as_deref() == Some(self.stale) {
                    self.inner.set(key, self.renewed);
                }
            }
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) {
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) {
            self.inner.remove(key)
        }
    }

    #[tokio::test]
    async fn test_refresh_landing_before_leadership_is_not_repeated() {
        // The send reads "expired"; by the time this request owns the
        // refresh, an earlier refresh has already stored "new1".
        let backend = Arc::new(RenewedBehindBackend {
            inner: MemoryStore::default(),
            stale: "expired",
            renewed: "new1",
            stale_reads: AtomicUsize::new(1),
        });
        let tokens = TokenStore::new(backend);
        tokens.set_access_token(Some("expired".into()));
        tokens.set_refresh_token(Some("valid".into()));
        let auth = Arc::new(MockAuth::granting(&tokens, "new2", "valid"));
        let interceptor = interceptor(&tokens, &auth);
        let transport = MockTransport::accepting("new1");

        assert_ok!(interceptor.handle(ApiRequest::get("/ads"), &transport).await);

        assert_eq!(auth.refresh_calls(), 0);
        assert_eq!(auth.logout_calls(), 0);
        assert_eq!(transport.sent_with("expired"), 1);
        assert_eq!(transport.sent_with("new1"), 1);
        assert_eq!(tokens.access_token().as_deref(), Some("new1"));
        assert!(!interceptor.is_refreshing());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_replays_follow_arrival_order() {
        let tokens = tokens(Some("expired"), Some("valid"));
        let gate = Arc::new(Notify::new());
        let auth = Arc::new(MockAuth::granting(&tokens, "new1", "valid").gated(&gate));
        let interceptor = interceptor(&tokens, &auth);
        let transport = Arc::new(MockTransport::accepting("new1"));

        let mut handles = spawn_all(&interceptor, &transport, &["/p0"]);
        while !interceptor.is_refreshing() {
            tokio::task::yield_now().await;
        }
        for (queued, path) in ["/p1", "/p2", "/p3", "/p4"].into_iter().enumerate() {
            handles.extend(spawn_all(&interceptor, &transport, &[path]));
            wait_for_queue(&interceptor, queued + 1).await;
        }
        gate.notify_one();

        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        let replayed: Vec<String> = transport
            .sent()
            .into_iter()
            .filter(|r| r.bearer() == Some("new1"))
            .map(|r| r.path)
            .collect();
        assert_eq!(replayed, ["/p0", "/p1", "/p2", "/p3", "/p4"]);
        assert_eq!(auth.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_timeout_fails_and_logs_out() {
        let tokens = tokens(Some("expired"), Some("valid"));
        let auth = Arc::new(MockAuth::granting(&tokens, "new1", "valid").hanging());
        let interceptor =
            AuthInterceptor::new(tokens.clone(), auth.clone(), Duration::from_millis(50));
        let transport = MockTransport::accepting("new1");

        let err = assert_err!(interceptor.handle(ApiRequest::get("/ads"), &transport).await);

        assert_eq!(
            err,
            ApiError::Refresh(AuthError::Timeout(Duration::from_millis(50)))
        );
        assert_eq!(auth.logout_calls(), 1);
        assert!(!tokens.has_session());
        assert!(!interceptor.is_refreshing());
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_queue() {
        let tokens = tokens(Some("expired"), Some("valid"));
        let auth = Arc::new(MockAuth::granting(&tokens, "new1", "valid").hanging());
        let interceptor = interceptor(&tokens, &auth);
        let transport = Arc::new(MockTransport::accepting("new1"));

        let mut handles = spawn_all(&interceptor, &transport, &["/leader"]);
        while !interceptor.is_refreshing() {
            tokio::task::yield_now().await;
        }
        handles.extend(spawn_all(&interceptor, &transport, &["/follower"]));
        wait_for_queue(&interceptor, 1).await;

        let follower = handles.pop().unwrap();
        let leader = handles.pop().unwrap();
        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        assert_eq!(follower.await.unwrap().unwrap_err(), ApiError::RefreshCancelled);
        assert!(!interceptor.is_refreshing());
        // Session is left alone; the next 401 may try again
        assert_eq!(tokens.refresh_token().as_deref(), Some("valid"));
    }
}
