// Session cookie middleware
// Renews or allocates a session per request and attaches its id to the request

use crate::error::SessionError;
use crate::models::SessionConfig;
use crate::session::{ExpiryRegistry, SessionId, SessionLease};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{Extensions, HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::Response,
};
use cookie::Cookie;
use std::marker::PhantomData;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error};

/// Extension key used by [`SessionFilter::new`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSessionKey;

/// Session id stored in request extensions, scoped by the marker type `K`
pub struct SessionContext<K = DefaultSessionKey> {
    id: SessionId,
    _key: PhantomData<fn() -> K>,
}

impl<K> SessionContext<K> {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            _key: PhantomData,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl<K> Clone for SessionContext<K> {
    fn clone(&self) -> Self {
        Self::new(self.id)
    }
}

impl<K> std::fmt::Debug for SessionContext<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext").field("id", &self.id).finish()
    }
}

/// Read the session id attached by a filter using key `K`
pub fn lookup_session_id<K: 'static>(extensions: &Extensions) -> Result<SessionId, SessionError> {
    extensions
        .get::<SessionContext<K>>()
        .map(|context| context.id())
        .ok_or(SessionError::NotAttached)
}

/// Cookie-based session filter
///
/// Each request is matched to a session through the configured cookie. Live
/// sessions are renewed, anything else (no cookie, malformed value, unknown or
/// expired id) gets a freshly allocated session. The id is attached to the
/// request for downstream handlers and returned to the client in a cookie
/// built from the configured template.
///
/// `K` scopes the request extension so that several filters can coexist in
/// one pipeline.
pub struct SessionFilter<K = DefaultSessionKey> {
    registry: Arc<ExpiryRegistry>,
    config: Arc<SessionConfig>,
    _key: PhantomData<fn() -> K>,
}

impl<K> Clone for SessionFilter<K> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
            _key: PhantomData,
        }
    }
}

impl SessionFilter {
    pub fn new(registry: Arc<ExpiryRegistry>, config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_key(registry, config)
    }
}

impl<K: 'static> SessionFilter<K> {
    /// Create a filter whose request extension is keyed by `K`
    pub fn with_key(
        registry: Arc<ExpiryRegistry>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate().map_err(SessionError::InvalidConfig)?;

        Ok(Self {
            registry,
            config: Arc::new(config),
            _key: PhantomData,
        })
    }

    pub fn registry(&self) -> &Arc<ExpiryRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Extract the session id presented by the client, if it is well formed
    pub fn read_session_id(&self, headers: &HeaderMap) -> Option<SessionId> {
        let cookie = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| Cookie::split_parse(value))
            .filter_map(Result::ok)
            .find(|cookie| cookie.name() == self.config.cookie_name)?;

        let id = SessionId::from_cookie_value(cookie.value());
        if id.is_none() {
            debug!(
                "Ignoring malformed '{}' cookie value",
                self.config.cookie_name
            );
        }
        id
    }

    /// Renew the presented session or allocate a new one
    pub async fn establish(&self, headers: &HeaderMap) -> SessionLease {
        let candidate = self.read_session_id(headers);
        let lease = self
            .registry
            .renew_or_create(candidate, self.config.ttl())
            .await;

        if let Some(presented) = candidate
            && lease.created
        {
            debug!(
                "Session {} is no longer live, issued {}",
                presented, lease.id
            );
        }

        lease
    }

    /// Build the response cookie for a session from the configured template
    pub fn session_cookie(&self, id: SessionId) -> Cookie<'static> {
        let ttl_seconds = i64::try_from(self.config.ttl_seconds).unwrap_or(i64::MAX);
        let max_age = time::Duration::seconds(ttl_seconds);

        let mut builder = Cookie::build((self.config.cookie_name.clone(), id.to_string()))
            .path(self.config.cookie_path.clone())
            .secure(self.config.secure)
            .http_only(self.config.http_only)
            .max_age(max_age);

        if let Some(expires) = OffsetDateTime::now_utc().checked_add(max_age) {
            builder = builder.expires(expires);
        }

        if let Some(domain) = &self.config.cookie_domain {
            builder = builder.domain(domain.clone());
        }

        if let Some(same_site) = self.config.same_site {
            builder = builder.same_site(same_site.into());
        }

        builder.build()
    }

    /// Run the filter for one request and forward it to `next`
    pub async fn process(&self, mut request: Request, next: Next) -> Response {
        let lease = self.establish(request.headers()).await;
        let cookie = self.session_cookie(lease.id);

        request
            .extensions_mut()
            .insert(SessionContext::<K>::new(lease.id));

        let mut response = next.run(request).await;

        match HeaderValue::try_from(cookie.to_string()) {
            Ok(value) => prepend_set_cookie(response.headers_mut(), value),
            Err(e) => error!("Failed to encode session cookie for {}: {}", lease.id, e),
        }

        response
    }

    /// Session id attached to a request by this filter
    pub fn lookup_id<B>(&self, request: &axum::http::Request<B>) -> Result<SessionId, SessionError> {
        lookup_session_id::<K>(request.extensions())
    }
}

/// Put the session cookie ahead of any `Set-Cookie` headers written downstream
fn prepend_set_cookie(headers: &mut HeaderMap, session_cookie: HeaderValue) {
    let downstream: Vec<HeaderValue> = headers
        .get_all(header::SET_COOKIE)
        .iter()
        .cloned()
        .collect();

    headers.insert(header::SET_COOKIE, session_cookie);
    for value in downstream {
        headers.append(header::SET_COOKIE, value);
    }
}

/// Middleware entry point for `axum::middleware::from_fn_with_state`
pub async fn session_middleware<K: 'static>(
    State(filter): State<SessionFilter<K>>,
    request: Request,
    next: Next,
) -> Response {
    filter.process(request, next).await
}

/// Extractor for the current request's session id
///
/// Rejects with 500 when the session middleware is missing from the stack.
pub struct CurrentSession<K = DefaultSessionKey> {
    id: SessionId,
    _key: PhantomData<fn() -> K>,
}

impl<K> CurrentSession<K> {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl<S, K> FromRequestParts<S> for CurrentSession<K>
where
    S: Send + Sync,
    K: 'static,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match lookup_session_id::<K>(&parts.extensions) {
            Ok(id) => Ok(Self {
                id,
                _key: PhantomData,
            }),
            Err(e) => {
                error!("{} ({} {})", e, parts.method, parts.uri);
                Err(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}
