//! Bearer tokens attached to every RPC

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::Request;
use tonic::Status;
use tracing::debug;

use crate::error::ClientError;
use crate::error::ClientResult;

/// Tokens are treated as expired this long before their actual expiry.
const EXPIRY_DELTA: TimeDelta = TimeDelta::seconds(10);

/// How long a token read from a file is reused before the file is read again.
const DEFAULT_FILE_REFRESH: TimeDelta = TimeDelta::seconds(60);

#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    /// `None` never expires.
    pub expiry: Option<DateTime<Utc>>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl Token {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expiry: None,
        }
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && self.expiry.map_or(true, |e| e - EXPIRY_DELTA > now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

/// Supplies access tokens.
///
/// Called on every RPC; implementations that do I/O should be wrapped in a
/// [`CachingTokenSource`].
pub trait TokenSource: Send + Sync {
    fn token(&self) -> ClientResult<Token>;
}

/// Always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenSource(Token);

impl StaticTokenSource {
    pub fn new(token: Token) -> Self {
        Self(token)
    }
}

impl TokenSource for StaticTokenSource {
    fn token(&self) -> ClientResult<Token> {
        Ok(self.0.clone())
    }
}

/// Reads the token from a file, e.g. a projected service-account token that
/// is rotated in place.
///
/// Each read stamps the token with an expiry `refresh_interval` ahead, so
/// behind a [`CachingTokenSource`] the file is read at most once per
/// interval rather than on every RPC. Use [`FileTokenSource::cached`].
#[derive(Debug, Clone)]
pub struct FileTokenSource {
    path: PathBuf,
    refresh_interval: TimeDelta,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            refresh_interval: DEFAULT_FILE_REFRESH,
        }
    }

    pub fn with_refresh_interval(mut self, refresh_interval: TimeDelta) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    /// Wraps the source so the file is only re-read once the last token
    /// is due for refresh.
    pub fn cached(self) -> CachingTokenSource {
        CachingTokenSource::new(Arc::new(self))
    }
}

impl TokenSource for FileTokenSource {
    fn token(&self) -> ClientResult<Token> {
        let contents = std::fs::read_to_string(&self.path).change_context_lazy(|| {
            ClientError::Token {
                message: format!("reading {}", self.path.display()),
            }
        })?;
        let token = contents.trim();
        if token.is_empty() {
            return Err(Report::new(ClientError::Token {
                message: format!("{} is empty", self.path.display()),
            }));
        }
        // The cache treats tokens as stale EXPIRY_DELTA early.
        let expiry = Utc::now() + self.refresh_interval + EXPIRY_DELTA;
        Ok(Token::new(token).with_expiry(expiry))
    }
}

/// Caches another source's token until it expires.
pub struct CachingTokenSource {
    source: Arc<dyn TokenSource>,
    cached: RwLock<Option<Token>>,
}

impl CachingTokenSource {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
        }
    }
}

impl TokenSource for CachingTokenSource {
    fn token(&self) -> ClientResult<Token> {
        {
            let cached = self.cached.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = cached.as_ref().filter(|t| t.is_valid()) {
                return Ok(token.clone());
            }
        }

        let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = cached.as_ref().filter(|t| t.is_valid()) {
            return Ok(token.clone());
        }
        let fresh = self.source.token()?;
        if !fresh.is_valid() {
            return Err(Report::new(ClientError::Token {
                message: format!("token source returned an expired token ({:?})", fresh.expiry),
            }));
        }
        debug!(expiry = ?fresh.expiry, "refreshed access token");
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}

/// Adds `authorization: Bearer <token>` to outgoing requests.
#[derive(Clone, Default)]
pub struct PerRpcCredentials {
    source: Option<Arc<dyn TokenSource>>,
}

impl PerRpcCredentials {
    pub fn new(source: Option<Arc<dyn TokenSource>>) -> Self {
        Self { source }
    }
}

impl Interceptor for PerRpcCredentials {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let Some(source) = &self.source else {
            return Ok(request);
        };
        let token = source
            .token()
            .map_err(|e| Status::unauthenticated(e.current_context().to_string()))?;
        let value = MetadataValue::try_from(format!("Bearer {}", token.access_token))
            .map_err(|_| Status::unauthenticated("access token is not a valid header value"))?;
        request.metadata_mut().insert("authorization", value);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use similar_asserts::assert_eq;

    use super::*;

    struct CountingSource {
        calls: AtomicUsize,
        token: Token,
    }

    impl TokenSource for CountingSource {
        fn token(&self) -> ClientResult<Token> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.token.clone())
        }
    }

    #[test]
    fn caching_source_fetches_once_until_expiry() {
        let inner = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            token: Token::new("abc").with_expiry(Utc::now() + TimeDelta::hours(1)),
        });
        let cache = CachingTokenSource::new(inner.clone());

        for _ in 0..3 {
            assert_eq!(cache.token().expect("token").access_token, "abc");
        }

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn caching_source_rejects_expired_tokens() {
        let inner = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            token: Token::new("old").with_expiry(Utc::now() - TimeDelta::minutes(1)),
        });
        let cache = CachingTokenSource::new(inner);

        let err = cache.token().expect_err("expired token");

        assert!(matches!(err.current_context(), ClientError::Token { .. }));
    }

    #[test]
    fn file_source_trims_and_rereads() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "  first-token ").expect("write");
        let source = FileTokenSource::new(file.path());

        assert_eq!(source.token().expect("token").access_token, "first-token");

        std::fs::write(file.path(), "second-token\n").expect("rewrite");
        assert_eq!(source.token().expect("token").access_token, "second-token");
    }

    #[test]
    fn cached_file_source_reads_once_per_interval() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "first-token").expect("write");
        let cached = FileTokenSource::new(file.path()).cached();

        assert_eq!(cached.token().expect("token").access_token, "first-token");
        std::fs::write(file.path(), "second-token\n").expect("rewrite");
        assert_eq!(
            cached.token().expect("token").access_token,
            "first-token",
            "file must not be re-read within the refresh interval"
        );

        let uncached = FileTokenSource::new(file.path()).with_refresh_interval(TimeDelta::zero());
        let token = uncached.token().expect("token");
        assert_eq!(token.access_token, "second-token");
        assert!(token.expiry.is_some());
    }

    #[test]
    fn credentials_set_bearer_header() {
        let mut creds = PerRpcCredentials::new(Some(Arc::new(StaticTokenSource::new(
            Token::new("secret"),
        ))));

        let request = creds.call(Request::new(())).expect("intercepted");

        assert_eq!(
            request
                .metadata()
                .get("authorization")
                .and_then(|v| v.to_str().ok()),
            Some("Bearer secret")
        );
    }

    #[test]
    fn no_source_leaves_request_untouched() {
        let mut creds = PerRpcCredentials::default();
        let request = creds.call(Request::new(())).expect("intercepted");
        assert!(request.metadata().get("authorization").is_none());
    }
}
