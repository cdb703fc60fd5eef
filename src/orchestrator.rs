//! The per-request entry point.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine as _;
use log::{debug, error, info, warn};

use crate::cache::{CacheCheck, CachedIdentity, ConnectionAuthCache, ConnectionId, Generation};
use crate::config::{AuthConfig, HelperScope};
use crate::handshake::{HandshakeExchange, HandshakeOutcome, HandshakeStateMachine, Round};
use crate::helper::{HelperKey, HelperLauncher, HelperRegistry, ProcessLauncher};
use crate::{AuthError, Mechanism, Mechanisms};

/// What the boundary knows about one incoming request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRequest<'a> {
    pub connection: ConnectionId,
    pub generation: Generation,
    /// Credentials come from `Proxy-Authorization` and challenges go out as `Proxy-Authenticate`
    pub proxy: bool,
    /// The raw `Authorization` (or `Proxy-Authorization`) header value
    pub authorization: Option<&'a str>,
}

impl<'a> AuthRequest<'a> {
    pub fn new(connection: ConnectionId, generation: Generation) -> AuthRequest<'a> {
        AuthRequest { connection, generation, proxy: false, authorization: None }
    }

    pub fn authorization(mut self, header: Option<&'a str>) -> AuthRequest<'a> {
        self.authorization = header;
        self
    }

    pub fn proxy(mut self, proxy: bool) -> AuthRequest<'a> {
        self.proxy = proxy;
        self
    }
}

/// The outcome handed back to the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Authenticated {
        principal: String,
        mechanism: Mechanism,
        /// Negotiate mutual authentication token to return with the response
        final_token: Option<String>,
    },
    /// Send `<mechanism> <token>` back with a 401 and keep the connection open
    ChallengeRequired { mechanism: Mechanism, token: String },
    /// Answer 401 advertising every enabled mechanism
    Rejected {
        /// Negotiate token the helper attached to its rejection
        negotiate_token: Option<String>,
        /// Credentials were presented and turned down; false when the client sent none yet
        refused: bool,
    },
    /// Not ours to handle; let other authentication run
    Declined,
    InternalError,
}

impl Verdict {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Verdict::Authenticated { .. })
    }
}

/// Authenticates requests through helper processes, remembering identities per connection
pub struct Authenticator {
    config: AuthConfig,
    mechanisms: Mechanisms,
    helpers: HelperRegistry,
    cache: ConnectionAuthCache,
    next_connection: AtomicU64,
}

impl Authenticator {
    /// Authenticator spawning real helper processes
    pub fn new(config: AuthConfig) -> Authenticator {
        Self::with_launcher(config, ProcessLauncher)
    }

    pub fn with_launcher<L: HelperLauncher + 'static>(config: AuthConfig, launcher: L) -> Authenticator {
        let helpers = HelperRegistry::new(launcher).with_max_line_len(config.max_line_len);
        Authenticator {
            mechanisms: config.mechanisms(),
            config,
            helpers,
            cache: ConnectionAuthCache::new(),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn cache(&self) -> &ConnectionAuthCache {
        &self.cache
    }

    pub fn helpers(&self) -> &HelperRegistry {
        &self.helpers
    }

    /// Allocate an id for a new client connection. Dropping the scope forgets the
    /// connection's identity and releases helpers scoped to it.
    pub fn open_connection(self: &Arc<Self>) -> ConnectionScope {
        let id = ConnectionId::from(self.next_connection.fetch_add(1, Ordering::Relaxed));
        debug!("connection {} opened", id);
        ConnectionScope { id, authenticator: Arc::clone(self) }
    }

    /// Forget everything about a connection that has gone away
    pub fn connection_closed(&self, connection: ConnectionId) {
        debug!("connection {} closed", connection);
        self.cache.invalidate(connection);
        if self.config.helper_scope == HelperScope::PerConnection {
            self.helpers.release_connection(connection);
        }
    }

    /// Terminate all helpers. Later requests spawn them again.
    pub fn shutdown(&self) {
        self.helpers.shutdown();
    }

    /// Run one request through authentication
    pub fn authenticate(&self, request: &AuthRequest<'_>) -> Verdict {
        let connection = request.connection;
        let header = request.authorization.map(str::trim).filter(|h| !h.is_empty());

        match self.cache.check(connection, request.generation, header.is_some()) {
            CacheCheck::Reuse(identity) => {
                debug!("connection {} already authenticated as '{}' via {}", connection, identity.user, identity.mechanism);
                return Verdict::Authenticated {
                    principal: identity.user,
                    mechanism: identity.mechanism,
                    final_token: None,
                };
            }
            CacheCheck::Invalidated(identity) => {
                debug!("connection {} re-authenticating, dropped '{}'", connection, identity.user);
            }
            CacheCheck::Miss => {}
        }

        let Some(header) = header else {
            debug!("connection {}: no credentials, sending challenges", connection);
            self.cache.invalidate(connection);
            return Verdict::Rejected { negotiate_token: None, refused: false };
        };

        let (scheme, credentials) = match header.split_once(' ') {
            Some((scheme, credentials)) => (scheme, credentials.trim()),
            None => (header, ""),
        };
        let mechanism = match Mechanism::from_scheme(scheme) {
            Some(mechanism) if self.mechanisms.allows(mechanism) => mechanism,
            _ => {
                debug!("connection {}: declining scheme '{}'", connection, scheme);
                self.cache.invalidate(connection);
                return Verdict::Declined;
            }
        };

        if mechanism.is_handshake() {
            self.handshake(request, mechanism, credentials)
        } else {
            self.basic(request, credentials)
        }
    }

    fn handshake(&self, request: &AuthRequest<'_>, mechanism: Mechanism, token: &str) -> Verdict {
        let connection = request.connection;
        if token.is_empty() || base64::engine::general_purpose::STANDARD.decode(token).is_err() {
            info!("connection {}: malformed {} token", connection, mechanism);
            self.cache.invalidate(connection);
            return self.rejection(None);
        }

        let round = match self.cache.pending(connection) {
            Some(pending) if pending.mechanism == mechanism => {
                if pending.challenges >= self.config.max_rounds {
                    let err = AuthError::RoundLimit(self.config.max_rounds);
                    warn!("connection {}: {} {}", connection, mechanism, err);
                    self.cache.invalidate(connection);
                    return Verdict::InternalError;
                }
                Round::Continuation
            }
            _ => Round::Initial,
        };

        let exchange = HandshakeExchange { mechanism, token, round };
        let machine = HandshakeStateMachine::new(&self.helpers);
        match machine.step(self.helper_key(mechanism, connection), self.config.helper_command(mechanism), &exchange) {
            HandshakeOutcome::Challenge { token } => {
                let challenges = self.cache.note_challenge(connection, mechanism);
                debug!("connection {}: {} challenge {}", connection, mechanism, challenges);
                Verdict::ChallengeRequired { mechanism, token }
            }
            HandshakeOutcome::Authenticated { principal, final_token } => {
                self.remember(request, &principal, mechanism);
                Verdict::Authenticated { principal, mechanism, final_token }
            }
            HandshakeOutcome::Rejected { detail, token } => {
                info!("connection {}: {} authentication failed: {}", connection, mechanism, detail);
                self.cache.invalidate(connection);
                self.rejection(token.filter(|_| mechanism == Mechanism::Negotiate))
            }
            HandshakeOutcome::Broken(err) => self.broken(connection, mechanism, err),
        }
    }

    fn basic(&self, request: &AuthRequest<'_>, credentials: &str) -> Verdict {
        let connection = request.connection;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(credentials)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let Some(decoded) = decoded else {
            info!("connection {}: malformed Basic credentials", connection);
            self.cache.invalidate(connection);
            return self.rejection(None);
        };
        // no colon means an empty password
        let (user, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));

        let machine = HandshakeStateMachine::new(&self.helpers);
        let key = self.helper_key(Mechanism::Basic, connection);
        match machine.verify_plaintext(key, self.config.helper_command(Mechanism::Basic), user, password) {
            HandshakeOutcome::Authenticated { principal, .. } => {
                self.remember(request, &principal, Mechanism::Basic);
                Verdict::Authenticated { principal, mechanism: Mechanism::Basic, final_token: None }
            }
            HandshakeOutcome::Rejected { detail, .. } => {
                info!("connection {}: Basic authentication failed for '{}': {}", connection, user, detail);
                self.cache.invalidate(connection);
                self.rejection(None)
            }
            HandshakeOutcome::Challenge { .. } => {
                self.broken(connection, Mechanism::Basic, AuthError::BrokenHelper("challenge to a Basic check".into()))
            }
            HandshakeOutcome::Broken(err) => self.broken(connection, Mechanism::Basic, err),
        }
    }

    fn remember(&self, request: &AuthRequest<'_>, principal: &str, mechanism: Mechanism) {
        info!("connection {} authenticated as '{}' via {}", request.connection, principal, mechanism);
        self.cache.store(
            request.connection,
            CachedIdentity { user: principal.to_owned(), mechanism, generation: request.generation },
        );
    }

    fn broken(&self, connection: ConnectionId, mechanism: Mechanism, err: AuthError) -> Verdict {
        error!("connection {}: {} authentication error: {}", connection, mechanism, err);
        self.cache.invalidate(connection);
        Verdict::InternalError
    }

    fn rejection(&self, negotiate_token: Option<String>) -> Verdict {
        if self.config.authoritative {
            Verdict::Rejected { negotiate_token, refused: true }
        } else {
            Verdict::Declined
        }
    }

    fn helper_key(&self, mechanism: Mechanism, connection: ConnectionId) -> HelperKey {
        match self.config.helper_scope {
            HelperScope::Shared => HelperKey::from(mechanism),
            HelperScope::PerConnection => HelperKey::per_connection(mechanism, connection),
        }
    }
}

/// A live client connection. Dropping it tears the connection's state down.
pub struct ConnectionScope {
    id: ConnectionId,
    authenticator: Arc<Authenticator>,
}

impl ConnectionScope {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    /// A request on this connection
    pub fn request<'a>(&self, generation: Generation) -> AuthRequest<'a> {
        AuthRequest::new(self.id, generation)
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        self.authenticator.connection_closed(self.id);
    }
}
