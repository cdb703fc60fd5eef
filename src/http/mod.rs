//! Components to perform helper-based authentication with a generic http library
use crate::config::AuthConfig;
use crate::orchestrator::{AuthRequest, Authenticator, Verdict};
use crate::{ConnectionId, Generation, Mechanism, Mechanisms};

pub const AUTHORIZATION: &str = "Authorization";
pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
pub const PROXY_AUTHENTICATE: &str = "Proxy-Authenticate";

/// Request header carrying the client's credentials
pub fn authorization_header(proxy: bool) -> &'static str {
    if proxy {
        PROXY_AUTHORIZATION
    } else {
        AUTHORIZATION
    }
}

/// Response header carrying challenges
pub fn authenticate_header(proxy: bool) -> &'static str {
    if proxy {
        PROXY_AUTHENTICATE
    } else {
        WWW_AUTHENTICATE
    }
}

/// The response, that the user of the API is expected to transform into a HTTP response to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub headers: Vec<(&'static str, String)>,
    pub status_code: u16,
    /// The connection must stay open: the client answers the challenge on the same socket
    pub keep_alive: bool,
}

/// The current authentication state that incoming data transitioned into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Authentication was performed. `headers` go out with the regular response.
    Success {
        user: String,
        mechanism: Mechanism,
        headers: Vec<(&'static str, String)>,
    },
    /// An authentication HTTP response that should be sent to the client instead of serving the request
    Response(Response),
    /// The request isn't ours to authenticate
    Declined,
}

fn challenges(enabled: Mechanisms, realm: &str, negotiate_token: Option<&str>) -> Vec<String> {
    enabled
        .advertised()
        .map(|mechanism| match mechanism {
            Mechanism::Negotiate => match negotiate_token {
                Some(token) => format!("{} {}", mechanism, token),
                None => mechanism.to_string(),
            },
            Mechanism::Ntlm => mechanism.to_string(),
            Mechanism::Basic => format!("{} realm=\"{}\"", mechanism, realm),
        })
        .collect()
}

impl Verdict {
    /// Translate into what the HTTP layer has to do
    pub fn into_auth_state(self, config: &AuthConfig, proxy: bool) -> AuthState {
        let header = authenticate_header(proxy);
        let unauthorized = if proxy { 407 } else { 401 };

        match self {
            Verdict::Authenticated { principal, mechanism, final_token } => AuthState::Success {
                user: principal,
                mechanism,
                headers: final_token
                    .map(|token| (header, format!("{} {}", mechanism, token)))
                    .into_iter()
                    .collect(),
            },
            Verdict::ChallengeRequired { mechanism, token } => AuthState::Response(Response {
                headers: vec![(header, format!("{} {}", mechanism, token))],
                status_code: unauthorized,
                keep_alive: true,
            }),
            Verdict::Rejected { negotiate_token, refused } => AuthState::Response(Response {
                headers: challenges(config.mechanisms(), &config.basic_realm, negotiate_token.as_deref())
                    .into_iter()
                    .map(|value| (header, value))
                    .collect(),
                status_code: unauthorized,
                // a client that has not tried yet answers on the same socket
                keep_alive: !refused,
            }),
            Verdict::Declined => AuthState::Declined,
            Verdict::InternalError => AuthState::Response(Response {
                headers: Vec::new(),
                status_code: 500,
                keep_alive: false,
            }),
        }
    }
}

impl Authenticator {
    /// Performs authentication against a received request from the client.
    /// If authentication is incomplete, the caller is instructed through AuthState::Response
    /// to send the http response contained in it (401/407) to the client, which retries
    /// on the same connection with its next token.
    pub fn http_incoming_auth<'a, R>(
        &self,
        connection: ConnectionId,
        generation: Generation,
        proxy: bool,
        get_header: R,
    ) -> AuthState
    where
        R: Fn(&'static str) -> Option<&'a str>,
    {
        let request = AuthRequest::new(connection, generation)
            .proxy(proxy)
            .authorization(get_header(authorization_header(proxy)));
        self.authenticate(&request).into_auth_state(self.config(), proxy)
    }
}
