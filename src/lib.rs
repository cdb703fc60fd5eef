//! HTTP authentication (NTLM, Negotiate/SPNEGO and Basic) delegated to an external
//! helper process speaking the squid-2.5 / `ntlm_auth` line protocol.
//!
//! The crate does no cryptography itself. Every token a client sends is relayed to a
//! long-lived helper (usually Samba's `ntlm_auth`), and the helper's answer decides
//! whether the client gets another challenge, is authenticated, or is rejected.
//! Once a connection is authenticated the identity is cached for that connection,
//! so later requests on the same keep-alive socket skip the handshake.
//!
//! The pieces, leaf first:
//! - [`helper`]: spawning, reusing and destroying helper processes
//! - [`codec`]: the request/response lines exchanged with a helper
//! - [`handshake`]: one step of an NTLM/Negotiate exchange (or a Basic check)
//! - [`cache`]: the per-connection identity record
//! - [`orchestrator`]: the per-request entry point producing a [`Verdict`]
//! - [`http`]: turning verdicts into headers and status codes for any HTTP library
use std::fmt;

use bitflags::bitflags;

pub mod cache;
pub mod codec;
pub mod config;
mod error;
pub mod handshake;
pub mod helper;
pub mod http;
pub mod orchestrator;

#[cfg(test)]
mod test_support;

pub use cache::{CachedIdentity, ConnectionAuthCache, ConnectionId, Generation};
pub use config::{AuthConfig, HelperScope};
pub use error::{AuthError, ConfigError};
pub use helper::{HelperCommand, HelperRegistry, ProcessLauncher};
pub use orchestrator::{AuthRequest, Authenticator, ConnectionScope, Verdict};

pub(crate) const NTLM_AUTH_NAME: &str = "NTLM";
pub(crate) const NEGOTIATE_AUTH_NAME: &str = "Negotiate";
pub(crate) const BASIC_AUTH_NAME: &str = "Basic";

/// An HTTP authentication scheme handled through a helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Ntlm,
    Negotiate,
    Basic,
}

impl Mechanism {
    /// The scheme token as it appears in `Authorization`/`WWW-Authenticate` headers
    pub fn scheme(self) -> &'static str {
        match self {
            Mechanism::Ntlm => NTLM_AUTH_NAME,
            Mechanism::Negotiate => NEGOTIATE_AUTH_NAME,
            Mechanism::Basic => BASIC_AUTH_NAME,
        }
    }

    /// Match a scheme token, ignoring ASCII case (RFC 7235 2.1)
    pub fn from_scheme(scheme: &str) -> Option<Mechanism> {
        [Mechanism::Negotiate, Mechanism::Ntlm, Mechanism::Basic]
            .into_iter()
            .find(|m| m.scheme().eq_ignore_ascii_case(scheme))
    }

    /// Whether authenticating with this mechanism takes more than one round trip
    pub fn is_handshake(self) -> bool {
        !matches!(self, Mechanism::Basic)
    }

    pub fn flag(self) -> Mechanisms {
        match self {
            Mechanism::Ntlm => Mechanisms::NTLM,
            Mechanism::Negotiate => Mechanisms::NEGOTIATE,
            Mechanism::Basic => Mechanisms::BASIC,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

bitflags! {
    /// The set of mechanisms enabled for a location
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Mechanisms: u8 {
        const NTLM = 1 << 0;
        const NEGOTIATE = 1 << 1;
        const BASIC = 1 << 2;
    }
}

impl Mechanisms {
    /// Whether `mechanism` is part of this set
    pub fn allows(self, mechanism: Mechanism) -> bool {
        self.contains(mechanism.flag())
    }

    /// Enabled mechanisms in the order their challenges are advertised.
    /// Some clients answer the first offered scheme, not the strongest one,
    /// so Negotiate goes first.
    pub fn advertised(self) -> impl Iterator<Item = Mechanism> {
        [Mechanism::Negotiate, Mechanism::Ntlm, Mechanism::Basic]
            .into_iter()
            .filter(move |m| self.allows(*m))
    }
}
