//! One step of an NTLM/Negotiate exchange, or a single Basic credential check.
//!
//! The state machine keeps no state of its own between calls. Every HTTP request
//! carries one client token, the helper gets exactly one line for it and answers with
//! exactly one line. Whether that line starts a handshake (`YR`) or continues one
//! (`KK`) is decided by the caller from the connection's pending record.
use log::{debug, error, warn};

use crate::codec::{HelperReply, HelperRequest, ProtocolError, Verb};
use crate::helper::{HelperCommand, HelperHandle, HelperKey, HelperRegistry};
use crate::{AuthError, Mechanism};

/// Whether the client token opens a handshake or answers a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round {
    Initial,
    Continuation,
}

impl Round {
    pub fn verb(self) -> Verb {
        match self {
            Round::Initial => Verb::Yr,
            Round::Continuation => Verb::Kk,
        }
    }
}

/// The inputs of a single handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeExchange<'a> {
    pub mechanism: Mechanism,
    /// base64 token from the client, scheme already stripped
    pub token: &'a str,
    pub round: Round,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    AwaitingHelperReply,
    ChallengeIssued,
    Authenticated,
    Rejected,
    Broken,
}

/// Where a step ended up
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Relay `token` to the client and wait for its next leg
    Challenge { token: String },
    Authenticated {
        principal: String,
        /// Negotiate only: mutual authentication token for the client
        final_token: Option<String>,
    },
    Rejected {
        detail: String,
        /// Negotiate only: token accompanying the rejection
        token: Option<String>,
    },
    /// The helper failed or misbehaved. It has been destroyed if it was at fault.
    Broken(AuthError),
}

impl HandshakeOutcome {
    pub fn state(&self) -> HandshakeState {
        match self {
            HandshakeOutcome::Challenge { .. } => HandshakeState::ChallengeIssued,
            HandshakeOutcome::Authenticated { .. } => HandshakeState::Authenticated,
            HandshakeOutcome::Rejected { .. } => HandshakeState::Rejected,
            HandshakeOutcome::Broken(_) => HandshakeState::Broken,
        }
    }
}

/// Drives exchanges through the helpers of a registry
pub struct HandshakeStateMachine<'r> {
    registry: &'r HelperRegistry,
}

impl<'r> HandshakeStateMachine<'r> {
    pub fn new(registry: &'r HelperRegistry) -> HandshakeStateMachine<'r> {
        HandshakeStateMachine { registry }
    }

    /// Advance an NTLM/Negotiate handshake by one step
    pub fn step(&self, key: HelperKey, command: &HelperCommand, exchange: &HandshakeExchange<'_>) -> HandshakeOutcome {
        debug_assert!(exchange.mechanism.is_handshake());
        debug!("{} handshake {:?} -> {:?}", exchange.mechanism, HandshakeState::Start, HandshakeState::AwaitingHelperReply);

        let request = HelperRequest::handshake(exchange.round.verb(), exchange.token);
        let outcome = match self.exchange(key, command, &request) {
            Ok((_, HelperReply::Challenge { token })) => HandshakeOutcome::Challenge { token },
            Ok((_, HelperReply::Authenticated { principal, token })) => {
                HandshakeOutcome::Authenticated { principal, final_token: token }
            }
            Ok((_, HelperReply::NotAuthenticated { detail, token })) => HandshakeOutcome::Rejected { detail, token },
            Ok((helper, other)) => self.unexpected(&helper, other),
            Err(err) => HandshakeOutcome::Broken(err),
        };
        debug!("{} handshake -> {:?}", exchange.mechanism, outcome.state());
        outcome
    }

    /// Check a user/password pair with the plaintext helper in one round trip
    pub fn verify_plaintext(&self, key: HelperKey, command: &HelperCommand, user: &str, password: &str) -> HandshakeOutcome {
        let request = HelperRequest::plaintext(user, password);
        match self.exchange(key, command, &request) {
            Ok((_, HelperReply::PlaintextOk)) => HandshakeOutcome::Authenticated {
                principal: user.to_owned(),
                final_token: None,
            },
            Ok((_, HelperReply::PlaintextErr { detail })) => HandshakeOutcome::Rejected { detail, token: None },
            Ok((helper, other)) => self.unexpected(&helper, other),
            Err(err) => HandshakeOutcome::Broken(err),
        }
    }

    /// Write one request line, read and decode one reply.
    /// Malformed replies and `BH` destroy the helper.
    fn exchange(
        &self,
        key: HelperKey,
        command: &HelperCommand,
        request: &HelperRequest<'_>,
    ) -> Result<(HelperHandle, HelperReply), AuthError> {
        let line = request.encode()?;
        let helper = self.registry.acquire(key, command)?;

        debug!("to {} helper {:?}: {}", key.mechanism, helper.pid(), request.redacted());
        let raw = self.registry.transact(&helper, &line)?;
        debug!("from {} helper {:?}: {}", key.mechanism, helper.pid(), raw.trim_end());

        match HelperReply::decode(key.mechanism, &raw) {
            Ok(HelperReply::BrokenHelper { detail }) => {
                error!("{} helper {:?} reports BH: {}", key.mechanism, helper.pid(), detail);
                self.registry.destroy(&helper);
                Err(AuthError::BrokenHelper(detail))
            }
            Ok(reply) => Ok((helper, reply)),
            Err(err) => {
                error!("{} helper {:?} sent garbage '{}': {}", key.mechanism, helper.pid(), raw.trim_end(), err);
                self.registry.destroy(&helper);
                Err(err.into())
            }
        }
    }

    /// A well-formed reply that has no place in this kind of exchange
    fn unexpected(&self, helper: &HelperHandle, reply: HelperReply) -> HandshakeOutcome {
        warn!("{} helper {:?} answered out of turn: {:?}", helper.key().mechanism, helper.pid(), reply);
        self.registry.destroy(helper);
        HandshakeOutcome::Broken(AuthError::Protocol(ProtocolError::UnknownCode(format!("{:?}", reply))))
    }
}
