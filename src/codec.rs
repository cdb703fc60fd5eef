//! The line protocol spoken with helper processes (squid-2.5 `ntlmssp`,
//! `gss-spnego` and `basic` helper protocols).
//!
//! Requests:
//!
//! | line                  | meaning                                  |
//! |-----------------------|------------------------------------------|
//! | `YR <token>`          | first leg of an NTLM/Negotiate handshake |
//! | `KK <token>`          | every later leg                          |
//! | `<user> <password>`   | Basic credential check                   |
//!
//! Replies are `<CODE> <rest>`: `TT` (challenge), `AF` (done), `NA` (rejected),
//! `BH` (broken helper), and `OK`/`ERR` for Basic. The Negotiate helper splits
//! `rest` once more into `<token> <argument>`, where `*` stands for "no token".
use std::borrow::Cow;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;

use crate::Mechanism;

/// Upper bound of a single helper line, newline included
pub const MAX_LINE_LEN: usize = 8192;

/// Characters escaped in Basic credentials, so a user or password can neither
/// split the line nor end it early. The helper unescapes both fields.
const CREDENTIAL_ESCAPE: &AsciiSet = &CONTROLS.add(b' ').add(b'%');

/// Marks an absent token in Negotiate replies
const NO_TOKEN: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("helper line is not newline terminated")]
    Unterminated,
    #[error("helper line too short ({0} bytes)")]
    TooShort(usize),
    #[error("no separator after code in '{0}'")]
    MissingSeparator(String),
    #[error("unknown helper code in '{0}'")]
    UnknownCode(String),
    #[error("helper reply lacks {0}")]
    MissingField(&'static str),
    #[error("invalid request verb '{0}'")]
    InvalidVerb(String),
    #[error("token contains whitespace or control characters")]
    InvalidToken,
    #[error("credential field is not valid UTF-8 after unescaping")]
    Encoding,
}

/// Leg of a handshake, as announced to the helper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// `YR`: a fresh handshake, the helper drops any earlier state
    Yr,
    /// `KK`: continue the current handshake
    Kk,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Yr => "YR",
            Verb::Kk => "KK",
        }
    }

    #[cfg(test)]
    fn parse(s: &str) -> Option<Verb> {
        match s {
            "YR" => Some(Verb::Yr),
            "KK" => Some(Verb::Kk),
            _ => None,
        }
    }
}

/// One line written to a helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperRequest<'a> {
    Handshake { verb: Verb, token: Cow<'a, str> },
    Plaintext { user: Cow<'a, str>, password: Cow<'a, str> },
}

fn is_token(token: &str) -> bool {
    !token.is_empty() && !token.chars().any(|c| c.is_whitespace() || c.is_control())
}

fn strip_newline(line: &str) -> Result<&str, ProtocolError> {
    let line = line.strip_suffix('\n').ok_or(ProtocolError::Unterminated)?;
    Ok(line.strip_suffix('\r').unwrap_or(line))
}

impl<'a> HelperRequest<'a> {
    pub fn handshake<T: Into<Cow<'a, str>>>(verb: Verb, token: T) -> HelperRequest<'a> {
        HelperRequest::Handshake { verb, token: token.into() }
    }

    pub fn plaintext<U, P>(user: U, password: P) -> HelperRequest<'a>
    where
        U: Into<Cow<'a, str>>,
        P: Into<Cow<'a, str>>,
    {
        HelperRequest::Plaintext { user: user.into(), password: password.into() }
    }

    /// Render the newline terminated line sent to the helper
    pub fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            HelperRequest::Handshake { verb, token } => {
                if !is_token(token) {
                    return Err(ProtocolError::InvalidToken);
                }
                Ok(format!("{} {}\n", verb.as_str(), token))
            }
            HelperRequest::Plaintext { user, password } => Ok(format!(
                "{} {}\n",
                utf8_percent_encode(user, CREDENTIAL_ESCAPE),
                utf8_percent_encode(password, CREDENTIAL_ESCAPE)
            )),
        }
    }

    /// Parse a request line as a helper would read it
    #[cfg(test)]
    pub(crate) fn decode(mechanism: Mechanism, line: &str) -> Result<HelperRequest<'static>, ProtocolError> {
        use percent_encoding::percent_decode_str;

        let line = strip_newline(line)?;
        let (head, tail) = line
            .split_once(' ')
            .ok_or_else(|| ProtocolError::MissingSeparator(line.to_owned()))?;

        if mechanism.is_handshake() {
            let verb = Verb::parse(head).ok_or_else(|| ProtocolError::InvalidVerb(head.to_owned()))?;
            if !is_token(tail) {
                return Err(ProtocolError::InvalidToken);
            }
            return Ok(HelperRequest::Handshake { verb, token: Cow::Owned(tail.to_owned()) });
        }

        let unescape = |field: &str| -> Result<Cow<'static, str>, ProtocolError> {
            percent_decode_str(field)
                .decode_utf8()
                .map(|s| Cow::Owned(s.into_owned()))
                .map_err(|_| ProtocolError::Encoding)
        };
        Ok(HelperRequest::Plaintext { user: unescape(head)?, password: unescape(tail)? })
    }

    /// The line without secrets, for logging
    pub fn redacted(&self) -> String {
        match self {
            HelperRequest::Handshake { verb, token } => format!("{} {}", verb.as_str(), token),
            HelperRequest::Plaintext { user, .. } => format!("{} ****", user),
        }
    }
}

/// One decoded line read from a helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperReply {
    /// `TT`: relay `token` to the client and wait for its next leg
    Challenge { token: String },
    /// `AF`: done. Negotiate may hand over a final (mutual authentication) token
    Authenticated { principal: String, token: Option<String> },
    /// `NA`: the credentials were refused
    NotAuthenticated { detail: String, token: Option<String> },
    /// `BH`: the helper itself failed
    BrokenHelper { detail: String },
    /// `OK`: Basic credentials accepted
    PlaintextOk,
    /// `ERR`: Basic credentials refused
    PlaintextErr { detail: String },
}

fn optional_token(token: &str) -> Option<String> {
    if token.is_empty() || token == NO_TOKEN {
        None
    } else {
        Some(token.to_owned())
    }
}

fn required<'s>(field: &'s str, name: &'static str) -> Result<&'s str, ProtocolError> {
    if field.is_empty() {
        Err(ProtocolError::MissingField(name))
    } else {
        Ok(field)
    }
}

impl HelperReply {
    /// Decode a raw line (newline included) read from the helper of `mechanism`.
    ///
    /// Anything that is not one of the known codes with the layout expected for
    /// the mechanism is an error, and callers treat it exactly like `BH`.
    pub fn decode(mechanism: Mechanism, raw: &str) -> Result<HelperReply, ProtocolError> {
        let line = strip_newline(raw)?;

        if mechanism == Mechanism::Basic {
            return Self::decode_plaintext(line);
        }

        let (code, rest) = match line.split_once(' ') {
            Some(parts) => parts,
            None if line.len() < 2 => return Err(ProtocolError::TooShort(line.len())),
            None => return Err(ProtocolError::MissingSeparator(line.to_owned())),
        };

        match (mechanism, code) {
            (_, "BH") => Ok(HelperReply::BrokenHelper { detail: rest.to_owned() }),
            (Mechanism::Negotiate, "TT" | "AF" | "NA") => {
                // <code> <token> <argument>
                let (token, argument) = rest
                    .split_once(' ')
                    .ok_or_else(|| ProtocolError::MissingSeparator(line.to_owned()))?;
                match code {
                    "TT" => {
                        let token = optional_token(token).ok_or(ProtocolError::MissingField("challenge token"))?;
                        Ok(HelperReply::Challenge { token })
                    }
                    "AF" => Ok(HelperReply::Authenticated {
                        principal: required(argument, "principal")?.to_owned(),
                        token: optional_token(token),
                    }),
                    _ => Ok(HelperReply::NotAuthenticated {
                        detail: argument.to_owned(),
                        token: optional_token(token),
                    }),
                }
            }
            (_, "TT") => Ok(HelperReply::Challenge { token: required(rest, "challenge token")?.to_owned() }),
            (_, "AF") => Ok(HelperReply::Authenticated {
                principal: required(rest, "principal")?.to_owned(),
                token: None,
            }),
            (_, "NA") => Ok(HelperReply::NotAuthenticated { detail: rest.to_owned(), token: None }),
            _ => Err(ProtocolError::UnknownCode(line.to_owned())),
        }
    }

    fn decode_plaintext(line: &str) -> Result<HelperReply, ProtocolError> {
        if line.len() < 2 {
            return Err(ProtocolError::TooShort(line.len()));
        }
        if line.starts_with("OK") {
            Ok(HelperReply::PlaintextOk)
        } else if let Some(detail) = line.strip_prefix("ERR") {
            Ok(HelperReply::PlaintextErr { detail: detail.trim_start().to_owned() })
        } else if let Some(detail) = line.strip_prefix("BH") {
            Ok(HelperReply::BrokenHelper { detail: detail.trim_start().to_owned() })
        } else {
            Err(ProtocolError::UnknownCode(line.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_handshake_lines() {
        let yr = HelperRequest::handshake(Verb::Yr, "TlRMTVNTUAABAAAA");
        assert_eq!(yr.encode().unwrap(), "YR TlRMTVNTUAABAAAA\n");
        let kk = HelperRequest::handshake(Verb::Kk, "TlRMTVNTUAADAAAA");
        assert_eq!(kk.encode().unwrap(), "KK TlRMTVNTUAADAAAA\n");
    }

    #[test]
    fn refuses_tokens_that_would_break_the_line() {
        for token in ["", "abc def", "abc\nKK x", "abc\r"] {
            let req = HelperRequest::handshake(Verb::Yr, token);
            assert_eq!(req.encode(), Err(ProtocolError::InvalidToken), "{:?}", token);
        }
    }

    #[test]
    fn escapes_plaintext_credentials() {
        let req = HelperRequest::plaintext("bob", "secret");
        assert_eq!(req.encode().unwrap(), "bob secret\n");

        let req = HelperRequest::plaintext("DOM\\bob smith", "50% off\n");
        let line = req.encode().unwrap();
        assert_eq!(line, "DOM\\bob%20smith 50%25%20off%0A\n");
        assert_eq!(HelperRequest::decode(Mechanism::Basic, &line).unwrap(), req);
        assert_eq!(req.redacted(), "DOM\\bob smith ****");
    }

    #[test]
    fn decodes_ntlm_replies() {
        assert_eq!(
            HelperReply::decode(Mechanism::Ntlm, "TT TlRMTVNTUAACAAAA\n").unwrap(),
            HelperReply::Challenge { token: "TlRMTVNTUAACAAAA".into() }
        );
        // the whole remainder is the principal, spaces included
        assert_eq!(
            HelperReply::decode(Mechanism::Ntlm, "AF DOMAIN\\alice smith\n").unwrap(),
            HelperReply::Authenticated { principal: "DOMAIN\\alice smith".into(), token: None }
        );
        assert_eq!(
            HelperReply::decode(Mechanism::Ntlm, "NA Logon failure\n").unwrap(),
            HelperReply::NotAuthenticated { detail: "Logon failure".into(), token: None }
        );
        assert_eq!(
            HelperReply::decode(Mechanism::Ntlm, "NA \n").unwrap(),
            HelperReply::NotAuthenticated { detail: "".into(), token: None }
        );
        assert_eq!(
            HelperReply::decode(Mechanism::Ntlm, "BH winbind down\r\n").unwrap(),
            HelperReply::BrokenHelper { detail: "winbind down".into() }
        );
    }

    #[test]
    fn decodes_negotiate_replies() {
        assert_eq!(
            HelperReply::decode(Mechanism::Negotiate, "AF * alice\n").unwrap(),
            HelperReply::Authenticated { principal: "alice".into(), token: None }
        );
        assert_eq!(
            HelperReply::decode(Mechanism::Negotiate, "AF dG9rZW4= alice\n").unwrap(),
            HelperReply::Authenticated { principal: "alice".into(), token: Some("dG9rZW4=".into()) }
        );
        assert_eq!(
            HelperReply::decode(Mechanism::Negotiate, "TT oRQwEqADCgEBoQsGCSqGSIb3 *\n").unwrap(),
            HelperReply::Challenge { token: "oRQwEqADCgEBoQsGCSqGSIb3".into() }
        );
        assert_eq!(
            HelperReply::decode(Mechanism::Negotiate, "NA oQcwBaADCgEC NT_STATUS_LOGON_FAILURE\n").unwrap(),
            HelperReply::NotAuthenticated {
                detail: "NT_STATUS_LOGON_FAILURE".into(),
                token: Some("oQcwBaADCgEC".into()),
            }
        );
        assert_eq!(
            HelperReply::decode(Mechanism::Negotiate, "AF alice\n"),
            Err(ProtocolError::MissingSeparator("AF alice".into()))
        );
        assert_eq!(
            HelperReply::decode(Mechanism::Negotiate, "TT * *\n"),
            Err(ProtocolError::MissingField("challenge token"))
        );
    }

    #[test]
    fn rejects_malformed_replies() {
        for line in ["", "\n", "A\n", "AF\n", "TT\n", "NA", "XX something\n", "OK\n", "AF \n", "TT \n"] {
            assert!(HelperReply::decode(Mechanism::Ntlm, line).is_err(), "{:?}", line);
        }
        assert_eq!(HelperReply::decode(Mechanism::Ntlm, "A\n"), Err(ProtocolError::TooShort(1)));
        assert_eq!(HelperReply::decode(Mechanism::Ntlm, "AF alice"), Err(ProtocolError::Unterminated));
    }

    #[test]
    fn decodes_plaintext_replies() {
        assert_eq!(HelperReply::decode(Mechanism::Basic, "OK\n").unwrap(), HelperReply::PlaintextOk);
        assert_eq!(
            HelperReply::decode(Mechanism::Basic, "ERR\n").unwrap(),
            HelperReply::PlaintextErr { detail: "".into() }
        );
        assert_eq!(
            HelperReply::decode(Mechanism::Basic, "ERR Wrong password\n").unwrap(),
            HelperReply::PlaintextErr { detail: "Wrong password".into() }
        );
        assert_eq!(HelperReply::decode(Mechanism::Basic, "O\n"), Err(ProtocolError::TooShort(1)));
        assert!(HelperReply::decode(Mechanism::Basic, "MAYBE\n").is_err());
    }

    proptest! {
        #[test]
        fn handshake_requests_round_trip(token in "[A-Za-z0-9+/]{1,256}={0,2}", continuation in any::<bool>()) {
            let verb = if continuation { Verb::Kk } else { Verb::Yr };
            let line = HelperRequest::handshake(verb, token.as_str()).encode().unwrap();
            for mechanism in [Mechanism::Ntlm, Mechanism::Negotiate] {
                match HelperRequest::decode(mechanism, &line).unwrap() {
                    HelperRequest::Handshake { verb: v, token: t } => {
                        prop_assert_eq!(v, verb);
                        prop_assert_eq!(t.as_ref(), token.as_str());
                    }
                    other => prop_assert!(false, "unexpected {:?}", other),
                }
            }
        }

        #[test]
        fn plaintext_requests_round_trip(user in "\\PC*", password in "\\PC*") {
            let request = HelperRequest::plaintext(user.as_str(), password.as_str());
            let line = request.encode().unwrap();
            prop_assert_eq!(line.matches('\n').count(), 1);
            prop_assert_eq!(line.matches(' ').count(), 1);
            prop_assert_eq!(HelperRequest::decode(Mechanism::Basic, &line).unwrap(), request);
        }
    }
}
