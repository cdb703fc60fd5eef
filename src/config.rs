//! Authentication settings, loaded from TOML.
//!
//! ```toml
//! ntlm = true
//! negotiate = true
//! basic = false
//! authoritative = true
//! basic_realm = "EXAMPLE"
//! helper_scope = "shared"
//!
//! [helpers]
//! ntlm = "/usr/bin/ntlm_auth --helper-protocol=squid-2.5-ntlmssp"
//! negotiate = "/usr/bin/ntlm_auth --helper-protocol=gss-spnego"
//! plaintext = "/usr/bin/ntlm_auth --helper-protocol=squid-2.5-basic"
//! ```
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::codec::MAX_LINE_LEN;
use crate::helper::HelperCommand;
use crate::{ConfigError, Mechanism, Mechanisms};

/// Whether helpers are shared by all connections or owned by one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HelperScope {
    /// One helper per mechanism, exchanges serialized on it
    #[default]
    Shared,
    /// One helper per mechanism and connection, released when the connection closes
    PerConnection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelperCommands {
    #[serde(default = "default_ntlm_helper")]
    pub ntlm: HelperCommand,
    #[serde(default = "default_negotiate_helper")]
    pub negotiate: HelperCommand,
    /// Checks Basic user/password pairs
    #[serde(default = "default_plaintext_helper")]
    pub plaintext: HelperCommand,
}

impl Default for HelperCommands {
    fn default() -> HelperCommands {
        HelperCommands {
            ntlm: default_ntlm_helper(),
            negotiate: default_negotiate_helper(),
            plaintext: default_plaintext_helper(),
        }
    }
}

fn default_ntlm_helper() -> HelperCommand {
    HelperCommand::new("ntlm_auth", ["--helper-protocol=squid-2.5-ntlmssp"])
}

fn default_negotiate_helper() -> HelperCommand {
    HelperCommand::new("ntlm_auth", ["--helper-protocol=gss-spnego"])
}

fn default_plaintext_helper() -> HelperCommand {
    HelperCommand::new("ntlm_auth", ["--helper-protocol=squid-2.5-basic"])
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub ntlm: bool,
    #[serde(default)]
    pub negotiate: bool,
    #[serde(default)]
    pub basic: bool,
    /// When false, refused credentials decline instead of answering 401,
    /// leaving the request to whatever authenticates after us
    #[serde(default = "default_authoritative")]
    pub authoritative: bool,
    #[serde(default = "default_basic_realm")]
    pub basic_realm: String,
    #[serde(default)]
    pub helpers: HelperCommands,
    #[serde(default)]
    pub helper_scope: HelperScope,
    /// Challenges one handshake may issue before it is abandoned
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Longest helper reply accepted, newline included
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
}

fn default_authoritative() -> bool {
    true
}

fn default_basic_realm() -> String {
    "REALM".to_owned()
}

fn default_max_rounds() -> u32 {
    8
}

fn default_max_line_len() -> usize {
    MAX_LINE_LEN
}

impl Default for AuthConfig {
    fn default() -> AuthConfig {
        AuthConfig {
            ntlm: false,
            negotiate: false,
            basic: false,
            authoritative: default_authoritative(),
            basic_realm: default_basic_realm(),
            helpers: HelperCommands::default(),
            helper_scope: HelperScope::default(),
            max_rounds: default_max_rounds(),
            max_line_len: default_max_line_len(),
        }
    }
}

impl AuthConfig {
    pub fn from_toml_str(s: &str) -> Result<AuthConfig, ConfigError> {
        let config: AuthConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<AuthConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rounds == 0 {
            return Err(ConfigError::Invalid("max_rounds must be at least 1".into()));
        }
        // room for a code, a separator and a newline
        if self.max_line_len < 4 {
            return Err(ConfigError::Invalid(format!("max_line_len {} is too small", self.max_line_len)));
        }
        if self.basic_realm.contains('"') || self.basic_realm.chars().any(char::is_control) {
            return Err(ConfigError::Invalid(format!("basic_realm {:?} can't be quoted", self.basic_realm)));
        }
        Ok(())
    }

    pub fn mechanisms(&self) -> Mechanisms {
        let mut enabled = Mechanisms::empty();
        enabled.set(Mechanisms::NTLM, self.ntlm);
        enabled.set(Mechanisms::NEGOTIATE, self.negotiate);
        enabled.set(Mechanisms::BASIC, self.basic);
        enabled
    }

    pub fn helper_command(&self, mechanism: Mechanism) -> &HelperCommand {
        match mechanism {
            Mechanism::Ntlm => &self.helpers.ntlm,
            Mechanism::Negotiate => &self.helpers.negotiate,
            Mechanism::Basic => &self.helpers.plaintext,
        }
    }
}
