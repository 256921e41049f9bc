//! Broker credentials.
//!
//! The connection layer consumes a plain [`Credentials`] pair. Where it
//! comes from is a collaborator's business: anything implementing
//! [`CredentialsProvider`] can supply it. [`Certificate`] parses the
//! `access_key:access_secret:resource_owner` triple accepted by the
//! worker's `--cert` flag.

use std::fmt;
use std::str::FromStr;

use crate::{Result, RpcError};

/// Supplies a username/password pair for the broker connection.
pub trait CredentialsProvider {
    /// Username presented to the broker.
    fn username(&self) -> String;

    /// Password presented to the broker.
    fn password(&self) -> String;

    /// Materialize the pair.
    fn credentials(&self) -> Credentials {
        Credentials::new(self.username(), self.password())
    }
}

/// Username and password used to authenticate with the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl CredentialsProvider for Credentials {
    fn username(&self) -> String {
        self.username.clone()
    }

    fn password(&self) -> String {
        self.password.clone()
    }
}

/// A `access_key:access_secret:resource_owner` certificate string.
///
/// Vendor-specific signing of these fields is out of scope; the access key
/// and secret are presented as the username and password.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    pub access_key: String,
    pub access_secret: String,
    pub resource_owner: String,
}

impl Certificate {
    /// Parse a certificate string. Exactly three `:`-separated, non-empty
    /// fields are required.
    pub fn parse(raw: &str) -> Result<Self> {
        // ---
        let fields: Vec<&str> = raw.trim().split(':').collect();

        match fields.as_slice() {
            [key, secret, owner] if !key.is_empty() && !secret.is_empty() && !owner.is_empty() => {
                Ok(Self {
                    access_key: (*key).to_string(),
                    access_secret: (*secret).to_string(),
                    resource_owner: (*owner).to_string(),
                })
            }
            _ => Err(RpcError::config("invalid certificate, expected key:secret:owner")),
        }
    }
}

impl FromStr for Certificate {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("access_key", &self.access_key)
            .field("resource_owner", &self.resource_owner)
            .finish_non_exhaustive()
    }
}

impl CredentialsProvider for Certificate {
    fn username(&self) -> String {
        self.access_key.clone()
    }

    fn password(&self) -> String {
        self.access_secret.clone()
    }
}
