//! Types for the signed-in user

use crate::error::{Error, Result};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;

const FORBIDDEN_KEY_CHARS: [char; 6] = ['.', '$', '#', '[', ']', '/'];

/// The signed-in user every feed path is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    uid: String,
}

/// Claims read from a Firebase-style ID token
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    /// Firebase puts the user id here
    pub user_id: Option<String>,

    /// Standard subject, used when `user_id` is absent
    pub sub: Option<String>,

    pub email: Option<String>,

    /// Display name, when the provider has one
    pub name: Option<String>,
}

impl Identity {
    pub fn new(uid: &str) -> Result<Self> {
        let uid = uid.trim();
        if uid.is_empty() {
            return Err(Error::validation("user id cannot be empty"));
        }
        if uid.contains(&FORBIDDEN_KEY_CHARS[..]) {
            return Err(Error::validation(format!(
                "user id '{}' is not a valid path key",
                uid
            )));
        }
        Ok(Self {
            uid: uid.to_string(),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Reads the user id out of an ID token without verifying its signature.
    /// The token is checked by the store on every request it is sent with.
    pub fn from_id_token(token: &str) -> Result<Self> {
        Self::new(&Self::claims(token)?.user_id_or_sub()?)
    }

    /// Decodes the claims of an ID token without verifying it.
    pub fn claims(token: &str) -> Result<IdTokenClaims> {
        let header = decode_header(token)?;
        let mut validation = Validation::new(header.alg);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<IdTokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)?;
        Ok(data.claims)
    }
}

impl IdTokenClaims {
    fn user_id_or_sub(self) -> Result<String> {
        self.user_id
            .filter(|id| !id.trim().is_empty())
            .or(self.sub)
            .ok_or_else(|| Error::validation("ID token has neither user_id nor sub"))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uid)
    }
}
