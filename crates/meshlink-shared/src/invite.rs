//! Out-of-band connection strings: `meshlink://<session-id>?pw=<hash>`.
//!
//! The password never appears in clear text: `pw` carries the base64url
//! encoding of its BLAKE3-derived hash, which is also what the relay
//! compares on join.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::checksum::derive_password_hash;
use crate::constants::CONNECTION_SCHEME;
use crate::error::MeshlinkError;
use crate::types::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub session_id: SessionId,
    pub password_hash: Option<String>,
}

impl ConnectionString {
    pub fn new(session_id: SessionId, password: Option<&str>) -> Self {
        Self {
            session_id,
            password_hash: password.map(hash_password),
        }
    }

    pub fn encode(&self) -> String {
        match &self.password_hash {
            Some(hash) => format!("{CONNECTION_SCHEME}://{}?pw={hash}", self.session_id),
            None => format!("{CONNECTION_SCHEME}://{}", self.session_id),
        }
    }

    pub fn parse(s: &str) -> Result<Self, MeshlinkError> {
        let rest = s
            .trim()
            .strip_prefix(CONNECTION_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| {
                MeshlinkError::InvalidConnectionString(format!(
                    "expected {CONNECTION_SCHEME}:// prefix"
                ))
            })?;

        let (session, query) = match rest.split_once('?') {
            Some((session, query)) => (session, Some(query)),
            None => (rest, None),
        };
        let session_id = SessionId::parse(session.trim_end_matches('/'))?;

        let mut password_hash = None;
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("pw", value)) if !value.is_empty() => {
                    let decoded = URL_SAFE_NO_PAD.decode(value).map_err(|_| {
                        MeshlinkError::InvalidConnectionString("pw is not base64url".into())
                    })?;
                    if decoded.len() != 32 {
                        return Err(MeshlinkError::InvalidConnectionString(
                            "pw has the wrong length".into(),
                        ));
                    }
                    password_hash = Some(value.to_string());
                }
                _ => {}
            }
        }

        Ok(Self {
            session_id,
            password_hash,
        })
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Encoded one-way hash of a session password, as carried by `pw=`.
pub fn hash_password(password: &str) -> String {
    URL_SAFE_NO_PAD.encode(derive_password_hash(password.as_bytes()))
}
