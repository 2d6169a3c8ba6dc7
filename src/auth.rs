//! Credential validation for both client-facing protocols.
//!
//! - HTTP: `Proxy-Authorization: Basic base64(user:pass)`
//! - SOCKS5: username/password sub-negotiation ([RFC 1929](https://datatracker.ietf.org/doc/html/rfc1929))
//!
//! Usernames and passwords are compared in constant time. The cost of a
//! comparison depends only on the length of the configured secret, never on
//! the supplied value or on where it first differs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::sync::Arc;
use subtle::{Choice, ConstantTimeEq};

/// Version byte of the RFC 1929 sub-negotiation
pub const SUBNEGOTIATION_VERSION: u8 = 0x01;

const BASIC_PREFIX: &str = "Basic ";

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// AuthStatus is the STATUS byte of the sub-negotiation reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthStatus {
    Success = 0x00,
    Failure = 0x01,
}

impl AuthStatus {
    /// reply builds the two byte sub-negotiation reply frame
    pub fn reply(self) -> [u8; 2] {
        // +----+--------+
        // |VER | STATUS |
        // +----+--------+
        // | 1  |   1    |
        // +----+--------+
        [SUBNEGOTIATION_VERSION, self as u8]
    }
}

/// CredentialValidator checks client credentials against the
/// configured ones
#[derive(Clone, Debug, Default)]
pub struct CredentialValidator {
    credentials: Option<Arc<UserPass>>,
}

impl CredentialValidator {
    /// new creates a validator; `None` disables authentication
    pub fn new(credentials: Option<UserPass>) -> Self {
        Self {
            credentials: credentials.map(Arc::new),
        }
    }

    /// auth_required reports whether credentials are configured
    pub fn auth_required(&self) -> bool {
        self.credentials.is_some()
    }

    /// validate_basic checks the value of a `Proxy-Authorization` header.
    /// Always true when authentication is disabled.
    pub fn validate_basic(&self, header: &str) -> bool {
        let Some(expected) = &self.credentials else {
            return true;
        };

        let Some(encoded) = header.strip_prefix(BASIC_PREFIX) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded) else {
            return false;
        };

        // Split on the first colon, passwords may contain more
        let Some(colon) = decoded.iter().position(|&b| b == b':') else {
            return false;
        };
        let (username, password) = (&decoded[..colon], &decoded[colon + 1..]);

        matches(expected, username, password)
    }

    /// validate_socks_subnegotiation checks a complete RFC 1929 request
    /// frame and returns the verdict together with the reply frame that
    /// must be written back to the client
    pub fn validate_socks_subnegotiation(&self, frame: &[u8]) -> (bool, [u8; 2]) {
        let ok = match (&self.credentials, parse_subnegotiation(frame)) {
            (Some(expected), Some((username, password))) => matches(expected, username, password),
            _ => false,
        };

        let status = if ok {
            AuthStatus::Success
        } else {
            AuthStatus::Failure
        };
        (ok, status.reply())
    }
}

/// parse_subnegotiation splits a sub-negotiation frame into username and
/// password. The frame must contain exactly one request.
fn parse_subnegotiation(frame: &[u8]) -> Option<(&[u8], &[u8])> {
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    let (&version, rest) = frame.split_first()?;
    if version != SUBNEGOTIATION_VERSION {
        return None;
    }
    let (&ulen, rest) = rest.split_first()?;
    let username = rest.get(..ulen as usize)?;
    let rest = &rest[ulen as usize..];
    let (&plen, rest) = rest.split_first()?;
    if rest.len() != plen as usize {
        return None;
    }
    Some((username, rest))
}

/// matches compares both fields without short-circuiting
fn matches(expected: &UserPass, username: &[u8], password: &[u8]) -> bool {
    let user_ok = ct_compare(username, expected.username.as_bytes());
    let pass_ok = ct_compare(password, expected.password.as_bytes());
    (user_ok & pass_ok).into()
}

fn ct_compare(supplied: &[u8], expected: &[u8]) -> Choice {
    let mut equal = (supplied.len() as u64).ct_eq(&(expected.len() as u64));
    for (i, byte) in expected.iter().enumerate() {
        let other = supplied.get(i).copied().unwrap_or(0);
        equal &= other.ct_eq(byte);
    }
    equal
}
