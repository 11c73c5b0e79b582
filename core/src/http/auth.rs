// Session authentication
//
// Cookie format: hex(sha256(user || secret)) ":" unix_ts ":"
// hex(hmac_sha256(hash || ts, secret)). The username is hashed so cookies
// cannot be used to enumerate accounts. Login failures are tracked per
// remote IP over a sliding window.

use crate::config::AuthConfig;
use crate::secrets::SecretString;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "scry_session";
const SESSION_LIFETIME_SECS: i64 = 7 * 24 * 60 * 60;
const FAILURE_WINDOW_SECS: i64 = 15 * 60;
const MAX_FAILURES: usize = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid username or password")]
    BadCredentials,

    #[error("too many failed login attempts, try again later")]
    RateLimited,
}

pub struct AuthRuntime {
    secret: SecretString,
    /// username -> bcrypt password hash
    users: HashMap<String, String>,
    failures: Mutex<HashMap<IpAddr, VecDeque<DateTime<Utc>>>>,
}

impl AuthRuntime {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            secret: SecretString::new(config.secret_key.clone()),
            users: config
                .users
                .iter()
                .map(|(name, user)| (name.clone(), user.password_hash.clone()))
                .collect(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn user_hash(&self, username: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update(self.secret.expose().as_bytes());
        hex_encode(&hasher.finalize())
    }

    fn sign(&self, user_hash: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose().as_bytes())
            .expect("hmac accepts any key length");
        mac.update(user_hash.as_bytes());
        mac.update(timestamp.to_string().as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }

    /// Mint a session cookie value for an authenticated user.
    pub fn mint_cookie(&self, username: &str, now: DateTime<Utc>) -> String {
        let user_hash = self.user_hash(username);
        let timestamp = now.timestamp();
        let mac = self.sign(&user_hash, timestamp);
        format!("{user_hash}:{timestamp}:{mac}")
    }

    /// Verify a session cookie: structure, signature, and lifetime.
    pub fn verify_cookie(&self, cookie: &str, now: DateTime<Utc>) -> bool {
        let mut parts = cookie.splitn(3, ':');
        let (Some(user_hash), Some(ts_raw), Some(mac)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let Ok(timestamp) = ts_raw.parse::<i64>() else {
            return false;
        };

        let age = now.timestamp() - timestamp;
        if !(0..=SESSION_LIFETIME_SECS).contains(&age) {
            return false;
        }

        let mut expected = HmacSha256::new_from_slice(self.secret.expose().as_bytes())
            .expect("hmac accepts any key length");
        expected.update(user_hash.as_bytes());
        expected.update(ts_raw.as_bytes());

        let Ok(mac_bytes) = hex_decode(mac) else {
            return false;
        };
        expected.verify_slice(&mac_bytes).is_ok()
    }

    /// Check a login attempt, enforcing the per-IP failure window.
    pub fn check_login(
        &self,
        username: &str,
        password: &str,
        remote: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        if self.is_rate_limited(remote, now) {
            warn!(target: "auth", remote = %remote, "login attempt rejected, rate limited");
            return Err(AuthError::RateLimited);
        }

        let valid = self
            .users
            .get(username)
            .map(|hash| bcrypt::verify(password, hash).unwrap_or(false))
            .unwrap_or(false);

        if !valid {
            self.record_failure(remote, now);
            return Err(AuthError::BadCredentials);
        }

        self.clear_failures(remote);
        Ok(self.mint_cookie(username, now))
    }

    fn is_rate_limited(&self, remote: IpAddr, now: DateTime<Utc>) -> bool {
        let mut failures = self.failures.lock().expect("failure lock poisoned");
        let Some(window) = failures.get_mut(&remote) else {
            return false;
        };
        let cutoff = now - chrono::Duration::seconds(FAILURE_WINDOW_SECS);
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        window.len() >= MAX_FAILURES
    }

    fn record_failure(&self, remote: IpAddr, now: DateTime<Utc>) {
        self.failures
            .lock()
            .expect("failure lock poisoned")
            .entry(remote)
            .or_default()
            .push_back(now);
    }

    fn clear_failures(&self, remote: IpAddr) {
        self.failures
            .lock()
            .expect("failure lock poisoned")
            .remove(&remote);
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(raw: &str) -> Result<Vec<u8>, ()> {
    if raw.len() % 2 != 0 {
        return Err(());
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;

    fn runtime() -> AuthRuntime {
        let mut users = HashMap::new();
        users.insert(
            "admin".to_string(),
            UserConfig {
                password_hash: bcrypt::hash("hunter42", 4).unwrap(),
            },
        );
        AuthRuntime::new(&AuthConfig {
            secret_key: "a-very-long-session-secret-key".to_string(),
            users,
        })
    }

    #[test]
    fn cookie_round_trip() {
        let auth = runtime();
        let now = Utc::now();
        let cookie = auth.mint_cookie("admin", now);
        assert!(auth.verify_cookie(&cookie, now));
        assert!(auth.verify_cookie(&cookie, now + chrono::Duration::days(6)));
        assert!(!auth.verify_cookie(&cookie, now + chrono::Duration::days(8)));
    }

    #[test]
    fn flipped_bytes_are_rejected() {
        let auth = runtime();
        let now = Utc::now();
        let cookie = auth.mint_cookie("admin", now);

        // Flip one nibble in every segment in turn.
        let parts: Vec<&str> = cookie.split(':').collect();
        for segment in 0..3 {
            let mut mutated: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
            let original = mutated[segment].clone();
            let flipped_char = if original.starts_with('0') { "1" } else { "0" };
            mutated[segment].replace_range(0..1, flipped_char);
            let tampered = mutated.join(":");
            assert!(
                !auth.verify_cookie(&tampered, now),
                "segment {segment} tamper must be rejected"
            );
        }
    }

    #[test]
    fn login_rate_limits_after_five_failures() {
        let auth = runtime();
        let now = Utc::now();
        let remote: IpAddr = "203.0.113.9".parse().unwrap();

        for _ in 0..5 {
            assert_eq!(
                auth.check_login("admin", "wrong", remote, now),
                Err(AuthError::BadCredentials)
            );
        }
        assert_eq!(
            auth.check_login("admin", "hunter42", remote, now),
            Err(AuthError::RateLimited)
        );

        // Window expiry unblocks the address.
        let later = now + chrono::Duration::seconds(FAILURE_WINDOW_SECS + 1);
        assert!(auth.check_login("admin", "hunter42", remote, later).is_ok());
    }

    #[test]
    fn successful_login_mints_valid_cookie() {
        let auth = runtime();
        let now = Utc::now();
        let remote: IpAddr = "198.51.100.3".parse().unwrap();
        let cookie = auth.check_login("admin", "hunter42", remote, now).unwrap();
        assert!(auth.verify_cookie(&cookie, now));
    }
}
