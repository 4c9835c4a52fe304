// src/turn/auth_security.rs
//! Long-term credential authentication (RFC 5389 Section 10.2)
//!
//! Nonces are stateless: each one carries its issue time and a random
//! salt, authenticated with a per-process HMAC key and bound to the
//! client IP. Nothing is stored per nonce.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::digest::generic_array::GenericArray;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{AuthError, TurnResult};
use crate::stun::{verify_integrity, AttributeType, Message};

type HmacSha1 = Hmac<Sha1>;

const NONCE_TIMESTAMP_LEN: usize = 8;
const NONCE_SALT_LEN: usize = 4;
const NONCE_TAG_LEN: usize = 8;
const NONCE_LEN: usize = NONCE_TIMESTAMP_LEN + NONCE_SALT_LEN + NONCE_TAG_LEN;

/// Long-term key: MD5(username ":" realm ":" password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());

    let mut key = [0u8; 16];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// Secret material returned by a credential store
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    /// Precomputed long-term key
    Key([u8; 16]),
}

impl Credential {
    pub fn key(&self, username: &str, realm: &str) -> [u8; 16] {
        match self {
            Self::Password(password) => long_term_key(username, realm, password),
            Self::Key(key) => *key,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Credential::Password(..)"),
            Self::Key(_) => f.write_str("Credential::Key(..)"),
        }
    }
}

/// Credential lookup backend
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Secret for `username` in `realm`, `None` if the user is unknown
    async fn lookup(&self, username: &str, realm: &str) -> TurnResult<Option<Credential>>;
}

/// In-memory credential table
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    users: HashMap<(String, String), Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Users from the configuration, all in the server realm
    pub fn from_config(config: &ServerConfig) -> Self {
        config.users.iter().fold(Self::new(), |store, user| {
            store.with_user(&user.username, &config.realm, &user.password)
        })
    }

    pub fn with_user(mut self, username: &str, realm: &str, password: &str) -> Self {
        self.insert(username, realm, Credential::Password(password.to_string()));
        self
    }

    pub fn insert(&mut self, username: &str, realm: &str, credential: Credential) {
        self.users.insert((username.to_string(), realm.to_string()), credential);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn lookup(&self, username: &str, realm: &str) -> TurnResult<Option<Credential>> {
        Ok(self.users.get(&(username.to_string(), realm.to_string())).cloned())
    }
}

/// Issues and validates stateless nonces
pub struct NonceManager {
    /// One SHA-1 block
    key: [u8; 64],
    epoch: Instant,
    lifetime: Duration,
}

impl NonceManager {
    pub fn new(lifetime: Duration, epoch: Instant) -> Self {
        let mut key = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key, epoch, lifetime }
    }

    /// Fresh nonce for `client_ip`, as lowercase hex
    pub fn issue(&self, client_ip: IpAddr, now: Instant) -> String {
        let issued_ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        let mut salt = [0u8; NONCE_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut nonce = Vec::with_capacity(NONCE_LEN);
        nonce.extend_from_slice(&issued_ms.to_be_bytes());
        nonce.extend_from_slice(&salt);
        let tag = self.mac(&nonce, client_ip).finalize().into_bytes();
        nonce.extend_from_slice(&tag[..NONCE_TAG_LEN]);

        hex::encode(nonce)
    }

    /// True if `nonce` was issued by us, to this client, within the lifetime
    pub fn validate(&self, nonce: &[u8], client_ip: IpAddr, now: Instant) -> bool {
        let Ok(raw) = hex::decode(nonce) else {
            return false;
        };
        if raw.len() != NONCE_LEN {
            return false;
        }

        let (body, tag) = raw.split_at(NONCE_TIMESTAMP_LEN + NONCE_SALT_LEN);
        if self.mac(body, client_ip).verify_truncated_left(tag).is_err() {
            return false;
        }

        let mut ts = [0u8; NONCE_TIMESTAMP_LEN];
        ts.copy_from_slice(&body[..NONCE_TIMESTAMP_LEN]);
        let issued_at = self.epoch + Duration::from_millis(u64::from_be_bytes(ts));
        now.saturating_duration_since(issued_at) < self.lifetime
    }

    fn mac(&self, body: &[u8], client_ip: IpAddr) -> HmacSha1 {
        let mut mac = <HmacSha1 as Mac>::new(GenericArray::from_slice(&self.key));
        mac.update(body);
        match client_ip {
            IpAddr::V4(v4) => mac.update(&v4.octets()),
            IpAddr::V6(v6) => mac.update(&v6.octets()),
        }
        mac
    }
}

/// Identity proven by a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub username: String,
    pub realm: String,
    /// Key used to sign responses
    pub key: [u8; 16],
}

/// Long-term credential verifier
pub struct Authenticator {
    realm: String,
    store: Arc<dyn CredentialStore>,
    nonces: NonceManager,
}

impl Authenticator {
    pub fn new(realm: impl Into<String>, store: Arc<dyn CredentialStore>, nonces: NonceManager) -> Self {
        Self {
            realm: realm.into(),
            store,
            nonces,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// REALM and a fresh NONCE for a 401/438 challenge
    pub fn challenge(&self, source: SocketAddr, now: Instant) -> (String, String) {
        (self.realm.clone(), self.nonces.issue(source.ip(), now))
    }

    /// Check a request against the long-term credential mechanism.
    ///
    /// `raw` must be the exact bytes the request was decoded from. A stale
    /// nonce is reported before the user is looked up or the integrity is
    /// checked, so clients holding an old nonce always get 438.
    pub async fn authenticate(
        &self,
        request: &Message,
        raw: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<Authenticated, AuthError> {
        if !request.has_attribute(AttributeType::MessageIntegrity) {
            debug!("No MESSAGE-INTEGRITY from {}, challenging", source);
            return Err(AuthError::Unauthorized);
        }

        let username = request.username().ok_or(AuthError::MissingAttribute("USERNAME"))?;
        let realm = request.realm().ok_or(AuthError::MissingAttribute("REALM"))?;
        let nonce = request.nonce().ok_or(AuthError::MissingAttribute("NONCE"))?;

        if realm != self.realm {
            debug!("Foreign realm {:?} from {}, challenging", realm, source);
            return Err(AuthError::Unauthorized);
        }
        if !self.nonces.validate(nonce, source.ip(), now) {
            debug!("Stale nonce from {} (user {:?})", source, username);
            return Err(AuthError::StaleNonce);
        }

        let credential = self
            .store
            .lookup(username, realm)
            .await
            .map_err(|e| AuthError::Backend(e.to_string()))?
            .ok_or_else(|| {
                debug!("Unknown user {:?} in realm {:?} from {}", username, realm, source);
                AuthError::UnknownUser(username.to_string())
            })?;

        let key = credential.key(username, realm);
        if !verify_integrity(raw, &key).unwrap_or(false) {
            warn!("MESSAGE-INTEGRITY mismatch for user {:?} from {}", username, source);
            return Err(AuthError::IntegrityFailure);
        }

        Ok(Authenticated {
            username: username.to_string(),
            realm: realm.to_string(),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnError;
    use crate::stun::{Attribute, MessageClass, MessageType, Method, TransactionId};

    fn client() -> SocketAddr {
        "198.51.100.4:50000".parse().unwrap()
    }

    fn authenticator(epoch: Instant) -> Authenticator {
        let store = StaticCredentials::new().with_user("user", "realm", "pass");
        Authenticator::new("realm", Arc::new(store), NonceManager::new(Duration::from_secs(300), epoch))
    }

    fn signed_request(nonce: &str, key: &[u8]) -> bytes::Bytes {
        signed_request_in("realm", nonce, key)
    }

    fn signed_request_in(realm: &str, nonce: &str, key: &[u8]) -> bytes::Bytes {
        Message::new(MessageType::new(Method::Allocate, MessageClass::Request), TransactionId::new())
            .with(Attribute::requested_transport(17))
            .with(Attribute::username("user"))
            .with(Attribute::realm(realm))
            .with(Attribute::nonce(nonce.as_bytes().to_vec()))
            .encode(Some(key), true)
            .unwrap()
    }

    #[test]
    fn test_long_term_key() {
        let key = long_term_key("user", "realm", "pass");
        let expected = Md5::digest(b"user:realm:pass");
        assert_eq!(&key[..], &expected[..]);
        assert_eq!(Credential::Key(key).key("ignored", "ignored"), key);
    }

    #[test]
    fn test_nonce_lifecycle() {
        let epoch = Instant::now();
        let nonces = NonceManager::new(Duration::from_secs(300), epoch);
        let ip = client().ip();

        let nonce = nonces.issue(ip, epoch);
        assert!(nonce.len() < 128);
        assert!(nonces.validate(nonce.as_bytes(), ip, epoch + Duration::from_secs(299)));
        assert!(!nonces.validate(nonce.as_bytes(), ip, epoch + Duration::from_secs(300)));
        assert!(!nonces.validate(nonce.as_bytes(), "198.51.100.5".parse().unwrap(), epoch));
        assert!(!nonces.validate(b"abc", ip, epoch));

        let other = NonceManager::new(Duration::from_secs(300), epoch);
        assert!(!other.validate(nonce.as_bytes(), ip, epoch));
    }

    #[tokio::test]
    async fn test_authenticate_flow() {
        let epoch = Instant::now();
        let auth = authenticator(epoch);

        // First contact without integrity
        let bare = Message::new(MessageType::new(Method::Allocate, MessageClass::Request), TransactionId::new())
            .with(Attribute::requested_transport(17));
        let raw = bare.encode(None, false).unwrap();
        assert!(matches!(
            auth.authenticate(&bare, &raw, client(), epoch).await,
            Err(AuthError::Unauthorized)
        ));

        let (realm, nonce) = auth.challenge(client(), epoch);
        assert_eq!(realm, "realm");

        let key = long_term_key("user", "realm", "pass");
        let raw = signed_request(&nonce, &key);
        let request = Message::decode(raw.clone()).unwrap();
        let identity = auth.authenticate(&request, &raw, client(), epoch).await.unwrap();
        assert_eq!(identity.username, "user");
        assert_eq!(identity.key, key);

        // Same request once the nonce has aged out
        let later = epoch + Duration::from_secs(301);
        assert!(matches!(
            auth.authenticate(&request, &raw, client(), later).await,
            Err(AuthError::StaleNonce)
        ));
    }

    #[tokio::test]
    async fn test_authenticate_rejects_bad_credentials() {
        let epoch = Instant::now();
        let auth = authenticator(epoch);
        let (_, nonce) = auth.challenge(client(), epoch);

        let raw = signed_request(&nonce, &long_term_key("user", "realm", "wrong"));
        let request = Message::decode(raw.clone()).unwrap();
        assert!(matches!(
            auth.authenticate(&request, &raw, client(), epoch).await,
            Err(AuthError::IntegrityFailure)
        ));

        let stranger = Message::new(MessageType::new(Method::Refresh, MessageClass::Request), TransactionId::new())
            .with(Attribute::username("mallory"))
            .with(Attribute::realm("realm"))
            .with(Attribute::nonce(nonce.as_bytes().to_vec()));
        let raw = stranger.encode(Some(&[0u8; 16]), false).unwrap();
        let decoded = Message::decode(raw.clone()).unwrap();
        assert!(matches!(
            auth.authenticate(&decoded, &raw, client(), epoch).await,
            Err(AuthError::UnknownUser(_))
        ));

        let no_realm = Message::new(MessageType::new(Method::Refresh, MessageClass::Request), TransactionId::new())
            .with(Attribute::username("user"));
        let raw = no_realm.encode(Some(&[0u8; 16]), false).unwrap();
        let decoded = Message::decode(raw.clone()).unwrap();
        assert!(matches!(
            auth.authenticate(&decoded, &raw, client(), epoch).await,
            Err(AuthError::MissingAttribute("REALM"))
        ));
    }

    #[tokio::test]
    async fn test_stale_nonce_reported_before_integrity() {
        let epoch = Instant::now();
        let auth = authenticator(epoch);
        let (_, nonce) = auth.challenge(client(), epoch);
        let later = epoch + Duration::from_secs(301);

        // Wrong password with an aged nonce still gets 438
        let raw = signed_request(&nonce, &long_term_key("user", "realm", "wrong"));
        let request = Message::decode(raw.clone()).unwrap();
        let err = auth.authenticate(&request, &raw, client(), later).await.unwrap_err();
        assert!(matches!(err, AuthError::StaleNonce));
        assert_eq!(TurnError::from(err).error_code().0, 438);

        // Unknown user with an aged nonce as well
        let stranger = Message::new(MessageType::new(Method::Refresh, MessageClass::Request), TransactionId::new())
            .with(Attribute::username("mallory"))
            .with(Attribute::realm("realm"))
            .with(Attribute::nonce(nonce.as_bytes().to_vec()));
        let raw = stranger.encode(Some(&[0u8; 16]), false).unwrap();
        let decoded = Message::decode(raw.clone()).unwrap();
        assert!(matches!(
            auth.authenticate(&decoded, &raw, client(), later).await,
            Err(AuthError::StaleNonce)
        ));
    }

    #[tokio::test]
    async fn test_foreign_realm_is_challenged() {
        let epoch = Instant::now();
        let store = StaticCredentials::new()
            .with_user("user", "realm", "pass")
            .with_user("user", "elsewhere", "pass");
        let auth = Authenticator::new("realm", Arc::new(store), NonceManager::new(Duration::from_secs(300), epoch));
        let (_, nonce) = auth.challenge(client(), epoch);

        // Valid credentials, but for a realm this server does not serve
        let raw = signed_request_in("elsewhere", &nonce, &long_term_key("user", "elsewhere", "pass"));
        let request = Message::decode(raw.clone()).unwrap();
        let err = auth.authenticate(&request, &raw, client(), epoch).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
        assert_eq!(TurnError::from(err).error_code().0, 401);
    }
}
