//! Security tokens that bind a STORE to a requester's network identity.

use crc::{Crc, CRC_32_ISCSI};
use rand::{thread_rng, Rng};
use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::trace;

const SECRET_SIZE: usize = 20;
const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// How often the secrets behind issued tokens rotate.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

#[derive(Clone, PartialEq, Eq, Hash)]
/// Opaque anti-spoofing credential issued by a node to a requester.
pub struct SecurityToken(Bytes);

impl SecurityToken {
    pub fn new(bytes: impl Into<Bytes>) -> SecurityToken {
        SecurityToken(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if this token was issued for the identity `data` describes.
    pub fn is_for(&self, data: &TokenData) -> bool {
        data.accepted.iter().any(|token| token[..] == self.0[..])
    }
}

impl Debug for SecurityToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityToken({:02x?})", &self.0[..])
    }
}

#[derive(Debug, Clone)]
/// The tokens a provider currently accepts for one requester.
pub struct TokenData {
    accepted: Vec<[u8; TOKEN_SIZE]>,
}

/// Issues and validates [SecurityToken]s.
pub trait TokenProvider: Send + Debug {
    /// Token data for a requester at `address`.
    fn create_token_data(&self, address: SocketAddr) -> TokenData;

    /// Issues a fresh token for a requester at `address`.
    fn issue_token(&mut self, address: SocketAddr) -> SecurityToken;

    /// Rotates secrets if they are due.
    fn maintain(&mut self) {}

    /// Returns `true` if `token` was issued to a requester at `address`.
    fn validate(&self, token: &SecurityToken, address: SocketAddr) -> bool {
        token.is_for(&self.create_token_data(address))
    }
}

/// Tokens generator.
///
/// A token is a CRC-32C digest of the requester's IP and a secret. Two
/// secrets are kept so tokens stay valid across one rotation.
pub struct DefaultTokenProvider {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for DefaultTokenProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "DefaultTokenProvider (_)")
    }
}

impl DefaultTokenProvider {
    pub fn new() -> Self {
        let mut rng = thread_rng();

        DefaultTokenProvider {
            prev_secret: rng.gen(),
            curr_secret: rng.gen(),
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    pub fn should_update(&self) -> bool {
        self.last_updated.elapsed() > TOKEN_ROTATE_INTERVAL
    }

    pub fn rotate(&mut self) {
        trace!("Rotating secrets");
        let mut rng = thread_rng();

        self.prev_secret = self.curr_secret;
        self.curr_secret = rng.gen();

        self.last_updated = Instant::now();
    }

    // === Private Methods ===

    fn generate(&self, address: SocketAddr, secret: &[u8; SECRET_SIZE]) -> [u8; TOKEN_SIZE] {
        let mut digest = CASTAGNOLI.digest();

        match address.ip() {
            IpAddr::V4(v4) => digest.update(&v4.octets()),
            IpAddr::V6(v6) => digest.update(&v6.octets()),
        };

        digest.update(secret);

        digest.finalize().to_be_bytes()
    }
}

impl TokenProvider for DefaultTokenProvider {
    fn create_token_data(&self, address: SocketAddr) -> TokenData {
        TokenData {
            accepted: vec![
                self.generate(address, &self.curr_secret),
                self.generate(address, &self.prev_secret),
            ],
        }
    }

    fn issue_token(&mut self, address: SocketAddr) -> SecurityToken {
        if self.should_update() {
            self.rotate()
        }

        SecurityToken::new(self.generate(address, &self.curr_secret).to_vec())
    }

    fn maintain(&mut self) {
        if self.should_update() {
            self.rotate()
        }
    }
}

impl Default for DefaultTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn valid_tokens() {
        let mut tokens = DefaultTokenProvider::new();

        let address = SocketAddr::from(([127, 0, 0, 1], 6881));
        let token = tokens.issue_token(address);

        assert!(tokens.validate(&token, address));
    }

    #[test]
    fn token_is_bound_to_ip() {
        let mut tokens = DefaultTokenProvider::new();

        let token = tokens.issue_token(SocketAddr::from(([127, 0, 0, 1], 6881)));

        // Same ip, other port.
        assert!(tokens.validate(&token, SocketAddr::from(([127, 0, 0, 1], 1))));
        assert!(!tokens.validate(&token, SocketAddr::from(([127, 0, 0, 2], 6881))));
    }

    #[test]
    fn tokens_survive_one_rotation() {
        let mut tokens = DefaultTokenProvider::new();
        let address = SocketAddr::from(([21, 75, 31, 124], 6881));

        let token = tokens.issue_token(address);

        tokens.rotate();
        assert!(tokens.validate(&token, address));

        tokens.rotate();
        assert!(!tokens.validate(&token, address));
    }

    #[test]
    fn garbage_is_rejected() {
        let tokens = DefaultTokenProvider::new();
        let address = SocketAddr::from(([21, 75, 31, 124], 6881));

        assert!(!tokens.validate(&SecurityToken::new(vec![1, 2, 3]), address));
        assert!(!tokens.validate(&SecurityToken::new(Vec::new()), address));
    }
}
