//! CSRF tokens: `hex(seed ‖ HMAC(seed, secret))`.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;

use crate::core::error::{ErrorKind, GatewayError, GatewayResult};

/// HMAC digest used for token signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HashAlg {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    /// Length of the HMAC output in bytes
    pub fn output_size(&self) -> usize {
        match self {
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

macro_rules! keyed {
    ($digest:ty, $secret:expr, $seed:expr) => {{
        let mut mac = <Hmac<$digest> as Mac>::new_from_slice($secret)
            .map_err(|e| GatewayError::new(ErrorKind::TokenMint, "csrf", format!("invalid HMAC key: {}", e)))?;
        mac.update($seed);
        mac
    }};
}

/// Mints and verifies tokens with a server secret
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
    seed_size: usize,
    alg: HashAlg,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("seed_size", &self.seed_size)
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: Vec<u8>, seed_size: usize, alg: HashAlg) -> Self {
        Self {
            secret,
            seed_size,
            alg,
        }
    }

    /// Decoded length of every valid token
    pub fn token_size(&self) -> usize {
        self.seed_size + self.alg.output_size()
    }

    fn sign(&self, seed: &[u8]) -> GatewayResult<Vec<u8>> {
        let tag = match self.alg {
            HashAlg::Sha224 => keyed!(Sha224, &self.secret, seed).finalize().into_bytes().to_vec(),
            HashAlg::Sha256 => keyed!(Sha256, &self.secret, seed).finalize().into_bytes().to_vec(),
            HashAlg::Sha384 => keyed!(Sha384, &self.secret, seed).finalize().into_bytes().to_vec(),
            HashAlg::Sha512 => keyed!(Sha512, &self.secret, seed).finalize().into_bytes().to_vec(),
        };
        Ok(tag)
    }

    fn check(&self, seed: &[u8], tag: &[u8]) -> GatewayResult<bool> {
        // verify_slice compares in constant time
        let ok = match self.alg {
            HashAlg::Sha224 => keyed!(Sha224, &self.secret, seed).verify_slice(tag).is_ok(),
            HashAlg::Sha256 => keyed!(Sha256, &self.secret, seed).verify_slice(tag).is_ok(),
            HashAlg::Sha384 => keyed!(Sha384, &self.secret, seed).verify_slice(tag).is_ok(),
            HashAlg::Sha512 => keyed!(Sha512, &self.secret, seed).verify_slice(tag).is_ok(),
        };
        Ok(ok)
    }

    /// Mint a fresh token; fails only when the random source fails
    pub fn mint(&self) -> GatewayResult<String> {
        let mut seed = vec![0u8; self.seed_size];
        OsRng.try_fill_bytes(&mut seed).map_err(|e| {
            GatewayError::new(ErrorKind::TokenMint, "csrf", "random source failed").wrap(e)
        })?;
        let mut token = seed.clone();
        token.extend_from_slice(&self.sign(&seed)?);
        Ok(hex::encode(token))
    }

    /// Accept iff `token` decodes to exactly one seed plus its valid HMAC
    pub fn verify(&self, token: &str) -> bool {
        let decoded = match hex::decode(token) {
            Ok(decoded) => decoded,
            Err(_) => return false,
        };
        if decoded.len() != self.token_size() {
            return false;
        }
        let (seed, tag) = decoded.split_at(self.seed_size);
        self.check(seed, tag).unwrap_or(false)
    }
}

/// Secret derived from the host name, for development setups only
pub fn host_secret() -> Vec<u8> {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string());
    Sha256::digest(host.as_bytes()).to_vec()
}
