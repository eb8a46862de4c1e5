use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{hex, B256};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use crate::models::error::RunnerError;

type HmacSha256 = Hmac<Sha256>;

/// Secret the orchestration service configures on every client's
/// authenticated RPC endpoint.
pub const HIVE_JWT_SECRET: &str =
    "0x7365637265747365637265747365637265747365637265747365637265747365";

/// A 32-byte shared secret for the Engine API's HS256 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JwtSecret(B256);

impl JwtSecret {
    pub const fn new(secret: B256) -> Self {
        Self(secret)
    }

    /// Signs a token with `iat` set to the current time.
    pub fn token(&self) -> Result<String, RunnerError> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| RunnerError::Other(err.to_string()))?
            .as_secs();
        self.token_at(iat)
    }

    pub fn token_at(&self, iat: u64) -> Result<String, RunnerError> {
        let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
        let claims = URL_SAFE_NO_PAD.encode(json!({ "iat": iat }).to_string());
        let signing_input = format!("{header}.{claims}");

        let mut mac = HmacSha256::new_from_slice(self.0.as_slice())
            .map_err(|err| RunnerError::Other(err.to_string()))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }
}

impl FromStr for JwtSecret {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|err| RunnerError::Other(err.to_string()))?;
        if bytes.len() != 32 {
            return Err(RunnerError::Other(format!(
                "JWT secret must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(B256::from_slice(&bytes)))
    }
}
