//! Encrypted contact lookup: turns a record's secondary identifier
//! into an opaque token and resolves it against the protected phone
//! endpoint.

use std::time::Duration;

use adwatch_storage::Fetcher;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::StatusCode;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde::Deserialize;
use tracing::warn;

/// Sentinel stored instead of a phone number when the upstream
/// reports the listing as expired/hidden.
pub const PHONE_HIDDEN_SENTINEL: &str = "Số bị ẩn do hết hạn";

pub const DEFAULT_PHONE_URL: &str = "https://gateway.chotot.com/v1/public/ad-listing/phone";

/// Production public key the phone endpoint expects tokens to be
/// encrypted with.
pub const PRODUCTION_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----\nMIIBojANBgkqhkiG9w0BAQEFAAOCAY8AMIIBigKCAYEAxnvPjlA/K/adq6mA6+uU\ntlyBBxFaKeK+WD2FypOeCAP0qtucmaDrIbxirykrxQjRpGxl2HKRBwGd2h/hDuk9\nCxRUXD2p0Hrzb1Hb9M5px19TPXM6AWSClR1kozehRusIFrxP6PHqDLx5prJFLlSZ\nzg3N3oGhS6oP/a4Ku/iAdCUCiHb5TX3b3+y4Ll/QViZhpKZjU6BhIOsiVIJhyXvn\n0cSqLXPjNuXR5A4JkmRl9T9cWncEHTKmoVUyXQJaDZa3yH/OJSEmhhGyKNKkM5so\nlasJWSBKenFnFvphw3+KG8BGfJwGkvtRAVbS1ljduH8z8fxALxHgUdnTtgpxB+KZ\n/CVnNr97EGqYPLVlX+duGkuy1yCunqVTiY2HyL/0bMTBK84oCQjtMVAHgZ345hZn\nmGST71D8+i5HGtOOFoRyP6qK6ex1qfEROzWsmVDA00aHLlQcKOLaHvT/DB30aeUs\nZoL/kQo100XccufpHESrits0mEuoyza4CCFM04F3pDOXAgMBAAE=\n-----END PUBLIC KEY-----";

/// Encodes a record identifier into the opaque `e=` lookup token:
/// PKCS#1 v1.5 public-key encryption of the decimal id, base64, then
/// percent-encoding for the query string.
#[derive(Debug, Clone)]
pub struct TokenEncoder {
    key: RsaPublicKey,
}

impl TokenEncoder {
    pub fn production() -> Result<Self> {
        Self::from_pem(PRODUCTION_PUBLIC_KEY_PEM)
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem).context("parsing lookup public key")?;
        Ok(Self { key })
    }

    pub fn encode(&self, list_id: u64) -> Result<String> {
        let mut rng = rand::thread_rng();
        let cipher = self
            .key
            .encrypt(&mut rng, Pkcs1v15Encrypt, list_id.to_string().as_bytes())
            .context("encrypting lookup id")?;
        Ok(urlencoding::encode(&BASE64.encode(cipher)).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneOutcome {
    Found(String),
    /// The endpoint knows the listing but will no longer serve its
    /// number; callers store the sentinel instead.
    HiddenExpired,
    RateLimited,
    Failed,
}

#[derive(Debug, Deserialize)]
struct PhoneBody {
    #[serde(default)]
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

pub struct PhoneLookup {
    base_url: String,
    encoder: TokenEncoder,
    timeout: Duration,
}

impl PhoneLookup {
    pub fn new(base_url: impl Into<String>, encoder: TokenEncoder) -> Self {
        Self {
            base_url: base_url.into(),
            encoder,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn production() -> Result<Self> {
        Ok(Self::new(DEFAULT_PHONE_URL, TokenEncoder::production()?))
    }

    /// Single bounded-timeout attempt; never retried. The caller
    /// decides what each outcome means for the rest of the run.
    pub async fn lookup(&self, http: &Fetcher, list_id: u64) -> PhoneOutcome {
        let token = match self.encoder.encode(list_id) {
            Ok(token) => token,
            Err(err) => {
                warn!(list_id, error = %err, "token encoding failed");
                return PhoneOutcome::Failed;
            }
        };
        let url = format!("{}?e={}", self.base_url, token);

        let resp = match http.get_once(&url, self.timeout).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(list_id, error = %err, "phone lookup request failed");
                return PhoneOutcome::Failed;
            }
        };

        classify_response(resp.status, &resp.body, list_id)
    }
}

fn classify_response(status: StatusCode, body: &[u8], list_id: u64) -> PhoneOutcome {
    if status.is_success() {
        if let Ok(PhoneBody { phone: Some(phone) }) = serde_json::from_slice(body) {
            if !phone.is_empty() {
                return PhoneOutcome::Found(phone);
            }
        }
        return PhoneOutcome::Failed;
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => PhoneOutcome::RateLimited,
        StatusCode::NOT_FOUND => {
            // Only a not-found that names this identifier means
            // "expired"; anything else is an ordinary failure.
            let references_id = serde_json::from_slice::<ErrorBody>(body)
                .ok()
                .and_then(|b| b.message)
                .is_some_and(|m| m.contains(&list_id.to_string()));
            if references_id {
                PhoneOutcome::HiddenExpired
            } else {
                PhoneOutcome::Failed
            }
        }
        _ => PhoneOutcome::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_query_safe_and_key_sized() {
        let encoder = TokenEncoder::production().expect("key");
        let token = encoder.encode(112233).expect("token");
        assert!(!token.is_empty());
        // Percent-encoded base64 only ever contains these characters.
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '%' || c == '.' || c == '-' || c == '_' || c == '~'));
    }

    #[test]
    fn success_body_with_phone_is_found() {
        let got = classify_response(StatusCode::OK, br#"{"phone": "0901234567"}"#, 1);
        assert_eq!(got, PhoneOutcome::Found("0901234567".to_string()));
    }

    #[test]
    fn success_body_without_phone_is_failed() {
        let got = classify_response(StatusCode::OK, br#"{}"#, 1);
        assert_eq!(got, PhoneOutcome::Failed);
    }

    #[test]
    fn rate_limit_status_is_surfaced() {
        let got = classify_response(StatusCode::TOO_MANY_REQUESTS, b"", 1);
        assert_eq!(got, PhoneOutcome::RateLimited);
    }

    #[test]
    fn not_found_referencing_the_id_is_hidden_expired() {
        let got = classify_response(
            StatusCode::NOT_FOUND,
            br#"{"message": "ad 445566 not found"}"#,
            445566,
        );
        assert_eq!(got, PhoneOutcome::HiddenExpired);
    }

    #[test]
    fn not_found_without_the_id_is_plain_failure() {
        let got = classify_response(StatusCode::NOT_FOUND, br#"{"message": "gone"}"#, 445566);
        assert_eq!(got, PhoneOutcome::Failed);
    }
}
