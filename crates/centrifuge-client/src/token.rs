//! Connection token issuing: HS256-signed compact JWS with `sub` and optional `exp`.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

/// Claim set of a connection token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    /// `exp` is set only for a positive expiry; zero or negative means no expiry.
    pub fn new(subject: impl Into<String>, expiry_unix_secs: i64) -> Self {
        Self {
            sub: subject.into(),
            exp: (expiry_unix_secs > 0).then_some(expiry_unix_secs),
        }
    }
}

/// Issue a connection token for `subject`, signed with `secret`.
///
/// Expiry is not validated here; that is up to the server consuming the token.
pub fn issue_token(secret: &[u8], subject: &str, expiry_unix_secs: i64) -> Result<String, Error> {
    if secret.is_empty() {
        return Err(Error::Signing("empty signing secret".to_string()));
    }
    let header = Header {
        alg: "HS256",
        typ: "JWT",
    };
    let claims = Claims::new(subject, expiry_unix_secs);

    let header_json =
        serde_json::to_vec(&header).map_err(|e| Error::Signing(format!("header: {e}")))?;
    let claims_json =
        serde_json::to_vec(&claims).map_err(|e| Error::Signing(format!("claims: {e}")))?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(claims_json)
    );

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::Signing(format!("HMAC error: {e}")))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    tracing::debug!(subject, expires = ?claims.exp, "issued connection token");
    Ok(format!("{signing_input}.{signature}"))
}
