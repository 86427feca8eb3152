//! AWS SigV4 request signing (§4.2, §6.2) for Bedrock calls.
//!
//! Built from `hmac` + `sha2` + `hex`, the same three crates the teacher
//! already depends on (used there for `stable_provider_uuid` hashing); no
//! new crate family is introduced for signing.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub struct SigningParams<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub session_token: Option<&'a str>,
    pub region: &'a str,
    pub service: &'a str,
}

/// Signed headers to attach to the outbound request: `Authorization`,
/// `X-Amz-Date`, and (if present) `X-Amz-Security-Token`.
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub security_token: Option<String>,
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Signs `method path` against `host` with `body`, returning the headers to
/// attach. `path` must already be URL-encoded (for Bedrock, the model id is
/// encoded into `/model/<id>/invoke`, per §6.2).
pub fn sign(
    params: &SigningParams,
    method: &str,
    host: &str,
    path: &str,
    query: &str,
    body: &[u8],
) -> SignedHeaders {
    let now = Utc::now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let payload_hash = sha256_hex(body);
    // When a session token is present it rides along as the
    // `X-Amz-Security-Token` header, so it must also be part of what gets
    // signed — otherwise AWS rejects the request with SignatureDoesNotMatch.
    let (canonical_headers, signed_headers) = match params.session_token {
        Some(token) => (
            format!(
                "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\nx-amz-security-token:{token}\n"
            ),
            "host;x-amz-content-sha256;x-amz-date;x-amz-security-token",
        ),
        None => (
            format!("host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"),
            "host;x-amz-content-sha256;x-amz-date",
        ),
    };

    let canonical_request = format!(
        "{method}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let credential_scope = format!("{date_stamp}/{}/{}/aws4_request", params.region, params.service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_bytes(format!("AWS4{}", params.secret_access_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_bytes(&k_date, params.region.as_bytes());
    let k_service = hmac_bytes(&k_region, params.service.as_bytes());
    let k_signing = hmac_bytes(&k_service, b"aws4_request");
    let signature = hex::encode(hmac_bytes(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
        params.access_key_id
    );

    SignedHeaders {
        authorization,
        amz_date,
        security_token: params.session_token.map(|s| s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_given_same_inputs() {
        let params = SigningParams {
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
            session_token: None,
            region: "us-east-1",
            service: "bedrock",
        };
        // Signing embeds the current timestamp, so we only assert shape/stability
        // of the canonical-request pipeline, not a fixed golden signature.
        let signed1 = sign(&params, "POST", "bedrock-runtime.us-east-1.amazonaws.com", "/model/anthropic.claude-v2/invoke", "", b"{}");
        assert!(signed1.authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(signed1.authorization.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert_eq!(signed1.amz_date.len(), 16);
    }

    #[test]
    fn session_token_is_carried_through() {
        let params = SigningParams {
            access_key_id: "AKID",
            secret_access_key: "secret",
            session_token: Some("token123"),
            region: "us-west-2",
            service: "bedrock",
        };
        let signed = sign(&params, "POST", "host", "/", "", b"");
        assert_eq!(signed.security_token.as_deref(), Some("token123"));
    }

    #[test]
    fn session_token_is_included_in_signed_headers() {
        let params = SigningParams {
            access_key_id: "AKID",
            secret_access_key: "secret",
            session_token: Some("token123"),
            region: "us-west-2",
            service: "bedrock",
        };
        let signed = sign(&params, "POST", "host", "/", "", b"");
        assert!(signed
            .authorization
            .contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date;x-amz-security-token"));
    }
}
