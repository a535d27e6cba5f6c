//! Shared access signature assembly around an external signer
//!
//! Key material stays in the signer (HSM, TPM or a key vault); this module only
//! builds the string to sign and formats the resulting token.

use crate::error::{TransportError, TransportResult};
use crate::identity::{Credentials, DeviceIdentity};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use url::form_urlencoded;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Signs a byte buffer and returns a base64 signature
#[async_trait]
pub trait TokenSigner: Send + Sync {
    async fn sign(
        &self,
        module_id: Option<&str>,
        generation_id: &str,
        data: &[u8],
    ) -> TransportResult<String>;
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Text the signer signs: `{url-encoded audience}\n{expiry}`
pub fn string_to_sign(audience: &str, expiry_unix_secs: i64) -> String {
    format!("{}\n{}", encode(audience), expiry_unix_secs)
}

/// Format a token; the signature is url-encoded here
pub fn format_token(
    audience: &str,
    signature: &str,
    expiry_unix_secs: i64,
    key_name: Option<&str>,
) -> String {
    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encode(audience),
        encode(signature),
        expiry_unix_secs
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&encode(name));
    }
    token
}

/// Build a fresh token for `identity` with the given lifetime
pub async fn build_sas_token(
    identity: &DeviceIdentity,
    signer: &dyn TokenSigner,
    generation_id: &str,
    ttl: Duration,
) -> TransportResult<String> {
    let audience = identity.audience();
    let expiry = Utc::now().timestamp() + ttl.as_secs() as i64;
    let to_sign = string_to_sign(&audience, expiry);

    let signature = signer
        .sign(identity.module_id(), generation_id, to_sign.as_bytes())
        .await?;
    validate_signature(&signature)?;

    Ok(format_token(
        &audience,
        &signature,
        expiry,
        identity.shared_access_key_name(),
    ))
}

/// Resolve the password presented at connect time, if the credentials use one
pub async fn resolve_password(identity: &DeviceIdentity) -> TransportResult<Option<String>> {
    match identity.credentials() {
        Credentials::SasToken(token) => Ok(Some(token.clone())),
        Credentials::Signer {
            signer,
            generation_id,
        } => build_sas_token(identity, signer.as_ref(), generation_id, DEFAULT_TOKEN_TTL)
            .await
            .map(Some),
        Credentials::X509 { .. } => Ok(None),
    }
}

/// Reject empty signatures before they reach the wire
pub fn validate_signature(signature: &str) -> TransportResult<()> {
    if signature.trim().is_empty() {
        return Err(TransportError::fatal("token signer returned an empty signature"));
    }
    Ok(())
}
