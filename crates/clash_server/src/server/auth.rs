#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use clash_domain::Identity;
use clash_util::SecretString;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Token claims: `sub` is the user id, `name` the username, `exp` Unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub name: String,
	pub exp: u64,
}

/// What the transport captured from the HTTP upgrade request.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
	pub path: String,
	pub query: Option<String>,
	pub authorization: Option<String>,
	pub cookie: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing access token")]
	MissingToken,
	#[error("invalid access token: {0}")]
	Invalid(String),
}

/// Resolves `{userId, username}` for an upgrade request, or rejects it.
pub trait Authenticator: Send + Sync {
	fn verify(&self, req: &UpgradeRequest) -> Result<Identity, AuthError>;
}

/// Stateless `v1.<payload>.<sig>` HMAC-SHA256 tokens.
pub struct HmacAuthenticator {
	secret: SecretString,
}

impl HmacAuthenticator {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

impl Authenticator for HmacAuthenticator {
	fn verify(&self, req: &UpgradeRequest) -> Result<Identity, AuthError> {
		let token = extract_token(req).ok_or(AuthError::MissingToken)?;
		let claims = verify_hmac_token(&token, self.secret.expose()).map_err(|e| AuthError::Invalid(format!("{e:#}")))?;
		Identity::parse(&claims.sub, &claims.name).map_err(|e| AuthError::Invalid(e.to_string()))
	}
}

/// Bearer header first, then a `token` cookie, then a `token` query parameter.
pub fn extract_token(req: &UpgradeRequest) -> Option<String> {
	if let Some(h) = req.authorization.as_deref()
		&& let Some(t) = h.trim().strip_prefix("Bearer ")
		&& !t.trim().is_empty()
	{
		return Some(t.trim().to_string());
	}

	if let Some(cookies) = req.cookie.as_deref()
		&& let Some(t) = find_pair(cookies, ';', "token")
	{
		return Some(t);
	}

	req.query.as_deref().and_then(|q| find_pair(q, '&', "token"))
}

fn find_pair(s: &str, sep: char, key: &str) -> Option<String> {
	s.split(sep)
		.filter_map(|kv| kv.trim().split_once('='))
		.find(|(k, _)| *k == key)
		.map(|(_, v)| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Issue a token; the server itself only verifies, this backs tests and local tooling.
#[cfg(test)]
pub fn mint_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("encode claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
