//! AWS Signature Version 4 for S3-compatible stores.

use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// SHA-256 of an empty body.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Request parts that take part in the signature.
pub struct SigningRequest<'a> {
    pub method: &'a str,
    /// `host[:port]` exactly as sent in the `Host` header.
    pub host: &'a str,
    /// Unencoded absolute path, e.g. `/bucket/models/bert/1/config.json`.
    pub path: &'a str,
    pub query: &'a [(String, String)],
    /// Extra headers to sign besides `host`, `x-amz-content-sha256` and `x-amz-date`.
    pub headers: &'a [(String, String)],
    pub payload_sha256: &'a str,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| {
        Error::configuration_with_context(
            format!("cannot key request signature: {}", e),
            ErrorContext::new().with_source("sigv4"),
        )
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// RFC 3986 encoding as S3 expects it: unreserved characters pass through, `/` only
/// when `keep_slash` is set.
pub fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

pub fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k, false), uri_encode(v, false)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Sign `req`, returning the headers to attach (`x-amz-date`, `x-amz-content-sha256`,
/// `authorization`).
pub fn sign(
    creds: &Credentials,
    req: &SigningRequest<'_>,
    at: DateTime<Utc>,
) -> Result<Vec<(String, String)>> {
    let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
    let date = at.format("%Y%m%d").to_string();

    let mut headers: Vec<(String, String)> = vec![
        ("host".to_string(), req.host.to_string()),
        ("x-amz-content-sha256".to_string(), req.payload_sha256.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    headers.extend(
        req.headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string())),
    );
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        req.method,
        uri_encode(req.path, true),
        canonical_query(req.query),
        canonical_headers,
        signed_headers,
        req.payload_sha256
    );

    let scope = format!("{}/{}/{}/aws4_request", date, creds.region, SERVICE);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );
    let key = signing_key(&creds.secret_key, &date, &creds.region, SERVICE)?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    Ok(vec![
        ("x-amz-date".to_string(), amz_date),
        ("x-amz-content-sha256".to_string(), req.payload_sha256.to_string()),
        (
            "authorization".to_string(),
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, creds.access_key, scope, signed_headers, signature
            ),
        ),
    ])
}
