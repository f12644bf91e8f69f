//! S3-compatible object store.
//!
//! Lists and downloads archive objects over the S3 REST API with AWS
//! Signature V4 authentication. Works against AWS S3, MinIO, and Google
//! Cloud Storage's interoperability endpoint (HMAC keys, region `auto`).
//!
//! # Configuration
//!
//! ```toml
//! [remote]
//! kind = "s3"
//! bucket = "wearables-data-insights"
//! prefix = "oa_bulk/"
//! region = "auto"
//! endpoint_url = "https://storage.googleapis.com"
//! ```
//!
//! Without `endpoint_url` requests go to virtual-hosted
//! `<bucket>.s3.<region>.amazonaws.com`; with one they are path-style,
//! `<endpoint>/<bucket>/<key>`.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional)
//!
//! # Pagination
//!
//! `ListObjectsV2` is followed through `NextContinuationToken` until the
//! listing is no longer truncated.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::config::S3RemoteConfig;
use crate::models::RemoteArchive;
use crate::remote::ObjectStore;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of the empty payload; every request here is a bodiless GET.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// An S3 bucket reachable with SigV4-signed requests.
pub struct S3Store {
    config: S3RemoteConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Store {
    /// Create a store using credentials from the environment.
    ///
    /// Missing credentials are a configuration error: no download can
    /// succeed without them.
    pub fn from_env(config: S3RemoteConfig) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        Ok(Self {
            config,
            creds,
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::for_config(&self.config)
    }

    /// Build a signed GET request for `key` (empty for the bucket root).
    fn signed_get(&self, key: &str, query: &[(String, String)]) -> reqwest::RequestBuilder {
        let endpoint = self.endpoint();
        let canonical_uri = endpoint.canonical_uri(key);
        let canonical_query = canonical_query_string(query);

        let signed = sign_get_request(
            &self.creds,
            &self.config.region,
            &endpoint.host,
            &canonical_uri,
            &canonical_query,
            Utc::now(),
        );

        let url = if canonical_query.is_empty() {
            format!("{}://{}{}", endpoint.scheme, endpoint.host, canonical_uri)
        } else {
            format!(
                "{}://{}{}?{}",
                endpoint.scheme, endpoint.host, canonical_uri, canonical_query
            )
        };

        let mut request = self
            .client
            .get(url)
            .header("Authorization", signed.authorization)
            .header("x-amz-content-sha256", EMPTY_PAYLOAD_SHA256)
            .header("x-amz-date", signed.amz_date);
        if let Some(ref token) = self.creds.session_token {
            request = request.header("x-amz-security-token", token);
        }
        request
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn location(&self) -> String {
        format!("s3://{}/{}", self.config.bucket, self.config.prefix)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteArchive>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.signed_get("", &query).send().await.with_context(|| {
                format!(
                    "Failed to list objects in s3://{}/{}",
                    self.config.bucket, prefix
                )
            })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml_body = resp.text().await?;
            let page = parse_list_objects_response(&xml_body);
            objects.extend(page.objects);

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let mut resp = self
            .signed_get(key, &[])
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.config.bucket, key))?;

        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

// ============ AWS Credentials ============

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Endpoint Addressing ============

struct Endpoint {
    scheme: String,
    host: String,
    /// Bucket segment prepended to the path for path-style addressing.
    path_bucket: Option<String>,
}

impl Endpoint {
    fn for_config(config: &S3RemoteConfig) -> Self {
        match config.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                Self {
                    scheme: scheme.to_string(),
                    host,
                    path_bucket: Some(config.bucket.clone()),
                }
            }
            None => Self {
                scheme: "https".to_string(),
                host: format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
                path_bucket: None,
            },
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match self.path_bucket {
            Some(ref bucket) if key.is_empty() => format!("/{}", uri_encode(bucket)),
            Some(ref bucket) => format!("/{}/{}", uri_encode(bucket), encoded_key),
            None => format!("/{}", encoded_key),
        }
    }
}

// ============ AWS SigV4 ============

struct SignedHeaders {
    authorization: String,
    amz_date: String,
}

fn sign_get_request(
    creds: &AwsCredentials,
    region: &str,
    host: &str,
    canonical_uri: &str,
    canonical_query: &str,
    now: DateTime<Utc>,
) -> SignedHeaders {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut headers = vec![
        ("host".to_string(), host.to_string()),
        (
            "x-amz-content-sha256".to_string(),
            EMPTY_PAYLOAD_SHA256.to_string(),
        ),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "GET\n{}\n{}\n{}\n{}\n{}",
        canonical_uri, canonical_query, canonical_headers, signed_headers, EMPTY_PAYLOAD_SHA256
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    SignedHeaders {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        ),
        amz_date,
    }
}

/// Sorted, URI-encoded query string as required by the canonical request.
fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut sorted = params.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ ListObjectsV2 Parsing ============

struct ListPage {
    objects: Vec<RemoteArchive>,
    is_truncated: bool,
    next_token: Option<String>,
}

fn parse_list_objects_response(xml: &str) -> ListPage {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut objects = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key")
            .map(|k| unescape_xml(&k))
            .unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        let size = extract_xml_value(block, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        objects.push(RemoteArchive::new(key, size));
    }

    ListPage {
        objects,
        is_truncated,
        next_token,
    }
}

/// Text content of the first `<tag>…</tag>` (non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn s3_config(endpoint_url: Option<&str>) -> S3RemoteConfig {
        S3RemoteConfig {
            bucket: "articles".to_string(),
            prefix: String::new(),
            region: "us-east-1".to_string(),
            endpoint_url: endpoint_url.map(str::to_string),
        }
    }

    #[test]
    fn signing_key_matches_aws_reference() {
        // Example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn empty_payload_constant_is_sha256_of_nothing() {
        assert_eq!(hex_sha256(b""), EMPTY_PAYLOAD_SHA256);
    }

    #[test]
    fn uri_encode_escapes_reserved() {
        assert_eq!(uri_encode("a b/c~d"), "a%20b%2Fc~d");
        assert_eq!(uri_encode("PMC_01.tar.gz"), "PMC_01.tar.gz");
    }

    #[test]
    fn canonical_query_is_sorted() {
        let q = canonical_query_string(&[
            ("prefix".to_string(), "oa bulk/".to_string()),
            ("list-type".to_string(), "2".to_string()),
        ]);
        assert_eq!(q, "list-type=2&prefix=oa%20bulk%2F");
    }

    #[test]
    fn virtual_hosted_and_path_style_uris() {
        let aws = Endpoint::for_config(&s3_config(None));
        assert_eq!(aws.host, "articles.s3.us-east-1.amazonaws.com");
        assert_eq!(aws.canonical_uri("a/b c.tar.gz"), "/a/b%20c.tar.gz");
        assert_eq!(aws.canonical_uri(""), "/");

        let gcs = Endpoint::for_config(&s3_config(Some("https://storage.googleapis.com/")));
        assert_eq!(gcs.scheme, "https");
        assert_eq!(gcs.host, "storage.googleapis.com");
        assert_eq!(gcs.canonical_uri("x.tar.gz"), "/articles/x.tar.gz");
        assert_eq!(gcs.canonical_uri(""), "/articles");

        let minio = Endpoint::for_config(&s3_config(Some("http://localhost:9000")));
        assert_eq!(minio.scheme, "http");
        assert_eq!(minio.host, "localhost:9000");
    }

    #[test]
    fn authorization_header_shape() {
        let creds = AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
        };
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let signed = sign_get_request(&creds, "auto", "storage.googleapis.com", "/b", "", now);
        assert_eq!(signed.amz_date, "20240501T120000Z");
        assert!(signed
            .authorization
            .starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/auto/s3/aws4_request, "));
        assert!(signed
            .authorization
            .contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date, "));
        let signature = signed.authorization.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn parses_listing_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok-2</NextContinuationToken>
  <Contents><Key>oa/</Key><Size>0</Size></Contents>
  <Contents><Key>oa/part1.tar.gz</Key><Size>1024</Size></Contents>
  <Contents><Key>oa/R&amp;D.tar.gz</Key><Size>7</Size></Contents>
</ListBucketResult>"#;
        let page = parse_list_objects_response(xml);
        assert!(page.is_truncated);
        assert_eq!(page.next_token.as_deref(), Some("tok-2"));
        assert_eq!(page.objects.len(), 2);
        assert_eq!(page.objects[0].key, "oa/part1.tar.gz");
        assert_eq!(page.objects[0].size, 1024);
        assert_eq!(page.objects[1].key, "oa/R&D.tar.gz");
    }
}
