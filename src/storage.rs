use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection, timeout, and body-read failures. Always retryable.
    #[error("transport error: {0}")]
    Transport(String),
    /// Non-2xx response from the storage service.
    #[error("storage returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("object not found")]
    NotFound,
    /// Response arrived but did not carry what the protocol promises.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::NotFound | Self::Protocol(_) => false,
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Durable object storage as the upload pipeline sees it. The production
/// implementation is [`S3Store`]; tests script outcomes through mocks.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Remote byte size, used to verify a finished upload.
    async fn head_object_size(&self, key: &str) -> Result<u64, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    /// Returns the upload id for a new multipart session.
    async fn create_multipart(&self, key: &str, content_type: &str)
        -> Result<String, StorageError>;

    /// Returns the part's ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String, StorageError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<(), StorageError>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    fn public_url(&self, key: &str) -> String;
}

/// S3-compatible REST client with SigV4 request signing. A fresh reqwest
/// client is built per request so each upload attempt starts from clean
/// connection state with the caller's timeouts.
#[derive(Debug, Clone)]
pub struct S3Store {
    config: StorageConfig,
    read_timeout: Duration,
}

impl S3Store {
    pub fn new(config: StorageConfig, read_timeout: Duration) -> Self {
        Self {
            config,
            read_timeout,
        }
    }

    /// Scheme for request URLs. Custom endpoints keep their configured
    /// scheme so plain-http services stay reachable; AWS proper is https.
    fn scheme(&self) -> &'static str {
        match &self.config.endpoint {
            Some(endpoint) if endpoint.starts_with("http://") => "http",
            _ => "https",
        }
    }

    fn host(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("s3.{}.amazonaws.com", self.config.region),
        }
    }

    fn object_uri(&self, key: &str) -> String {
        format!(
            "/{}/{}",
            uri_encode(&self.config.bucket, false),
            uri_encode(key, false)
        )
    }

    async fn signed_request(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response, StorageError> {
        let host = self.host();
        let uri = self.object_uri(key);
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(&body));

        let mut canonical_query: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
            .collect();
        canonical_query.sort();
        let canonical_query = canonical_query.join("&");

        // Every x-amz-* header must be signed; keep the set minimal.
        let headers: Vec<(&str, &str)> = vec![
            ("host", host.as_str()),
            ("x-amz-content-sha256", payload_hash.as_str()),
            ("x-amz-date", amz_date.as_str()),
        ];
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| *k)
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{date}/{}/s3/aws4_request", self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key_bytes = signing_key(&self.config.secret_key, &date, &self.config.region, "s3");
        let signature = hex::encode(hmac_sha256(&key_bytes, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key
        );

        let url = if canonical_query.is_empty() {
            format!("{}://{host}{uri}", self.scheme())
        } else {
            format!("{}://{host}{uri}?{canonical_query}", self.scheme())
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(self.read_timeout)
            .build()?;

        let mut request = client
            .request(method, url)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", authorization);
        if let Some(content_type) = content_type {
            request = request.header("content-type", content_type.to_string());
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 404 {
            return Err(StorageError::NotFound);
        }
        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Status {
            status: code,
            body: body.chars().take(512).collect(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .signed_request(Method::PUT, key, &[], body, Some(content_type))
            .await?;
        Self::check_status(response).await.map(|_| ())
    }

    async fn head_object_size(&self, key: &str) -> Result<u64, StorageError> {
        let response = self
            .signed_request(Method::HEAD, key, &[], Vec::new(), None)
            .await?;
        let response = Self::check_status(response).await?;
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StorageError::Protocol("HEAD response missing content-length".into()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let response = self
            .signed_request(Method::DELETE, key, &[], Vec::new(), None)
            .await?;
        match Self::check_status(response).await {
            Ok(_) | Err(StorageError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn create_multipart(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let response = self
            .signed_request(
                Method::POST,
                key,
                &[("uploads", String::new())],
                Vec::new(),
                Some(content_type),
            )
            .await?;
        let response = Self::check_status(response).await?;
        let body = response.text().await?;
        extract_xml_tag(&body, "UploadId")
            .ok_or_else(|| StorageError::Protocol("initiate response missing UploadId".into()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String, StorageError> {
        let response = self
            .signed_request(
                Method::PUT,
                key,
                &[
                    ("partNumber", part_number.to_string()),
                    ("uploadId", upload_id.to_string()),
                ],
                body,
                None,
            )
            .await?;
        let response = Self::check_status(response).await?;
        response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| StorageError::Protocol("part response missing ETag".into()))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<(), StorageError> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for (number, etag) in parts {
            body.push_str(&format!(
                "<Part><PartNumber>{number}</PartNumber><ETag>{etag}</ETag></Part>"
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let response = self
            .signed_request(
                Method::POST,
                key,
                &[("uploadId", upload_id.to_string())],
                body.into_bytes(),
                Some("application/xml"),
            )
            .await?;
        let response = Self::check_status(response).await?;
        // S3 reports some completion failures inside a 200 body.
        let text = response.text().await?;
        if text.contains("<Error>") {
            return Err(StorageError::Protocol(format!(
                "complete-multipart error body: {}",
                text.chars().take(512).collect::<String>()
            )));
        }
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        let response = self
            .signed_request(
                Method::DELETE,
                key,
                &[("uploadId", upload_id.to_string())],
                Vec::new(),
                None,
            )
            .await?;
        match Self::check_status(response).await {
            Ok(_) | Err(StorageError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn public_url(&self, key: &str) -> String {
        match &self.config.endpoint {
            Some(endpoint) if endpoint.contains("backblazeb2.com") => {
                format!("https://f005.backblazeb2.com/file/{}/{key}", self.config.bucket)
            }
            Some(endpoint) => {
                format!("{}/{}/{key}", endpoint.trim_end_matches('/'), self.config.bucket)
            }
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{key}",
                self.config.bucket, self.config.region
            ),
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    const BLOCK: usize = 64;
    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        let digest = Sha256::digest(key);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    inner.update(key_block.map(|b| b ^ 0x36));
    inner.update(data);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(key_block.map(|b| b ^ 0x5c));
    outer.update(inner_hash);
    outer.finalize().into()
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> [u8; 32] {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// SigV4 URI encoding: unreserved characters pass through, everything else
/// becomes uppercase percent escapes. Path encoding keeps `/` literal.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn extract_xml_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_rfc4231_vector() {
        // RFC 4231 test case 2.
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn signing_key_matches_aws_example() {
        // Published AWS SigV4 key-derivation example (iam, us-east-1).
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn uri_encode_rules() {
        assert_eq!(uri_encode("a b/c.mp4", false), "a%20b/c.mp4");
        assert_eq!(uri_encode("a b/c.mp4", true), "a%20b%2Fc.mp4");
    }

    #[test]
    fn extract_upload_id_from_initiate_body() {
        let body = "<?xml version=\"1.0\"?><InitiateMultipartUploadResult>\
                    <Bucket>b</Bucket><Key>k</Key><UploadId>abc123</UploadId>\
                    </InitiateMultipartUploadResult>";
        assert_eq!(extract_xml_tag(body, "UploadId").as_deref(), Some("abc123"));
        assert_eq!(extract_xml_tag(body, "Missing"), None);
    }

    #[test]
    fn public_url_shapes() {
        let base = StorageConfig {
            bucket: "vids".into(),
            region: "us-west-2".into(),
            endpoint: None,
            access_key: "k".into(),
            secret_key: "s".into(),
        };
        let aws = S3Store::new(base.clone(), Duration::from_secs(1));
        assert_eq!(
            aws.public_url("modal-generated/1_a.mp4"),
            "https://vids.s3.us-west-2.amazonaws.com/modal-generated/1_a.mp4"
        );

        let mut b2_config = base.clone();
        b2_config.endpoint = Some("https://s3.us-west-004.backblazeb2.com".into());
        let b2 = S3Store::new(b2_config, Duration::from_secs(1));
        assert_eq!(
            b2.public_url("k"),
            "https://f005.backblazeb2.com/file/vids/k"
        );

        let mut custom_config = base;
        custom_config.endpoint = Some("https://minio.local:9000/".into());
        let custom = S3Store::new(custom_config, Duration::from_secs(1));
        assert_eq!(custom.public_url("k"), "https://minio.local:9000/vids/k");
    }

    #[test]
    fn request_scheme_follows_endpoint() {
        let base = StorageConfig {
            bucket: "vids".into(),
            region: "us-east-1".into(),
            endpoint: None,
            access_key: "k".into(),
            secret_key: "s".into(),
        };
        let aws = S3Store::new(base.clone(), Duration::from_secs(1));
        assert_eq!(aws.scheme(), "https");

        let mut plain = base.clone();
        plain.endpoint = Some("http://minio.local:9000".into());
        assert_eq!(S3Store::new(plain, Duration::from_secs(1)).scheme(), "http");

        let mut tls = base;
        tls.endpoint = Some("https://s3.us-west-004.backblazeb2.com".into());
        assert_eq!(S3Store::new(tls, Duration::from_secs(1)).scheme(), "https");
    }

    #[test]
    fn transient_classification() {
        assert!(StorageError::Transport("timed out".into()).is_transient());
        assert!(StorageError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!StorageError::Status {
            status: 403,
            body: String::new()
        }
        .is_transient());
        assert!(!StorageError::NotFound.is_transient());
    }
}
