//! S3-compatible object client.
//!
//! Objects are addressed as `https://{bucket}.{host}/{path}` and requests are
//! authenticated with an HMAC-SHA1 signature over the canonical request line,
//! which is what the bucket-style endpoints this tool targets accept.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::config::SyncConfig;
use crate::errors::{SyncError, SyncResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_ATTEMPTS: u32 = 5;

/// Known remote error codes, mapped from the response (`x-amz-error-code`
/// header or the XML error document). Everything unrecognized stays
/// retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteErrorCode {
    /// Misconfigured access key. Fatal for the whole run.
    InvalidAccessKeyId,
    /// Misconfigured secret key. Fatal for the whole run.
    SignatureDoesNotMatch,
    /// The bucket lives elsewhere; retrying cannot help this object.
    IncorrectEndpoint,
    BadRequest,
    NotFound,
    Unknown(String),
}

impl RemoteErrorCode {
    pub fn parse(code: &str, status: u16) -> Self {
        match code {
            "InvalidAccessKeyId" => Self::InvalidAccessKeyId,
            "SignatureDoesNotMatch" => Self::SignatureDoesNotMatch,
            "IncorrectEndpoint" | "PermanentRedirect" => Self::IncorrectEndpoint,
            "NoSuchKey" => Self::NotFound,
            "" | "Unknown" => match status {
                400 => Self::BadRequest,
                404 => Self::NotFound,
                _ => Self::Unknown(format!("http-{status}")),
            },
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Credential errors abort the entire run rather than a single task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidAccessKeyId | Self::SignatureDoesNotMatch)
    }

    /// Terminal per-object errors are never retried; the task is dropped and
    /// the expected-byte total corrected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::IncorrectEndpoint | Self::BadRequest | Self::NotFound)
    }
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAccessKeyId => write!(f, "InvalidAccessKeyId"),
            Self::SignatureDoesNotMatch => write!(f, "SignatureDoesNotMatch"),
            Self::IncorrectEndpoint => write!(f, "IncorrectEndpoint"),
            Self::BadRequest => write!(f, "BadRequest"),
            Self::NotFound => write!(f, "NotFound"),
            Self::Unknown(code) => write!(f, "{code}"),
        }
    }
}

pub struct ObjectStore {
    http: reqwest::Client,
    bucket: String,
    host: String,
    access_key: String,
    secret_key: String,
}

impl ObjectStore {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hashsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            bucket: config.bucket.clone(),
            host: config.host.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    pub fn object_url(&self, path: &str) -> String {
        format!(
            "https://{}.{}/{}",
            self.bucket,
            self.host,
            path.trim_start_matches('/')
        )
    }

    /// Starts a GET whose body the caller streams. A non-success status is
    /// classified into [`RemoteErrorCode`] before the caller sees it.
    pub async fn get(&self, path: &str) -> SyncResult<reqwest::Response> {
        let response = self.signed(reqwest::Method::GET, path).send().await?;
        self.check(response).await
    }

    /// Object size via content-length.
    pub async fn head_size(&self, path: &str) -> SyncResult<u64> {
        let response = self.signed(reqwest::Method::HEAD, path).send().await?;
        let response = self.check(response).await?;
        Ok(response.content_length().unwrap_or(0))
    }

    /// Builder-side upload, retried the way downloads are: transport
    /// failures and unknown remote codes get another attempt up to the cap,
    /// terminal and credential codes do not.
    pub async fn put(&self, path: &str, body: Vec<u8>) -> SyncResult<()> {
        let mut attempt = 1;
        loop {
            let result = match self
                .signed(reqwest::Method::PUT, path)
                .body(body.clone())
                .send()
                .await
            {
                Ok(response) => self.check(response).await.map(|_| ()),
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if retryable(&err) && attempt < UPLOAD_ATTEMPTS => {
                    tracing::warn!("PUT {path} - attempt #{attempt} failed ({err}), retrying...");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Builder-side object removal.
    pub async fn delete(&self, path: &str) -> SyncResult<()> {
        let response = self.signed(reqwest::Method::DELETE, path).send().await?;
        self.check(response).await?;
        Ok(())
    }

    fn signed(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let resource = format!("/{}/{}", self.bucket, path.trim_start_matches('/'));
        let string_to_sign = format!("{method}\n\n\n{date}\n{resource}");
        let signature = self.sign(&string_to_sign);
        self.http
            .request(method, self.object_url(path))
            .header("Date", date)
            .header(
                "Authorization",
                format!("AWS {}:{signature}", self.access_key),
            )
    }

    fn sign(&self, string_to_sign: &str) -> String {
        let mut mac = Hmac::<Sha1>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(string_to_sign.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    async fn check(&self, response: reqwest::Response) -> SyncResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let header_code = header_str(&response, "x-amz-error-code");
        let header_message = header_str(&response, "x-amz-error-message");
        let body = response.text().await.unwrap_or_default();
        let code = header_code
            .or_else(|| xml_tag(&body, "Code"))
            .unwrap_or_default();
        let message = header_message
            .or_else(|| xml_tag(&body, "Message"))
            .unwrap_or_else(|| "Error".to_string());

        Err(SyncError::Remote {
            code: RemoteErrorCode::parse(&code, status.as_u16()),
            status: status.as_u16(),
            message,
        })
    }
}

/// Whether an upload failure is worth another attempt. Terminal per-object
/// codes and credential codes are not; everything else is treated as
/// transient.
fn retryable(err: &SyncError) -> bool {
    match err {
        SyncError::Remote { code, .. } => !code.is_fatal() && !code.is_terminal(),
        _ => true,
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Pulls `<tag>value</tag>` out of an XML error document. The error bodies
/// are tiny and flat, so a substring scan beats a full XML dependency.
fn xml_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}
