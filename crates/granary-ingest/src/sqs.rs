//! SQS-compatible queue consumer over the AWS JSON protocol.
//!
//! Speaks `x-amz-json-1.0` directly through `reqwest` with a minimal
//! SigV4 signer. Static credentials come from the environment; pointing
//! `endpoint` at a local SQS emulator works with any placeholder keys.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use granary_core::{Error, Result};

use crate::queue::{QueueConsumer, QueueMessage};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "sqs";

/// SQS consumer configuration.
#[derive(Debug, Clone)]
pub struct SqsConfig {
    /// Full queue URL (e.g. `https://sqs.us-west-2.amazonaws.com/123/frags`).
    pub queue_url: String,
    /// Signing region.
    pub region: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token for temporary credentials.
    pub session_token: Option<String>,
}

impl SqsConfig {
    /// Builds a config from the queue URL, region, and the standard AWS
    /// environment variables.
    pub fn from_env(queue_url: impl Into<String>, region: impl Into<String>) -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::Config("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::Config("AWS_SECRET_ACCESS_KEY is not set".to_string()))?;
        Ok(Self {
            queue_url: queue_url.into(),
            region: region.into(),
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }

    fn endpoint(&self) -> Result<(String, String)> {
        let rest = self
            .queue_url
            .strip_prefix("https://")
            .or_else(|| self.queue_url.strip_prefix("http://"))
            .ok_or_else(|| Error::Config(format!("unusable queue url {:?}", self.queue_url)))?;
        let scheme = if self.queue_url.starts_with("https://") {
            "https"
        } else {
            "http"
        };
        let host = rest.split('/').next().unwrap_or(rest).to_string();
        Ok((format!("{scheme}://{host}"), host))
    }
}

/// SQS-backed [`QueueConsumer`].
pub struct SqsQueue {
    config: SqsConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ReceiveResponse {
    #[serde(rename = "Messages", default)]
    messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
struct ReceivedMessage {
    #[serde(rename = "MessageId")]
    message_id: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
    #[serde(rename = "Body")]
    body: String,
}

impl SqsQueue {
    /// Creates the consumer.
    pub fn new(config: SqsConfig) -> Result<Self> {
        config.endpoint()?;
        let client = reqwest::Client::builder()
            // Above the longest supported long-poll (20s).
            .timeout(Duration::from_secs(40))
            .build()
            .map_err(|e| Error::Config(format!("building sqs client: {e}")))?;
        Ok(Self { config, client })
    }

    async fn call(&self, target: &str, body: String) -> Result<String> {
        let (endpoint, host) = self.config.endpoint()?;
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut signed_headers: Vec<(String, String)> = vec![
            ("content-type".to_string(), "application/x-amz-json-1.0".to_string()),
            ("host".to_string(), host),
            ("x-amz-date".to_string(), amz_date.clone()),
            ("x-amz-target".to_string(), target.to_string()),
        ];
        if let Some(token) = &self.config.session_token {
            signed_headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        signed_headers.sort();

        let authorization = sign_request(
            &signed_headers,
            &body,
            &amz_date,
            &date,
            &self.config.region,
            &self.config.access_key_id,
            &self.config.secret_access_key,
        );

        let mut request = self.client.post(&endpoint).body(body);
        for (name, value) in &signed_headers {
            if name != "host" {
                request = request.header(name, value);
            }
        }
        request = request.header("authorization", authorization);

        let response = request
            .send()
            .await
            .map_err(|e| Error::storage_with_source("calling sqs", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::storage_with_source("reading sqs response", e))?;
        if !status.is_success() {
            return Err(Error::storage(format!("sqs returned {status}: {text}")));
        }
        Ok(text)
    }
}

/// Builds the SigV4 `Authorization` header for a POST to `/`.
fn sign_request(
    signed_headers: &[(String, String)],
    body: &str,
    amz_date: &str,
    date: &str,
    region: &str,
    access_key_id: &str,
    secret_access_key: &str,
) -> String {
    let header_names: Vec<&str> = signed_headers.iter().map(|(n, _)| n.as_str()).collect();
    let signed_header_list = header_names.join(";");
    let canonical_headers: String = signed_headers
        .iter()
        .map(|(n, v)| format!("{n}:{}\n", v.trim()))
        .collect();

    let canonical_request = format!(
        "POST\n/\n\n{canonical_headers}\n{signed_header_list}\n{}",
        hex::encode(Sha256::digest(body.as_bytes()))
    );

    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{secret_access_key}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={access_key_id}/{scope}, \
         SignedHeaders={signed_header_list}, Signature={signature}"
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(key).unwrap_or_else(|_| {
            HmacSha256::new_from_slice(b"-").expect("hmac accepts any key")
        });
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[async_trait]
impl QueueConsumer for SqsQueue {
    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        // SQS caps long-poll waits at 20 seconds per request.
        let wait_secs = wait.as_secs().min(20);
        let body = serde_json::json!({
            "QueueUrl": self.config.queue_url,
            "MaxNumberOfMessages": max_messages.clamp(1, 10),
            "WaitTimeSeconds": wait_secs,
        })
        .to_string();

        let text = self.call("AmazonSQS.ReceiveMessage", body).await?;
        let response: ReceiveResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Serialization(format!("decoding sqs receive response: {e}")))?;
        Ok(response
            .messages
            .into_iter()
            .map(|m| QueueMessage {
                id: m.message_id,
                receipt: m.receipt_handle,
                body: m.body,
            })
            .collect())
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<()> {
        let body = serde_json::json!({
            "QueueUrl": self.config.queue_url,
            "ReceiptHandle": message.receipt,
        })
        .to_string();
        self.call("AmazonSQS.DeleteMessage", body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(amz_date: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "content-type".to_string(),
                "application/x-amz-json-1.0".to_string(),
            ),
            ("host".to_string(), "sqs.us-west-2.amazonaws.com".to_string()),
            ("x-amz-date".to_string(), amz_date.to_string()),
            (
                "x-amz-target".to_string(),
                "AmazonSQS.ReceiveMessage".to_string(),
            ),
        ];
        headers.sort();
        headers
    }

    #[test]
    fn signature_is_deterministic() {
        let a = sign_request(
            &headers("20260101T000000Z"),
            "{}",
            "20260101T000000Z",
            "20260101",
            "us-west-2",
            "AKIATEST",
            "secret",
        );
        let b = sign_request(
            &headers("20260101T000000Z"),
            "{}",
            "20260101T000000Z",
            "20260101",
            "us-west-2",
            "AKIATEST",
            "secret",
        );
        assert_eq!(a, b);
        assert!(a.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIATEST/20260101/us-west-2/sqs/aws4_request"
        ));
        assert!(a.contains(
            "SignedHeaders=content-type;host;x-amz-date;x-amz-target"
        ));
    }

    #[test]
    fn signature_depends_on_body_and_key() {
        let base = sign_request(
            &headers("20260101T000000Z"),
            "{}",
            "20260101T000000Z",
            "20260101",
            "us-west-2",
            "AKIATEST",
            "secret",
        );
        let other_body = sign_request(
            &headers("20260101T000000Z"),
            r#"{"QueueUrl":"x"}"#,
            "20260101T000000Z",
            "20260101",
            "us-west-2",
            "AKIATEST",
            "secret",
        );
        let other_key = sign_request(
            &headers("20260101T000000Z"),
            "{}",
            "20260101T000000Z",
            "20260101",
            "us-west-2",
            "AKIATEST",
            "other",
        );
        assert_ne!(base, other_body);
        assert_ne!(base, other_key);
    }

    #[test]
    fn endpoint_extraction() {
        let config = SqsConfig {
            queue_url: "https://sqs.us-west-2.amazonaws.com/123/frags".to_string(),
            region: "us-west-2".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            session_token: None,
        };
        let (endpoint, host) = config.endpoint().expect("endpoint");
        assert_eq!(endpoint, "https://sqs.us-west-2.amazonaws.com");
        assert_eq!(host, "sqs.us-west-2.amazonaws.com");

        let bad = SqsConfig {
            queue_url: "not-a-url".to_string(),
            ..config
        };
        assert!(bad.endpoint().is_err());
    }
}
