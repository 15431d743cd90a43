//! Manifest COPY assembly and the load credentials it embeds.
//!
//! The bulk loader cannot take parameter placeholders, so the COPY statement
//! is assembled from escaped pieces. Credentials ride inside the statement;
//! tokens close to expiry are refreshed before the statement is built so a
//! long COPY does not outlive its token.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use granary_core::{Error, Result};

use crate::ddl::{escape_literal, quote_ident, reject_nul};

/// Fixed import options for a single-object COPY.
const IMPORT_OPTIONS: &str = "removequotes delimiter '\\t' gzip escape truncatecolumns \
     roundec fillrecord compupdate on emptyasnull acceptinvchars '?' trimblanks;";

/// Fixed import options for a manifest COPY.
const MANIFEST_IMPORT_OPTIONS: &str = "removequotes delimiter '\\t' gzip escape truncatecolumns \
     roundec fillrecord compupdate on emptyasnull acceptinvchars '?' manifest trimblanks;";

/// What a COPY reads from.
///
/// The loader only issues manifest COPYies; the single-object shape exists
/// for operator tooling that replays one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// A manifest document listing fragment URLs.
    Manifest(String),
    /// One fragment object.
    Object(String),
}

impl CopySource {
    fn url(&self) -> &str {
        match self {
            Self::Manifest(url) | Self::Object(url) => url,
        }
    }

    fn import_options(&self) -> &'static str {
        match self {
            Self::Manifest(_) => MANIFEST_IMPORT_OPTIONS,
            Self::Object(_) => IMPORT_OPTIONS,
        }
    }
}

/// Refresh credentials when they are within this many hours of expiring.
const CREDENTIAL_REFRESH_MARGIN_HOURS: i64 = 2;

/// Credentials handed to the warehouse for reading the manifest's objects.
#[derive(Debug, Clone)]
pub struct CopyCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token for temporary credentials.
    pub session_token: Option<String>,
    /// When the credentials stop working, if they do.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CopyCredentials {
    /// Renders the `WITH CREDENTIALS` literal body.
    #[must_use]
    pub fn as_credential_string(&self) -> String {
        match &self.session_token {
            Some(token) => format!(
                "aws_access_key_id={};aws_secret_access_key={};token={}",
                self.access_key_id, self.secret_access_key, token
            ),
            None => format!(
                "aws_access_key_id={};aws_secret_access_key={}",
                self.access_key_id, self.secret_access_key
            ),
        }
    }

    fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at
            .is_some_and(|expiry| expiry - Utc::now() <= margin)
    }
}

/// Source of load credentials.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Fetches a fresh set of credentials.
    async fn fetch(&self) -> Result<CopyCredentials>;
}

#[async_trait]
impl CredentialsProvider for std::sync::Arc<dyn CredentialsProvider> {
    async fn fetch(&self) -> Result<CopyCredentials> {
        self.as_ref().fetch().await
    }
}

/// Credentials from the process environment (`AWS_ACCESS_KEY_ID`,
/// `AWS_SECRET_ACCESS_KEY`, optional `AWS_SESSION_TOKEN`). Never expire.
#[derive(Debug, Default)]
pub struct EnvCredentials;

#[async_trait]
impl CredentialsProvider for EnvCredentials {
    async fn fetch(&self) -> Result<CopyCredentials> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::Config("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::Config("AWS_SECRET_ACCESS_KEY is not set".to_string()))?;
        Ok(CopyCredentials {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
            expires_at: None,
        })
    }
}

/// Caches credentials from an inner provider, refetching when they are
/// within two hours of expiry.
pub struct CachedCredentials<P> {
    inner: P,
    cached: Mutex<Option<CopyCredentials>>,
}

impl<P: CredentialsProvider> CachedCredentials<P> {
    /// Wraps `inner` with caching.
    #[must_use]
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }

    /// Current credentials, refreshed if absent or near expiry.
    pub async fn current(&self) -> Result<CopyCredentials> {
        let mut cached = self.cached.lock().await;
        let needs_refresh = match cached.as_ref() {
            Some(creds) => creds.expires_within(Duration::hours(CREDENTIAL_REFRESH_MARGIN_HOURS)),
            None => true,
        };
        if needs_refresh {
            *cached = Some(self.inner.fetch().await?);
        }
        Ok(cached.as_ref().cloned().unwrap_or_else(|| CopyCredentials {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: None,
            expires_at: None,
        }))
    }
}

/// Assembles a COPY statement for the given source.
pub fn copy_sql(table: &str, source: &CopySource, credentials: &CopyCredentials) -> Result<String> {
    reject_nul("table name", table)?;
    reject_nul("copy source url", source.url())?;
    Ok(format!(
        "COPY {} FROM {} WITH CREDENTIALS {} {}",
        quote_ident(table),
        escape_literal(source.url()),
        escape_literal(&credentials.as_credential_string()),
        source.import_options()
    ))
}

/// Assembles the manifest COPY statement.
pub fn manifest_copy_sql(
    table: &str,
    manifest_url: &str,
    credentials: &CopyCredentials,
) -> Result<String> {
    copy_sql(
        table,
        &CopySource::Manifest(manifest_url.to_string()),
        credentials,
    )
}

/// The ILIKE pattern used to find a manifest's COPY in the query history.
#[must_use]
pub fn copy_search_pattern(manifest_url: &str) -> String {
    format!("COPY % FROM '{manifest_url}' %")
}
