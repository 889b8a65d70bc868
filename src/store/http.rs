//! ClickHouse HTTP transport
//!
//! Statements travel in the POST body; server settings and, for inserts, the
//! `INSERT ... FORMAT` header statement travel as URL parameters so the body
//! can carry the data stream.

use super::{ByteStream, InsertRequest, InsertSummary, Setting, StoreTransport};
use crate::config::{ConnectionConfig, Credential};
use crate::error::{BridgeError, Result};
use crate::query::quote_identifier;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode, Url};
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::debug;

const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";

const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

const TYPE_ERROR_MARKERS: &[&str] = &[
    "CANNOT_PARSE",
    "Cannot parse",
    "TYPE_MISMATCH",
    "CANNOT_CONVERT_TYPE",
    "INCORRECT_DATA",
];

/// Whether an error message says the credentials were rejected.
pub fn indicates_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("authentication failed")
        || lower.contains("authentication_failed")
        || lower.contains("required_password")
        || lower.contains("unauthorized")
}

/// Map a failed response to the error taxonomy.
pub fn classify_failure(status: StatusCode, body: &str) -> BridgeError {
    let message = match body.trim() {
        "" => status.to_string(),
        text => text.to_string(),
    };
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || indicates_auth_failure(&message)
    {
        BridgeError::Authentication(message)
    } else if TYPE_ERROR_MARKERS.iter().any(|m| message.contains(m)) {
        BridgeError::Type(message)
    } else {
        BridgeError::Query(message)
    }
}

/// `written_rows` from an `X-ClickHouse-Summary` header value.
fn parse_summary(raw: &str) -> Option<u64> {
    let summary: serde_json::Value = serde_json::from_str(raw).ok()?;
    match &summary["written_rows"] {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// `Body::wrap_stream` wants `Sync`; the stream is only ever polled through
/// `&mut`, so the mutex is never contended.
struct SyncBody(Mutex<ByteStream>);

impl Stream for SyncBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let stream = self
            .get_mut()
            .0
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stream.as_mut().poll_next(cx)
    }
}

pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    database: String,
    credential: Credential,
    query_timeout: Duration,
    target: String,
}

impl HttpTransport {
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = Url::parse(&config.endpoint()).map_err(|e| {
            BridgeError::Config(format!("invalid endpoint {}: {}", config.endpoint(), e))
        })?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        let credential = config.credential();
        let principal = match &credential {
            Credential::Token(_) => "<token>".to_string(),
            Credential::Password { username, .. } => username.clone(),
        };
        let target = format!("{}{}@{}", endpoint, config.database(), principal);

        Ok(Self {
            client,
            endpoint,
            database: config.database().to_string(),
            credential,
            query_timeout: config.query_timeout(),
            target,
        })
    }

    fn url_with(&self, params: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    fn request(&self, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .post(url)
            .header("X-ClickHouse-Database", &self.database);
        match &self.credential {
            Credential::Token(token) => builder.bearer_auth(token),
            Credential::Password { username, password } => builder
                .header("X-ClickHouse-User", username)
                .header("X-ClickHouse-Key", password),
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &self.scrub(&body)))
    }

    fn scrub(&self, text: &str) -> String {
        let secret = self.credential.secret();
        if secret.is_empty() {
            text.to_string()
        } else {
            text.replace(secret, "***")
        }
    }
}

#[async_trait]
impl StoreTransport for HttpTransport {
    fn target(&self) -> &str {
        &self.target
    }

    async fn ping(&self) -> Result<()> {
        self.query_text("SELECT 1").await.map(|_| ())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        debug!(store = %self.target, "execute: {}", sql.chars().take(200).collect::<String>());
        self.send(
            self.request(self.url_with(&[]))
                .timeout(self.query_timeout)
                .body(sql.to_string()),
        )
        .await?;
        Ok(())
    }

    async fn query_text(&self, sql: &str) -> Result<String> {
        debug!(store = %self.target, "query: {}", sql);
        let response = self
            .send(
                self.request(self.url_with(&[]))
                    .timeout(self.query_timeout)
                    .body(sql.to_string()),
            )
            .await?;
        Ok(response.text().await?)
    }

    async fn query_stream(&self, sql: &str, settings: &[Setting]) -> Result<ByteStream> {
        debug!(store = %self.target, "stream query: {}", sql);
        let params = settings
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<Vec<_>>();
        let response = self
            .send(self.request(self.url_with(&params)).body(sql.to_string()))
            .await?;
        if response.headers().contains_key(EXCEPTION_CODE_HEADER) {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &self.scrub(&body)));
        }
        Ok(response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed())
    }

    async fn insert_stream(
        &self,
        request: InsertRequest,
        body: ByteStream,
    ) -> Result<InsertSummary> {
        let statement = format!(
            "INSERT INTO {} FORMAT {}",
            quote_identifier(&request.table),
            request.format
        );
        debug!(store = %self.target, "bulk insert: {}", statement);
        let mut params = vec![("query", statement.as_str())];
        params.extend(request.settings.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let response = self
            .send(
                self.request(self.url_with(&params))
                    .body(Body::wrap_stream(SyncBody(Mutex::new(body)))),
            )
            .await?;
        let written_rows = response
            .headers()
            .get(SUMMARY_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_summary);
        Ok(InsertSummary { written_rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, ""),
            BridgeError::Authentication(_)
        ));
        assert!(matches!(
            classify_failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Code: 516. DB::Exception: default: Authentication failed: \
                 password is incorrect. (AUTHENTICATION_FAILED)"
            ),
            BridgeError::Authentication(_)
        ));
        assert!(matches!(
            classify_failure(
                StatusCode::BAD_REQUEST,
                "Code: 27. DB::Exception: Cannot parse input: expected ',' before: 'abc'. \
                 (CANNOT_PARSE_INPUT_ASSERTION_FAILED)"
            ),
            BridgeError::Type(_)
        ));
        assert!(matches!(
            classify_failure(
                StatusCode::NOT_FOUND,
                "Code: 60. DB::Exception: Table uk.t does not exist. (UNKNOWN_TABLE)"
            ),
            BridgeError::Query(_)
        ));
    }

    #[test]
    fn test_parse_summary() {
        assert_eq!(
            parse_summary(concat!(
                r#"{"read_rows":"0","read_bytes":"0","#,
                r#""written_rows":"2001","written_bytes":"9000"}"#
            )),
            Some(2001)
        );
        assert_eq!(parse_summary(r#"{"written_rows":3}"#), Some(3));
        assert_eq!(parse_summary("not json"), None);
    }

    #[test]
    fn test_target_and_url() {
        let config = ConnectionConfig::new("ch.local", "uk").with_password("alice", "s3cret");
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.target(), "http://ch.local:8123/uk@alice");
        assert!(!transport.target().contains("s3cret"));

        let insert = "INSERT INTO `t` FORMAT CSVWithNames";
        let url = transport.url_with(&[("query", insert), ("format_csv_delimiter", ";")]);
        let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
        assert_eq!(pairs[0], ("query".to_string(), insert.to_string()));
        assert_eq!(pairs[1], ("format_csv_delimiter".to_string(), ";".to_string()));
        assert_eq!(transport.scrub("bad password s3cret"), "bad password ***");
    }

    #[test]
    fn test_token_target_hides_token() {
        let config = ConnectionConfig::new("ch.local", "uk").with_token("jwt-xyz");
        let transport = HttpTransport::new(&config).unwrap();
        assert!(transport.target().ends_with("@<token>"));
        assert!(!transport.target().contains("jwt-xyz"));
    }
}
