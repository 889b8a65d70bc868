//! Store transport - the capability the engine needs from the remote store
//!
//! The engine never speaks a wire protocol directly. It submits SQL, reads
//! results as delimited byte streams, and hands delimited byte streams to a
//! bulk-insert channel. `HttpTransport` provides this over the ClickHouse
//! HTTP interface; tests provide in-memory doubles.

pub mod http;

pub use http::HttpTransport;

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};

/// Streamed request or response body.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Server-side setting sent alongside a statement.
pub type Setting = (String, String);

/// Result format with a header row, used for both directions.
pub const DELIMITED_WITH_HEADER: &str = "CSVWithNames";

/// Bytes held back at the end of a result body while watching for a late
/// exception.
const EXCEPTION_WINDOW: usize = 16 * 1024;

/// Offset of a `Code: NNN. DB::Exception:` block in `tail`.
fn find_exception(tail: &[u8]) -> Option<usize> {
    const PREFIX: &[u8] = b"Code: ";
    const MARKER: &[u8] = b". DB::Exception:";
    (0..tail.len()).find(|&start| {
        let Some(after) = tail[start..].strip_prefix(PREFIX) else {
            return false;
        };
        let digits = after.iter().take_while(|b| b.is_ascii_digit()).count();
        digits > 0 && after[digits..].starts_with(MARKER)
    })
}

/// Turn an exception the store appended to an already-started result body
/// into a stream error.
///
/// Once a streamed result has begun the status line is already sent, so a
/// query that fails later can only report it in-band. The last
/// `EXCEPTION_WINDOW` bytes are held until the body ends and checked then.
pub fn fail_on_trailing_exception(body: ByteStream) -> ByteStream {
    stream::unfold(Some((body, BytesMut::new())), |state| async move {
        let (mut body, mut held) = state?;
        loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    held.extend_from_slice(&chunk);
                    if held.len() > EXCEPTION_WINDOW {
                        let ready = held.split_to(held.len() - EXCEPTION_WINDOW).freeze();
                        return Some((Ok(ready), Some((body, held))));
                    }
                }
                Some(Err(e)) => return Some((Err(e), None)),
                None => {
                    if let Some(at) = find_exception(&held) {
                        let message = String::from_utf8_lossy(&held[at..]).trim().to_string();
                        let error = BridgeError::Transfer(format!(
                            "store failed mid-stream: {}",
                            message
                        ));
                        let error = std::io::Error::new(std::io::ErrorKind::Other, error);
                        return Some((Err(error), None));
                    }
                    if held.is_empty() {
                        return None;
                    }
                    return Some((Ok(held.freeze()), None));
                }
            }
        }
    })
    .boxed()
}

/// Parameters for the bulk-insert channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InsertRequest {
    /// Unquoted table name.
    pub table: String,
    pub format: String,
    pub settings: Vec<Setting>,
}

impl InsertRequest {
    pub fn delimited(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            format: DELIMITED_WITH_HEADER.to_string(),
            settings: Vec::new(),
        }
    }

    pub fn setting(mut self, name: &str, value: impl Into<String>) -> Self {
        self.settings.push((name.to_string(), value.into()));
        self
    }

    /// Look up a setting by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertSummary {
    /// Rows the store reports as written, when it reports at all.
    pub written_rows: Option<u64>,
}

#[async_trait]
pub trait StoreTransport: Send + Sync {
    /// Stable identity of the connection target (endpoint, database, user).
    fn target(&self) -> &str;

    /// Liveness probe that also exercises authentication.
    async fn ping(&self) -> Result<()>;

    /// Run a statement that returns no rows.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Run a statement and buffer its (small) result as text.
    async fn query_text(&self, sql: &str) -> Result<String>;

    /// Run a statement and stream its result body.
    async fn query_stream(&self, sql: &str, settings: &[Setting]) -> Result<ByteStream>;

    /// Send a delimited stream to the bulk-insert channel.
    async fn insert_stream(
        &self,
        request: InsertRequest,
        body: ByteStream,
    ) -> Result<InsertSummary>;

    /// Whether `insert_stream` is available at all.
    fn supports_bulk_insert(&self) -> bool {
        true
    }
}
