//! Catalog Client - table, column and type discovery against the store
//!
//! Each job builds its own client. The only state shared between clients is
//! the process-wide type catalog cache, keyed by connection target.

use crate::config::ConnectionConfig;
use crate::error::{BridgeError, Result};
use crate::query::{build_create_table, quote_identifier, quote_literal, DEFAULT_COLUMN_TYPE};
use crate::store::http::indicates_auth_failure;
use crate::store::{HttpTransport, StoreTransport};
use dashmap::DashMap;
use itertools::Itertools;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// Type names the store can create columns with.
///
/// Ordered, deduplicated, with the generic textual type first so pickers
/// default to it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TypeCatalog {
    names: Vec<String>,
}

impl TypeCatalog {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names = names
            .into_iter()
            .map(Into::into)
            .filter(|n: &String| !n.trim().is_empty())
            .sorted()
            .dedup()
            .collect::<Vec<_>>();
        if let Some(pos) = names.iter().position(|n| n == DEFAULT_COLUMN_TYPE) {
            let textual = names.remove(pos);
            names.insert(0, textual);
        }
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

lazy_static! {
    static ref GLOBAL_TYPE_CACHE: TypeCatalogCache = TypeCatalogCache::new();
}

/// Type catalogs per connection target.
///
/// Read-mostly. No lock is held across a fetch, so two callers racing on a
/// cold entry may both fetch; the later insert wins.
#[derive(Clone, Debug, Default)]
pub struct TypeCatalogCache {
    entries: Arc<DashMap<String, Arc<TypeCatalog>>>,
}

impl TypeCatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache shared by every client.
    pub fn global() -> Self {
        GLOBAL_TYPE_CACHE.clone()
    }

    pub fn get(&self, target: &str) -> Option<Arc<TypeCatalog>> {
        self.entries.get(target).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, target: &str, catalog: TypeCatalog) -> Arc<TypeCatalog> {
        let catalog = Arc::new(catalog);
        self.entries.insert(target.to_string(), Arc::clone(&catalog));
        catalog
    }

    pub fn invalidate(&self, target: &str) -> bool {
        self.entries.remove(target).is_some()
    }
}

#[derive(Deserialize)]
struct NameRow {
    name: String,
}

/// Parse a `FORMAT JSONEachRow` body.
fn parse_json_rows<T: DeserializeOwned>(body: &str) -> Result<Vec<T>> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(BridgeError::from))
        .collect()
}

/// Errors from the liveness probe, in the shape `connect` reports them.
///
/// The probe is `SELECT 1`; if the store answered at all but refused it,
/// the credentials are what it refused.
fn normalize_probe_error(err: BridgeError) -> BridgeError {
    match err {
        BridgeError::Connection(message) | BridgeError::Transfer(message)
            if indicates_auth_failure(&message) =>
        {
            BridgeError::Authentication(message)
        }
        BridgeError::Query(message) | BridgeError::Type(message) => {
            BridgeError::Authentication(message)
        }
        BridgeError::Transfer(message) => BridgeError::Connection(message),
        other => other,
    }
}

pub struct CatalogClient<T: StoreTransport = HttpTransport> {
    transport: T,
    types: TypeCatalogCache,
}

impl CatalogClient<HttpTransport> {
    /// Build the HTTP transport from `config` and probe it.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        info!(
            store = %transport.target(),
            credential = config.credential().kind(),
            "Connecting to store"
        );
        Self::from_transport(transport).await
    }
}

impl<T: StoreTransport> CatalogClient<T> {
    /// Wrap an existing transport, probing it first.
    pub async fn from_transport(transport: T) -> Result<Self> {
        Self::with_cache(transport, TypeCatalogCache::global()).await
    }

    pub async fn with_cache(transport: T, types: TypeCatalogCache) -> Result<Self> {
        transport.ping().await.map_err(normalize_probe_error)?;
        debug!(store = %transport.target(), "Liveness probe succeeded");
        Ok(Self { transport, types })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn target(&self) -> &str {
        self.transport.target()
    }

    /// Re-probe the store and drop its cached type catalog.
    pub async fn reconnect(&self) -> Result<()> {
        self.invalidate_types();
        self.transport.ping().await.map_err(normalize_probe_error)
    }

    pub fn invalidate_types(&self) {
        if self.types.invalidate(self.target()) {
            debug!(store = %self.target(), "Type catalog invalidated");
        }
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let body = self.transport.query_text("SHOW TABLES FORMAT JSONEachRow").await?;
        let tables = parse_json_rows::<NameRow>(&body)?
            .into_iter()
            .map(|row| row.name)
            .unique()
            .collect::<Vec<_>>();
        debug!(store = %self.target(), count = tables.len(), "Listed tables");
        Ok(tables)
    }

    #[instrument(level = "debug", skip(self), fields(store = %self.target()))]
    pub async fn list_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let sql = format!(
            "SELECT name, type FROM system.columns \
             WHERE database = currentDatabase() AND table = {} \
             ORDER BY position FORMAT JSONEachRow",
            quote_literal(table)
        );
        let body = self.transport.query_text(&sql).await?;
        parse_json_rows(&body)
    }

    /// Creatable column types, fetched once per connection target.
    pub async fn list_creatable_types(&self) -> Result<Arc<TypeCatalog>> {
        if let Some(catalog) = self.types.get(self.target()) {
            return Ok(catalog);
        }

        let body = self
            .transport
            .query_text(
                "SELECT name FROM system.data_type_families \
                 WHERE alias_to = '' ORDER BY name FORMAT JSONEachRow",
            )
            .await?;
        let names = parse_json_rows::<NameRow>(&body)?.into_iter().map(|r| r.name);
        let catalog = TypeCatalog::from_names(names);
        if catalog.is_empty() {
            warn!(store = %self.target(), "Store reported no creatable types");
        }
        Ok(self.types.insert(self.target(), catalog))
    }

    #[instrument(level = "debug", skip(self), fields(store = %self.target()))]
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let body = self
            .transport
            .query_text(&format!("EXISTS TABLE {}", quote_identifier(table)))
            .await?;
        Ok(body.trim() == "1")
    }

    #[instrument(level = "debug", skip(self), fields(store = %self.target()))]
    pub async fn row_count(&self, table: &str) -> Result<u64> {
        let body = self
            .transport
            .query_text(&format!("SELECT count() FROM {}", quote_identifier(table)))
            .await?;
        body.trim().parse::<u64>().map_err(|_| {
            BridgeError::Query(format!(
                "unexpected row count for {}: {:?}",
                table,
                body.trim()
            ))
        })
    }

    /// `CREATE TABLE IF NOT EXISTS`; calling it twice is harmless.
    pub async fn create_table<N, C>(&self, name: &str, columns: &[(N, C)]) -> Result<()>
    where
        N: AsRef<str>,
        C: AsRef<str>,
    {
        let sql = build_create_table(name, columns)?;
        self.transport.execute(&sql).await?;
        info!(store = %self.target(), table = name, columns = columns.len(), "Created table");
        Ok(())
    }
}
