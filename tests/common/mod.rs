//! In-memory stand-in for a ClickHouse server, speaking just enough of the
//! statement dialect the engine emits.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tablebridge::codec::{write_row, RecordReader};
use tablebridge::store::{ByteStream, InsertRequest, InsertSummary, Setting};
use tablebridge::{BridgeError, CatalogClient, Delimiter, Result, StoreTransport, TypeCatalogCache};
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct MemTable {
    pub columns: Vec<(String, String)>,
    pub rows: Vec<Vec<String>>,
}

pub struct MemoryStore {
    target: String,
    tables: Mutex<BTreeMap<String, MemTable>>,
    executed: Mutex<Vec<String>>,
    inserts: Mutex<Vec<InsertRequest>>,
    bulk_insert: bool,
    report_written_rows: bool,
    reject_inserts: bool,
    trailing_exception: Option<String>,
}

fn unquote(identifier: &str) -> String {
    identifier.replace("``", "`")
}

fn store_error(message: impl Into<String>) -> BridgeError {
    BridgeError::Query(message.into())
}

fn unknown_table(name: &str) -> BridgeError {
    store_error(format!("Table {} does not exist. (UNKNOWN_TABLE)", name))
}

/// Values of a `VALUES ('a', 'b'), ('c', 'd')` list.
fn parse_values(text: &str) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' => row.clear(),
            ')' => rows.push(std::mem::take(&mut row)),
            '\'' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => value.extend(chars.next()),
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            value.push('\'');
                        }
                        Some('\'') => break,
                        Some(other) => value.push(other),
                        None => return Err(store_error("unterminated literal")),
                    }
                }
                row.push(value);
            }
            ',' | ' ' => {}
            other => return Err(store_error(format!("unexpected {:?} in VALUES", other))),
        }
    }
    Ok(rows)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            target: format!("memory://{}", Uuid::new_v4()),
            tables: Mutex::new(BTreeMap::new()),
            executed: Mutex::new(Vec::new()),
            inserts: Mutex::new(Vec::new()),
            bulk_insert: true,
            report_written_rows: true,
            reject_inserts: false,
            trailing_exception: None,
        }
    }

    pub fn without_bulk_insert(mut self) -> Self {
        self.bulk_insert = false;
        self
    }

    pub fn without_written_rows(mut self) -> Self {
        self.report_written_rows = false;
        self
    }

    pub fn rejecting_inserts(mut self) -> Self {
        self.reject_inserts = true;
        self
    }

    /// Append `message` to every result body after the rows, the way the
    /// server reports a query that fails once streaming has begun.
    pub fn failing_mid_stream(mut self, message: &str) -> Self {
        self.trailing_exception = Some(message.to_string());
        self
    }

    pub fn with_table(self, name: &str, columns: &[(&str, &str)], rows: &[&[&str]]) -> Self {
        let table = MemTable {
            columns: columns.iter().map(|(n, t)| (n.to_string(), t.to_string())).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.to_string()).collect())
                .collect(),
        };
        self.tables.lock().unwrap().insert(name.to_string(), table);
        self
    }

    pub fn table(&self, name: &str) -> Option<MemTable> {
        self.tables.lock().unwrap().get(name).cloned()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn inserts(&self) -> Vec<InsertRequest> {
        self.inserts.lock().unwrap().clone()
    }

    fn create_table(&self, sql: &str) -> Result<()> {
        let re = Regex::new(concat!(
            r"^CREATE TABLE IF NOT EXISTS `((?:[^`]|``)+)` \((.*)\) ",
            r"ENGINE = MergeTree\(\) ORDER BY tuple\(\)$"
        ))
        .unwrap();
        let column_re = Regex::new(r"^`((?:[^`]|``)+)` (.+)$").unwrap();
        let caps = re.captures(sql).ok_or_else(|| store_error(format!("bad DDL: {}", sql)))?;
        let name = unquote(&caps[1]);
        let columns = caps[2]
            .split(", ")
            .map(|def| {
                let c = column_re
                    .captures(def)
                    .ok_or_else(|| store_error(format!("bad column definition: {}", def)))?;
                Ok((unquote(&c[1]), c[2].to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        self.tables
            .lock()
            .unwrap()
            .entry(name)
            .or_insert(MemTable { columns, rows: Vec::new() });
        Ok(())
    }

    fn insert_values(&self, sql: &str) -> Result<()> {
        let re = Regex::new(r"^INSERT INTO `((?:[^`]|``)+)` \((.*?)\) VALUES (.*)$").unwrap();
        let caps = re.captures(sql).ok_or_else(|| store_error(format!("bad INSERT: {}", sql)))?;
        let name = unquote(&caps[1]);
        let columns: Vec<String> = caps[2]
            .split(", ")
            .map(|c| unquote(c.trim_matches('`')))
            .collect();
        let values = parse_values(&caps[3])?;

        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(&name)
            .ok_or_else(|| unknown_table(&name))?;
        for row in values {
            let mut full = vec![String::new(); table.columns.len()];
            for (column, value) in columns.iter().zip(row) {
                let idx = table
                    .columns
                    .iter()
                    .position(|(n, _)| n == column)
                    .ok_or_else(|| store_error(format!("No such column {}", column)))?;
                full[idx] = value;
            }
            table.rows.push(full);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransport for MemoryStore {
    fn target(&self) -> &str {
        &self.target
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.executed.lock().unwrap().push(sql.to_string());
        if sql.starts_with("CREATE TABLE") {
            self.create_table(sql)
        } else if sql.starts_with("INSERT INTO") {
            self.insert_values(sql)
        } else {
            Err(store_error(format!("unsupported statement: {}", sql)))
        }
    }

    async fn query_text(&self, sql: &str) -> Result<String> {
        let tables = self.tables.lock().unwrap();
        if sql == "SHOW TABLES FORMAT JSONEachRow" {
            return Ok(tables
                .keys()
                .map(|name| format!("{}\n", serde_json::json!({ "name": name })))
                .collect());
        }
        if sql.contains("FROM system.data_type_families") {
            return Ok(["String", "Int64", "Float64", "Date", "DateTime", "Bool"]
                .iter()
                .map(|name| format!("{}\n", serde_json::json!({ "name": name })))
                .collect());
        }
        if sql.contains("FROM system.columns") {
            let re = Regex::new(r"table = '((?:[^'\\]|''|\\.)*)'").unwrap();
            let caps = re.captures(sql).ok_or_else(|| store_error("missing table filter"))?;
            let name = caps[1].replace("''", "'");
            return Ok(tables
                .get(&name)
                .map(|t| {
                    t.columns
                        .iter()
                        .map(|(n, ty)| {
                            format!("{}\n", serde_json::json!({ "name": n, "type": ty }))
                        })
                        .collect()
                })
                .unwrap_or_default());
        }
        let exists = Regex::new(r"^EXISTS TABLE `((?:[^`]|``)+)`$").unwrap();
        if let Some(caps) = exists.captures(sql) {
            let found = tables.contains_key(&unquote(&caps[1]));
            return Ok(format!("{}\n", u8::from(found)));
        }
        let count = Regex::new(r"^SELECT count\(\) FROM `((?:[^`]|``)+)`$").unwrap();
        if let Some(caps) = count.captures(sql) {
            let name = unquote(&caps[1]);
            let table = tables
                .get(&name)
                .ok_or_else(|| unknown_table(&name))?;
            return Ok(format!("{}\n", table.rows.len()));
        }
        Err(store_error(format!("unsupported query: {}", sql)))
    }

    async fn query_stream(&self, sql: &str, settings: &[Setting]) -> Result<ByteStream> {
        let re = Regex::new(
            r"^SELECT (.+?) FROM `((?:[^`]|``)+)`(?: LIMIT (\d+))? FORMAT CSVWithNames$",
        )
        .unwrap();
        let caps = re
            .captures(sql)
            .ok_or_else(|| store_error(format!("unsupported query: {}", sql)))?;
        let delimiter = settings
            .iter()
            .find(|(k, _)| k == "format_csv_delimiter")
            .map(|(_, v)| Delimiter::parse(v))
            .transpose()?
            .unwrap_or_default();
        let wanted: Vec<String> = caps[1]
            .split(", ")
            .map(|c| unquote(c.trim_matches('`')))
            .collect();
        let name = unquote(&caps[2]);
        let limit = caps.get(3).and_then(|m| m.as_str().parse::<usize>().ok());

        let tables = self.tables.lock().unwrap();
        let table = tables
            .get(&name)
            .ok_or_else(|| unknown_table(&name))?;
        let indices = wanted
            .iter()
            .map(|c| {
                table
                    .columns
                    .iter()
                    .position(|(n, _)| n == c)
                    .ok_or_else(|| store_error(format!("Missing columns: '{}'", c)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut chunks = vec![Ok(Bytes::from(write_row(&wanted, delimiter)?))];
        for row in table.rows.iter().take(limit.unwrap_or(usize::MAX)) {
            let line = write_row(indices.iter().map(|&i| row[i].as_str()), delimiter)?;
            chunks.push(Ok(Bytes::from(line)));
        }
        if let Some(message) = &self.trailing_exception {
            chunks.push(Ok(Bytes::from(message.clone())));
        }
        Ok(stream::iter(chunks).boxed())
    }

    async fn insert_stream(
        &self,
        request: InsertRequest,
        mut body: ByteStream,
    ) -> Result<InsertSummary> {
        self.inserts.lock().unwrap().push(request.clone());
        if self.reject_inserts {
            drop(body);
            return Err(BridgeError::Type(
                "Cannot parse input: expected a number. (CANNOT_PARSE_INPUT)".to_string(),
            ));
        }

        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }

        // The server skips a leading byte order mark.
        let data = data.strip_prefix("\u{feff}".as_bytes()).unwrap_or(&data);
        let delimiter = Delimiter::parse(request.get("format_csv_delimiter").unwrap_or(","))?;
        let mut reader = RecordReader::new(data, delimiter);
        let header = reader.read_record()?.unwrap_or_default();

        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(&request.table)
            .ok_or_else(|| unknown_table(&request.table))?;
        let skip_unknown = request.get("input_format_skip_unknown_fields") == Some("1");
        let mapping = header
            .iter()
            .map(|h| match table.columns.iter().position(|(n, _)| n == h) {
                Some(idx) => Ok(Some(idx)),
                None if skip_unknown => Ok(None),
                None => Err(store_error(format!("Unknown field found: {}", h))),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut written = 0u64;
        for record in reader {
            let record = record?;
            let mut full = vec![String::new(); table.columns.len()];
            for (value, target) in record.into_iter().zip(&mapping) {
                if let Some(idx) = target {
                    full[*idx] = value;
                }
            }
            table.rows.push(full);
            written += 1;
        }

        Ok(InsertSummary {
            written_rows: self.report_written_rows.then_some(written),
        })
    }

    fn supports_bulk_insert(&self) -> bool {
        self.bulk_insert
    }
}

/// A client over `store` with its own type cache.
pub async fn client(store: MemoryStore) -> CatalogClient<MemoryStore> {
    CatalogClient::with_cache(store, TypeCatalogCache::new()).await.unwrap()
}
