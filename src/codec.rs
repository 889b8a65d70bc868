//! Delimited Codec - strict delimited-text reading and quoting-aware writing
//!
//! Reading is push based: `RecordParser` consumes bytes in whatever chunks the
//! source hands out and emits whole records, so the same state machine backs
//! the synchronous `RecordReader`, the async `AsyncRecordReader` and the
//! header peek used before a bulk insert. Quoting is strict (RFC 4180 style):
//! anything the parser cannot place unambiguously is a `MalformedRecord`
//! carrying the physical line number, never a silently merged field.
//!
//! Writing goes through the `csv` crate with minimal quoting.

use crate::config::Delimiter;
use crate::error::{BridgeError, Result};
use bytes::Bytes;
use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

pub type Row = Vec<String>;

/// Read buffer for sources (64 KiB).
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

const HEADER_CHUNK_SIZE: usize = 8 * 1024;

const BYTE_ORDER_MARK: char = '\u{feff}';

/// Drop a UTF-8 byte order mark from the first header name.
fn strip_byte_order_mark(mut header: Row) -> Row {
    if let Some(first) = header.first_mut() {
        if let Some(rest) = first.strip_prefix(BYTE_ORDER_MARK) {
            *first = rest.to_string();
        }
    }
    header
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    RecordStart,
    FieldStart,
    Unquoted,
    Quoted,
    QuoteInQuoted,
}

/// Push-based record parser.
#[derive(Debug)]
pub struct RecordParser {
    delimiter: u8,
    state: State,
    field: Vec<u8>,
    fields: Row,
    line: u64,
    record_line: u64,
    last_record_line: u64,
    skip_lf: bool,
}

impl RecordParser {
    pub fn new(delimiter: Delimiter) -> Self {
        Self {
            delimiter: delimiter.as_byte(),
            state: State::RecordStart,
            field: Vec::new(),
            fields: Vec::new(),
            line: 1,
            record_line: 1,
            last_record_line: 0,
            skip_lf: false,
        }
    }

    /// Line on which the most recently completed record started.
    pub fn record_line(&self) -> u64 {
        self.last_record_line
    }

    /// Consume bytes until one record completes.
    ///
    /// Returns how many bytes were consumed and the record, if one finished.
    /// Never consumes zero bytes of a non-empty input.
    pub fn feed_one(&mut self, input: &[u8]) -> Result<(usize, Option<Row>)> {
        for (i, &b) in input.iter().enumerate() {
            if self.skip_lf {
                self.skip_lf = false;
                if b == b'\n' {
                    continue;
                }
            }

            if self.state == State::RecordStart {
                if b == b'\n' || b == b'\r' {
                    // blank line
                    self.newline(b);
                    continue;
                }
                self.record_line = self.line;
                self.state = State::FieldStart;
            }

            match self.state {
                State::RecordStart | State::FieldStart => {
                    if b == self.delimiter {
                        self.end_field()?;
                    } else if b == b'\n' || b == b'\r' {
                        self.end_field()?;
                        return Ok((i + 1, Some(self.end_record(b))));
                    } else if b == b'"' {
                        self.state = State::Quoted;
                    } else {
                        self.field.push(b);
                        self.state = State::Unquoted;
                    }
                }
                State::Unquoted => {
                    if b == self.delimiter {
                        self.end_field()?;
                        self.state = State::FieldStart;
                    } else if b == b'\n' || b == b'\r' {
                        self.end_field()?;
                        return Ok((i + 1, Some(self.end_record(b))));
                    } else if b == b'"' {
                        return Err(BridgeError::malformed(
                            self.line,
                            "quote character inside an unquoted field",
                        ));
                    } else {
                        self.field.push(b);
                    }
                }
                State::Quoted => {
                    if b == b'"' {
                        self.state = State::QuoteInQuoted;
                    } else {
                        if b == b'\n' {
                            self.line += 1;
                        }
                        self.field.push(b);
                    }
                }
                State::QuoteInQuoted => {
                    if b == b'"' {
                        self.field.push(b'"');
                        self.state = State::Quoted;
                    } else if b == self.delimiter {
                        self.end_field()?;
                        self.state = State::FieldStart;
                    } else if b == b'\n' || b == b'\r' {
                        self.end_field()?;
                        return Ok((i + 1, Some(self.end_record(b))));
                    } else {
                        return Err(BridgeError::malformed(
                            self.line,
                            format!("unexpected character {:?} after closing quote", b as char),
                        ));
                    }
                }
            }
        }
        Ok((input.len(), None))
    }

    /// Feed a whole chunk, collecting every record it completes.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<Row>) -> Result<()> {
        let mut offset = 0;
        while offset < input.len() {
            let (consumed, record) = self.feed_one(&input[offset..])?;
            offset += consumed;
            if let Some(record) = record {
                out.push(record);
            }
        }
        Ok(())
    }

    /// Signal end of input; returns a trailing record without terminator.
    pub fn finish(&mut self) -> Result<Option<Row>> {
        match self.state {
            State::RecordStart => Ok(None),
            State::Quoted => Err(BridgeError::malformed(
                self.record_line,
                "unterminated quoted field",
            )),
            State::FieldStart | State::Unquoted | State::QuoteInQuoted => {
                self.end_field()?;
                self.state = State::RecordStart;
                self.last_record_line = self.record_line;
                Ok(Some(std::mem::take(&mut self.fields)))
            }
        }
    }

    fn end_field(&mut self) -> Result<()> {
        let bytes = std::mem::take(&mut self.field);
        let value = String::from_utf8(bytes)
            .map_err(|_| BridgeError::malformed(self.line, "field is not valid UTF-8"))?;
        self.fields.push(value);
        Ok(())
    }

    fn end_record(&mut self, terminator: u8) -> Row {
        self.newline(terminator);
        self.state = State::RecordStart;
        self.last_record_line = self.record_line;
        std::mem::take(&mut self.fields)
    }

    fn newline(&mut self, terminator: u8) {
        self.line += 1;
        if terminator == b'\r' {
            self.skip_lf = true;
        }
    }
}

/// Synchronous record reader over any `BufRead`.
pub struct RecordReader<R> {
    inner: R,
    parser: RecordParser,
    done: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(inner: R, delimiter: Delimiter) -> Self {
        Self {
            inner,
            parser: RecordParser::new(delimiter),
            done: false,
        }
    }

    pub fn read_record(&mut self) -> Result<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                self.done = true;
                return self.parser.finish();
            }
            let (consumed, record) = self.parser.feed_one(buf)?;
            self.inner.consume(consumed);
            if record.is_some() {
                return Ok(record);
            }
        }
    }

    /// Line on which the last returned record started.
    pub fn line(&self) -> u64 {
        self.parser.record_line()
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

/// Asynchronous record reader; buffers at most one read chunk.
pub struct AsyncRecordReader<R> {
    inner: BufReader<R>,
    parser: RecordParser,
    done: bool,
}

impl<R: AsyncRead + Unpin> AsyncRecordReader<R> {
    pub fn new(inner: R, delimiter: Delimiter) -> Self {
        Self {
            inner: BufReader::with_capacity(READ_BUFFER_SIZE, inner),
            parser: RecordParser::new(delimiter),
            done: false,
        }
    }

    pub async fn read_record(&mut self) -> Result<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let buf = self.inner.fill_buf().await?;
            if buf.is_empty() {
                self.done = true;
                return self.parser.finish();
            }
            let (consumed, record) = self.parser.feed_one(buf)?;
            self.inner.consume(consumed);
            if record.is_some() {
                return Ok(record);
            }
        }
    }

    pub fn line(&self) -> u64 {
        self.parser.record_line()
    }
}

/// Parse one record from `text`. A trailing terminator is allowed; more than
/// one record is not.
pub fn parse_row(text: &str, delimiter: Delimiter) -> Result<Row> {
    let mut reader = RecordReader::new(text.as_bytes(), delimiter);
    let row = reader.read_record()?.unwrap_or_default();
    if reader.read_record()?.is_some() {
        return Err(BridgeError::malformed(reader.line(), "expected a single record"));
    }
    Ok(row)
}

/// Render one record, terminator included.
pub fn write_row<I, T>(fields: I, delimiter: Delimiter) -> Result<String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = RowWriter::new(delimiter);
    writer.write_row(fields)?;
    let bytes = writer.take_bytes()?;
    String::from_utf8(bytes.to_vec()).map_err(|e| BridgeError::Transfer(e.to_string()))
}

/// Read the header record from a synchronous source.
pub fn read_header<R: BufRead>(source: R, delimiter: Delimiter) -> Result<Row> {
    RecordReader::new(source, delimiter)
        .read_record()?
        .map(strip_byte_order_mark)
        .ok_or_else(|| BridgeError::Schema("source is empty; expected a header row".to_string()))
}

/// Read just enough of `source` to parse its header record.
///
/// Returns the header and every byte read so far, so the caller can replay
/// them ahead of the unread remainder. A leading byte order mark is kept in
/// the replayed bytes but not in the returned header.
pub async fn peek_header<R>(source: &mut R, delimiter: Delimiter) -> Result<(Row, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut parser = RecordParser::new(delimiter);
    let mut prefix = Vec::new();
    let mut chunk = vec![0u8; HEADER_CHUNK_SIZE];
    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            return match parser.finish()? {
                Some(header) => Ok((strip_byte_order_mark(header), prefix)),
                None => Err(BridgeError::Schema(
                    "source is empty; expected a header row".to_string(),
                )),
            };
        }
        prefix.extend_from_slice(&chunk[..n]);
        let mut offset = prefix.len() - n;
        while offset < prefix.len() {
            let (consumed, record) = parser.feed_one(&prefix[offset..])?;
            offset += consumed;
            if let Some(header) = record {
                return Ok((strip_byte_order_mark(header), prefix));
            }
        }
    }
}

/// Writes rows into an in-memory buffer drained by the caller in chunks.
pub struct RowWriter {
    delimiter: Delimiter,
    writer: csv::Writer<Vec<u8>>,
}

fn buffer_writer(delimiter: Delimiter) -> csv::Writer<Vec<u8>> {
    WriterBuilder::new()
        .delimiter(delimiter.as_byte())
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new())
}

impl RowWriter {
    pub fn new(delimiter: Delimiter) -> Self {
        Self {
            delimiter,
            writer: buffer_writer(delimiter),
        }
    }

    pub fn write_row<I, T>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer
            .write_record(fields)
            .map_err(|e| BridgeError::Transfer(format!("failed to encode row: {}", e)))
    }

    /// Bytes already flushed out of the csv writer's own buffer.
    pub fn pending_len(&self) -> usize {
        self.writer.get_ref().len()
    }

    /// Drain everything written so far; the writer starts over empty.
    pub fn take_bytes(&mut self) -> Result<Bytes> {
        let full = std::mem::replace(&mut self.writer, buffer_writer(self.delimiter));
        let buffer = full
            .into_inner()
            .map_err(|e| BridgeError::Transfer(format!("failed to flush rows: {}", e.error())))?;
        Ok(Bytes::from(buffer))
    }
}

/// Counts records in a delimited byte stream without splitting fields.
#[derive(Debug, Default)]
pub struct RecordCounter {
    in_quotes: bool,
    pending: bool,
    records: u64,
}

impl RecordCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match b {
                // Doubled quotes toggle twice, so the state stays correct.
                b'"' => {
                    self.in_quotes = !self.in_quotes;
                    self.pending = true;
                }
                b'\n' if !self.in_quotes => {
                    if self.pending {
                        self.records += 1;
                        self.pending = false;
                    }
                }
                b'\r' if !self.in_quotes => {}
                _ => self.pending = true,
            }
        }
    }

    /// Records seen so far, counting an unterminated trailing record.
    pub fn count(&self) -> u64 {
        self.records + u64::from(self.pending)
    }
}

/// Header plus a bounded number of rows, for UI display.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

/// Preview a local delimited source: its header and at most `limit` rows.
pub async fn preview_source<R>(source: R, delimiter: Delimiter, limit: usize) -> Result<Preview>
where
    R: AsyncRead + Unpin,
{
    let mut reader = AsyncRecordReader::new(source, delimiter);
    let headers = reader
        .read_record()
        .await?
        .map(strip_byte_order_mark)
        .ok_or_else(|| BridgeError::Schema("No rows found".to_string()))?;
    let mut rows = Vec::new();
    while rows.len() < limit {
        match reader.read_record().await? {
            Some(row) => rows.push(row),
            None => break,
        }
    }
    Ok(Preview { headers, rows })
}
