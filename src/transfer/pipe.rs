//! Re-projecting pipe
//!
//! A producer task parses the source, keeps the selected fields of each row
//! and writes comma-delimited chunks into a bounded channel. The receiving
//! end is the body of the bulk insert.

use super::{check_width, CHUNK_SIZE, PIPE_CAPACITY};
use crate::codec::{AsyncRecordReader, RowWriter};
use crate::config::Delimiter;
use crate::error::{BridgeError, Result};
use crate::store::ByteStream;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::io;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

/// Field layout the producer emits.
pub(crate) struct Projection {
    /// Source header width; every data row must match it.
    pub source_width: usize,
    /// Source field index for each output column, in output order.
    pub indices: Vec<usize>,
    /// Header written as the first output record.
    pub header: Vec<String>,
}

/// Delimiter of everything the producer writes.
pub(crate) const OUTPUT_DELIMITER: Delimiter = Delimiter::COMMA;

/// Start the producer. `reader` must already be past the header record.
///
/// The task resolves to the number of data rows produced. A failure is also
/// sent down the channel so the body stream errors instead of ending early.
/// If the receiver is dropped the producer stops and reports what it sent.
pub(crate) fn spawn_producer<R>(
    reader: AsyncRecordReader<R>,
    projection: Projection,
) -> (ByteStream, JoinHandle<Result<u64>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(PIPE_CAPACITY);

    let handle = tokio::spawn(
        async move {
            let result = produce(reader, &projection, &tx).await;
            if let Err(err) = &result {
                let relayed = io::Error::new(
                    io::ErrorKind::Other,
                    BridgeError::Transfer(format!("source stream failed: {}", err)),
                );
                // The receiver may already be gone; nothing left to tell.
                let _ = tx.send(Err(relayed)).await;
            }
            result
        }
        .in_current_span(),
    );

    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    (body, handle)
}

async fn produce<R>(
    mut reader: AsyncRecordReader<R>,
    projection: &Projection,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut writer = RowWriter::new(OUTPUT_DELIMITER);
    writer.write_row(&projection.header)?;

    let mut rows = 0u64;
    while let Some(row) = reader.read_record().await? {
        check_width(&row, projection.source_width, reader.line())?;
        writer.write_row(projection.indices.iter().map(|&i| row[i].as_str()))?;
        rows += 1;

        if writer.pending_len() >= CHUNK_SIZE && tx.send(Ok(writer.take_bytes()?)).await.is_err() {
            debug!(rows, "Bulk insert stopped reading; producer exiting");
            return Ok(rows);
        }
    }

    let tail = writer.take_bytes()?;
    if !tail.is_empty() && tx.send(Ok(tail)).await.is_err() {
        debug!(rows, "Bulk insert stopped reading before the last chunk");
    }
    debug!(rows, "Producer finished");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn projection(width: usize, indices: Vec<usize>, header: &[&str]) -> Projection {
        Projection {
            source_width: width,
            indices,
            header: header.iter().map(|h| h.to_string()).collect(),
        }
    }

    async fn reader_past_header(text: &'static str) -> AsyncRecordReader<&'static [u8]> {
        let mut reader = AsyncRecordReader::new(text.as_bytes(), Delimiter::parse(";").unwrap());
        reader.read_record().await.unwrap();
        reader
    }

    #[tokio::test]
    async fn test_producer_reprojects_rows() {
        let reader = reader_past_header("id;name;city\n1;Alice;Paris\n2;\"Bob, Jr\";Rome\n").await;
        let (body, handle) = spawn_producer(reader, projection(3, vec![2, 0], &["city", "id"]));

        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        let text = String::from_utf8(chunks.concat()).unwrap();
        assert_eq!(text, "city,id\nParis,1\nRome,2\n");
        assert_eq!(handle.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_producer_error_reaches_consumer() {
        let reader = reader_past_header("a;b\n1;2\n3\n").await;
        let (body, handle) = spawn_producer(reader, projection(2, vec![0, 1], &["a", "b"]));

        let collected: std::result::Result<Vec<Bytes>, io::Error> = body.try_collect().await;
        assert!(collected.is_err());
        match handle.await.unwrap() {
            Err(BridgeError::MalformedRecord { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_producer_stops_when_consumer_drops() {
        let mut text = String::from("v\n");
        for i in 0..50_000 {
            text.push_str(&format!("value-{}\n", i));
        }
        let text: &'static str = Box::leak(text.into_boxed_str());
        let reader = reader_past_header(text).await;
        let (body, handle) = spawn_producer(reader, projection(1, vec![0], &["v"]));

        drop(body);
        let rows = handle.await.unwrap().unwrap();
        assert!(rows < 50_000);
    }
}
