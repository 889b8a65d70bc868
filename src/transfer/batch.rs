//! Batched SQL fallback for stores without a bulk-insert channel
//!
//! Rows are grouped into `INSERT ... VALUES` statements of at most
//! `batch_size` rows. Batches are independent statements: a failure part way
//! leaves earlier batches in the table.

use super::check_width;
use crate::codec::AsyncRecordReader;
use crate::error::Result;
use crate::query::build_insert_values;
use crate::store::StoreTransport;
use tokio::io::AsyncRead;
use tracing::debug;

/// Reference batch size.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub rows: u64,
    pub batches: usize,
}

/// Insert every remaining row of `reader`, which must be past the header.
pub async fn insert_batched<T, R>(
    transport: &T,
    table: &str,
    columns: &[String],
    source_width: usize,
    indices: &[usize],
    reader: &mut AsyncRecordReader<R>,
    batch_size: usize,
) -> Result<BatchOutcome>
where
    T: StoreTransport + ?Sized,
    R: AsyncRead + Unpin,
{
    let batch_size = batch_size.max(1);
    let mut outcome = BatchOutcome::default();
    let mut pending: Vec<Vec<String>> = Vec::with_capacity(batch_size.min(DEFAULT_BATCH_SIZE));

    while let Some(row) = reader.read_record().await? {
        check_width(&row, source_width, reader.line())?;
        let mut row = row;
        pending.push(indices.iter().map(|&i| std::mem::take(&mut row[i])).collect());

        if pending.len() >= batch_size {
            flush(transport, table, columns, &mut pending, &mut outcome).await?;
        }
    }
    if !pending.is_empty() {
        flush(transport, table, columns, &mut pending, &mut outcome).await?;
    }
    Ok(outcome)
}

async fn flush<T>(
    transport: &T,
    table: &str,
    columns: &[String],
    pending: &mut Vec<Vec<String>>,
    outcome: &mut BatchOutcome,
) -> Result<()>
where
    T: StoreTransport + ?Sized,
{
    let sql = build_insert_values(table, columns, pending.as_slice())?;
    transport.execute(&sql).await?;
    outcome.rows += pending.len() as u64;
    outcome.batches += 1;
    debug!(
        batch = outcome.batches,
        rows = pending.len(),
        total = outcome.rows,
        "Flushed insert batch"
    );
    pending.clear();
    Ok(())
}
