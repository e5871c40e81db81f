//! Parquet export of the committed transfer history.
//!
//! Token amounts are `uint256`, which no Arrow integer type holds, so
//! `value` is written as a base-10 string.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use erc20_ledger::TransferEvent;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

/// Rows per record batch.
const BATCH_ROWS: usize = 8192;

/// One row per transfer, in `(block_number, log_index)` order.
static TRANSFER_SCHEMA: LazyLock<Arc<Schema>> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("block_number", DataType::UInt64, false),
        Field::new("block_hash", DataType::Utf8, false),
        Field::new("tx_hash", DataType::Utf8, false),
        Field::new("log_index", DataType::UInt64, false),
        Field::new("from", DataType::Utf8, false),
        Field::new("to", DataType::Utf8, false),
        Field::new("value", DataType::Utf8, false),
        Field::new("timestamp", DataType::UInt64, false),
    ]))
});

/// Convert transfers into a columnar [`RecordBatch`].
///
/// # Errors
///
/// Returns an error if the Arrow `RecordBatch` construction fails.
pub fn transfers_to_batch(transfers: &[TransferEvent]) -> Result<RecordBatch> {
    let column_u64 = |f: fn(&TransferEvent) -> u64| -> UInt64Array {
        transfers.iter().map(f).collect::<Vec<_>>().into()
    };
    let column_str = |f: fn(&TransferEvent) -> String| -> StringArray {
        transfers.iter().map(f).collect::<Vec<_>>().into()
    };

    let batch = RecordBatch::try_new(
        Arc::clone(&TRANSFER_SCHEMA),
        vec![
            Arc::new(column_u64(|e| e.block_number)),
            Arc::new(column_str(|e| format!("{:#x}", e.block_hash))),
            Arc::new(column_str(|e| format!("{:#x}", e.tx_hash))),
            Arc::new(column_u64(|e| e.log_index)),
            Arc::new(column_str(|e| e.from.to_checksum(None))),
            Arc::new(column_str(|e| e.to.to_checksum(None))),
            Arc::new(column_str(|e| e.value.to_string())),
            Arc::new(column_u64(|e| e.timestamp)),
        ],
    )?;
    Ok(batch)
}

/// Write transfers to a Parquet file using Zstd compression.
///
/// Uses atomic write (temp file, fsync, rename). Returns the number of rows.
///
/// # Errors
///
/// Returns an error on I/O failure or if the Parquet writer rejects the data.
pub fn write<'a>(
    path: &Path,
    transfers: impl IntoIterator<Item = &'a TransferEvent>,
) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let tmp = path.with_extension("parquet.tmp");
    let file =
        std::fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;

    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::ZSTD(
            parquet::basic::ZstdLevel::try_new(3).context("invalid zstd level")?,
        ))
        .build();

    let mut writer = ArrowWriter::try_new(file, Arc::clone(&TRANSFER_SCHEMA), Some(props))?;
    let mut rows = 0;
    let mut chunk = Vec::with_capacity(BATCH_ROWS);
    for event in transfers {
        chunk.push(event.clone());
        if chunk.len() == BATCH_ROWS {
            writer.write(&transfers_to_batch(&chunk)?)?;
            rows += chunk.len();
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        writer.write(&transfers_to_batch(&chunk)?)?;
        rows += chunk.len();
    }
    writer.finish()?;
    writer
        .inner()
        .sync_all()
        .with_context(|| format!("syncing {}", tmp.display()))?;
    drop(writer);

    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} → {}", tmp.display(), path.display()))?;

    tracing::info!(path = %path.display(), rows, "transfers exported");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, U256};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    use super::*;

    fn read(path: &Path) -> Vec<RecordBatch> {
        let file = std::fs::File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn event(block_number: u64, log_index: u64, value: U256) -> TransferEvent {
        TransferEvent {
            tx_hash: B256::with_last_byte(7),
            log_index,
            block_number,
            block_hash: B256::with_last_byte(9),
            from: Address::ZERO,
            to: Address::with_last_byte(0xb0),
            value,
            timestamp: block_number * 12,
        }
    }

    #[test]
    fn exports_full_precision_values() {
        let dir = std::env::temp_dir().join(format!("erc20-export-{}", std::process::id()));
        let path = dir.join("transfers.parquet");
        let transfers = vec![event(10, 0, U256::MAX), event(11, 3, U256::from(40))];

        let rows = write(&path, &transfers).unwrap();
        assert_eq!(rows, 2, "row count");
        assert!(!path.with_extension("parquet.tmp").exists(), "temp file renamed");

        let batches = read(&path);
        let batch = batches.first().unwrap();
        assert_eq!(batch.num_rows(), 2, "both rows read back");

        let values = batch
            .column_by_name("value")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(values.value(0), U256::MAX.to_string(), "no precision lost");
        assert_eq!(values.value(1), "40", "decimal string");

        let blocks = batch
            .column_by_name("block_number")
            .unwrap()
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        assert_eq!(blocks.values().to_vec(), vec![10, 11], "ledger order kept");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
