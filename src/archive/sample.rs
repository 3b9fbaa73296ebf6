//! Post-deletion sample verification.
//!
//! After a batch commits, a random subset of the deleted keys is probed:
//! the rows must be gone from the source and present in the uploaded
//! archive. A failed probe does not fail the batch; it points at an
//! ordering or concurrency bug and is escalated to the audit trail.

use anyhow::{bail, Error};
use rand::seq::SliceRandom;

use relic_api_types::Value;
use relic_datastore::{decompress, parse_records};
use relic_object_store::ObjectStore;
use relic_source::batch::TableRef;
use relic_source::row::PkArray;
use relic_source::SourcePool;

pub const DEFAULT_SAMPLE_RATE: f64 = 0.01;

/// `max(1, ceil(rate * n))` for non-empty batches.
pub fn sample_size(total: usize, rate: f64) -> usize {
    if total == 0 {
        return 0;
    }
    ((total as f64 * rate).ceil() as usize).max(1)
}

/// Pick a random subset of the deleted primary keys.
pub fn select_samples(pks: &[Value], rate: f64) -> Vec<Value> {
    let count = sample_size(pks.len(), rate);
    pks.choose_multiple(&mut rand::thread_rng(), count)
        .cloned()
        .collect()
}

/// Verify a sample: absent from the source, present in the archive.
pub async fn verify_samples(
    pool: &SourcePool,
    store: &ObjectStore,
    table: &TableRef,
    data_key: &str,
    samples: &[Value],
) -> Result<(), Error> {
    if samples.is_empty() {
        return Ok(());
    }

    // presence in the just-uploaded archive
    let compressed = store.get(data_key).await?;
    let jsonl = decompress(&compressed)?;
    let records = parse_records(&jsonl)?;
    let archived_pks: Vec<String> = records
        .iter()
        .filter_map(|record| record.get(table.primary_key.as_str()))
        .map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    for sample in samples {
        let wanted = sample.to_pk_string();
        if !archived_pks.iter().any(|pk| *pk == wanted) {
            bail!(
                "sampled key '{}' missing from archive '{}'",
                wanted,
                data_key
            );
        }
    }

    // absence from the source
    let pk_array = PkArray::try_from_values(samples)?;
    let client = pool.client().await?;
    let remaining = relic_source::batch::count_pks(&client, table, &pk_array).await?;
    if remaining != 0 {
        bail!(
            "{} sampled keys still present in {}.{} after deletion",
            remaining,
            table.schema,
            table.name
        );
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sample_size_is_at_least_one_percent_rounded_up() {
        assert_eq!(sample_size(0, DEFAULT_SAMPLE_RATE), 0);
        assert_eq!(sample_size(1, DEFAULT_SAMPLE_RATE), 1);
        assert_eq!(sample_size(100, DEFAULT_SAMPLE_RATE), 1);
        assert_eq!(sample_size(101, DEFAULT_SAMPLE_RATE), 2);
        assert_eq!(sample_size(1000, DEFAULT_SAMPLE_RATE), 10);
        assert_eq!(sample_size(50, 0.1), 5);
    }

    #[test]
    fn samples_come_from_the_batch() {
        let pks: Vec<Value> = (0..500).map(Value::Int).collect();
        let samples = select_samples(&pks, DEFAULT_SAMPLE_RATE);
        assert_eq!(samples.len(), 5);
        for sample in &samples {
            assert!(pks.contains(sample));
        }
        // no duplicates
        let mut seen: Vec<String> = samples.iter().map(|s| s.to_pk_string()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), samples.len());
    }
}
