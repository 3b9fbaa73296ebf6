//! JSONL serialization, gzip compression and checksumming.

use std::io::{Read, Write};

use anyhow::{bail, format_err, Error};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value as Json;

use relic_api_types::{
    rfc3339, Checksums, Row, FIELD_ARCHIVED_AT, FIELD_BATCH_ID, FIELD_SOURCE_DATABASE,
    FIELD_SOURCE_TABLE,
};

/// A parsed JSONL line: column name to JSON value.
pub type JsonRecord = serde_json::Map<String, Json>;

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(data))
}

/// Provenance stamped onto every serialized row.
#[derive(Clone, Debug)]
pub struct RowContext<'a> {
    pub batch_id: &'a str,
    pub database: &'a str,
    pub table: &'a str,
    pub archived_at: DateTime<Utc>,
}

/// Serialize one row to a self-contained JSON line (without the trailing
/// newline), reserved fields appended.
pub fn serialize_row(row: &Row, context: &RowContext) -> Result<String, Error> {
    let mut object = JsonRecord::new();
    for (name, value) in row {
        if relic_api_types::RESERVED_FIELDS.contains(&name.as_str()) {
            bail!("source column '{}' collides with a reserved field", name);
        }
        object.insert(name.clone(), value.to_json());
    }
    object.insert(FIELD_BATCH_ID.into(), Json::String(context.batch_id.into()));
    object.insert(
        FIELD_SOURCE_DATABASE.into(),
        Json::String(context.database.into()),
    );
    object.insert(FIELD_SOURCE_TABLE.into(), Json::String(context.table.into()));
    object.insert(
        FIELD_ARCHIVED_AT.into(),
        Json::String(rfc3339(&context.archived_at)),
    );
    Ok(serde_json::to_string(&object)?)
}

/// Serialize a batch to JSONL bytes, one `\n`-terminated line per row.
pub fn encode_batch(rows: &[Row], context: &RowContext) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    for row in rows {
        data.extend_from_slice(serialize_row(row, context)?.as_bytes());
        data.push(b'\n');
    }
    Ok(data)
}

/// Number of non-empty lines; must equal the record count.
pub fn count_lines(jsonl: &[u8]) -> u64 {
    jsonl
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .count() as u64
}

pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| format_err!("gzip decompression failed - {}", err))?;
    Ok(out)
}

/// Checksums for an encoded batch: uncompressed bytes first, then the
/// gzip output.
pub fn checksums(jsonl: &[u8], compressed: &[u8]) -> Checksums {
    Checksums {
        jsonl_sha256: sha256_hex(jsonl),
        compressed_sha256: sha256_hex(compressed),
    }
}

/// Validate payload bytes against recorded checksums.
pub fn verify_checksums(
    jsonl: &[u8],
    compressed: &[u8],
    expected: &Checksums,
) -> Result<(), Error> {
    let actual = sha256_hex(jsonl);
    if actual != expected.jsonl_sha256 {
        bail!(
            "JSONL checksum mismatch: expected {}, got {}",
            expected.jsonl_sha256,
            actual
        );
    }
    let actual = sha256_hex(compressed);
    if actual != expected.compressed_sha256 {
        bail!(
            "compressed checksum mismatch: expected {}, got {}",
            expected.compressed_sha256,
            actual
        );
    }
    Ok(())
}

/// Parse JSONL bytes into records; every non-empty line must be a JSON
/// object.
pub fn parse_records(jsonl: &[u8]) -> Result<Vec<JsonRecord>, Error> {
    let text = std::str::from_utf8(jsonl).map_err(|err| format_err!("invalid UTF-8 - {}", err))?;
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Json>(line) {
            Ok(Json::Object(object)) => records.push(object),
            Ok(_) => bail!("line {} is not a JSON object", idx + 1),
            Err(err) => bail!("line {} is not valid JSON - {}", idx + 1, err),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use relic_api_types::Value;

    fn context() -> RowContext<'static> {
        RowContext {
            batch_id: "00ff00ff00ff00ff",
            database: "app",
            table: "audit_logs",
            archived_at: Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 0).unwrap(),
        }
    }

    fn sample_rows() -> Vec<Row> {
        vec![
            vec![
                ("id".to_string(), Value::Int(1)),
                ("action".to_string(), Value::Text("SQL' OR '1'='1".into())),
            ],
            vec![
                ("id".to_string(), Value::Int(2)),
                ("action".to_string(), Value::Text("newline\n tab\t \"quote\" 中文 🦀".into())),
            ],
        ]
    }

    #[test]
    fn lines_are_self_contained_and_stamped() {
        let jsonl = encode_batch(&sample_rows(), &context()).unwrap();
        assert_eq!(count_lines(&jsonl), 2);

        let records = parse_records(&jsonl).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["_batch_id"], "00ff00ff00ff00ff");
        assert_eq!(records[0]["_source_database"], "app");
        assert_eq!(records[0]["_source_table"], "audit_logs");
        assert_eq!(records[0]["_archived_at"], "2026-01-06T00:00:00.000000Z");
        // special characters survive byte-exactly
        assert_eq!(records[0]["action"], "SQL' OR '1'='1");
        assert_eq!(records[1]["action"], "newline\n tab\t \"quote\" 中文 🦀");
    }

    #[test]
    fn reserved_field_collision_is_rejected() {
        let rows = vec![vec![("_batch_id".to_string(), Value::Int(1))]];
        assert!(encode_batch(&rows, &context()).is_err());
    }

    #[test]
    fn checksum_round_trip() {
        let jsonl = encode_batch(&sample_rows(), &context()).unwrap();
        let compressed = compress(&jsonl, 6).unwrap();
        let sums = checksums(&jsonl, &compressed);

        let restored = decompress(&compressed).unwrap();
        assert_eq!(restored, jsonl);
        assert_eq!(sha256_hex(&restored), sums.jsonl_sha256);
        verify_checksums(&jsonl, &compressed, &sums).unwrap();

        let mut tampered = compressed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(verify_checksums(&jsonl, &tampered, &sums).is_err());
    }

    #[test]
    fn compression_levels_stay_decodable() {
        let jsonl = encode_batch(&sample_rows(), &context()).unwrap();
        for level in [1, 6, 9] {
            let compressed = compress(&jsonl, level).unwrap();
            assert_eq!(decompress(&compressed).unwrap(), jsonl);
        }
    }

    #[test]
    fn empty_batch_has_zero_lines() {
        let jsonl = encode_batch(&[], &context()).unwrap();
        assert!(jsonl.is_empty());
        assert_eq!(count_lines(&jsonl), 0);
        assert!(parse_records(&jsonl).unwrap().is_empty());
    }
}
