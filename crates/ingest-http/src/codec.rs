// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire format for records and batches.
//!
//! A record is encoded as a compact JSON object. A batch body is the JSON array of its encoded
//! records, in submission order, optionally compressed with zstd.

use crate::errors::EncodingError;
use crate::record::Record;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};
use zstd::zstd_safe::CompressionLevel;

/// Deepest nesting accepted in a record, counting the record itself as level 1. Matches the
/// recursion limit serde_json applies when reading.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Checks that a record can be represented on the wire.
pub fn validate(fields: &Map<String, Value>) -> Result<(), EncodingError> {
    let mut stack: Vec<(&Value, usize)> = fields.values().map(|value| (value, 2)).collect();
    while let Some((value, depth)) = stack.pop() {
        match value {
            Value::Object(map) => {
                check_depth(depth)?;
                stack.extend(map.values().map(|child| (child, depth + 1)));
            }
            Value::Array(items) => {
                check_depth(depth)?;
                stack.extend(items.iter().map(|child| (child, depth + 1)));
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_depth(depth: usize) -> Result<(), EncodingError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(EncodingError::TooDeep {
            limit: MAX_NESTING_DEPTH,
        });
    }
    Ok(())
}

pub fn encode(record: &Record) -> Result<Bytes, EncodingError> {
    validate(record.fields())?;
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|e| EncodingError::Serialize(e.to_string()))
}

/// Bytes a batch of `records` encoded records adds on top of their own size.
pub fn framing_len(records: usize) -> usize {
    2 + records.saturating_sub(1)
}

/// Joins already encoded records into one batch body.
pub fn encode_batch<'a, I>(
    records: I,
    compression_level: Option<CompressionLevel>,
) -> Result<Bytes, EncodingError>
where
    I: IntoIterator<Item = &'a Bytes>,
{
    let mut body = BytesMut::new();
    body.put_u8(b'[');
    for (i, record) in records.into_iter().enumerate() {
        if i > 0 {
            body.put_u8(b',');
        }
        body.extend_from_slice(record);
    }
    body.put_u8(b']');

    match compression_level {
        None => Ok(body.freeze()),
        Some(level) => zstd::bulk::compress(&body, level)
            .map(Bytes::from)
            .map_err(|e| EncodingError::Compression(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested(levels: usize) -> Value {
        let mut value = json!("leaf");
        for _ in 0..levels {
            value = json!({ "inner": value });
        }
        value
    }

    #[test]
    fn test_encode_keeps_field_order() {
        let record = Record::from_value(json!({"z": 1, "a": "x", "m": [true, null]})).unwrap();
        let encoded = encode(&record).unwrap();
        assert_eq!(&encoded[..], br#"{"z":1,"a":"x","m":[true,null]}"#);
    }

    #[test]
    fn test_nesting_limit() {
        // `nested(n)` is n objects deep
        assert!(Record::from_value(nested(MAX_NESTING_DEPTH)).is_ok());
        assert_eq!(
            Record::from_value(nested(MAX_NESTING_DEPTH + 1)),
            Err(EncodingError::TooDeep {
                limit: MAX_NESTING_DEPTH
            })
        );
    }

    #[test]
    fn test_encode_batch_framing() {
        let records = vec![Bytes::from_static(b"{\"a\":1}"), Bytes::from_static(b"{\"b\":2}")];
        let body = encode_batch(&records, None).unwrap();
        assert_eq!(&body[..], br#"[{"a":1},{"b":2}]"#);
        assert_eq!(body.len(), 14 + framing_len(2));

        let empty: Vec<Bytes> = Vec::new();
        assert_eq!(&encode_batch(&empty, None).unwrap()[..], b"[]");
        assert_eq!(framing_len(0), 2);
    }

    #[test]
    fn test_encode_batch_compressed() {
        let records = vec![Bytes::from_static(b"{\"a\":1}")];
        let body = encode_batch(&records, Some(3)).unwrap();
        let decompressed = zstd::bulk::decompress(&body, 1024).unwrap();
        assert_eq!(&decompressed[..], br#"[{"a":1}]"#);
    }
}
