//! MessagePack peak-list import (the "OnDA" network schemas, spec §6).

use std::collections::HashMap;

use rmpv::Value;

use crate::error::{EngineError, Result};
use crate::peak_search::Peak;

/// Decode either the `peak_list` schema (three parallel arrays) or the
/// `corr_data` schema (a raw float64 image blob) from a msgpack map.
///
/// Per the REDESIGN FLAGS resolution: if a key occurs more than once in
/// the top-level map, the *last* occurrence wins (matching the original
/// behaviour), but a `tracing::warn!` plus a `MalformedInput`-tagged note
/// is additionally surfaced rather than silently overwriting.
pub fn decode_peak_message(bytes: &[u8]) -> Result<DecodedMessage> {
    let value: Value = rmpv::decode::read_value(&mut &bytes[..]).map_err(|e| EngineError::MalformedInput {
        path: "msgpack message".into(),
        reason: format!("invalid msgpack: {e}"),
    })?;

    let map = value.as_map().ok_or_else(|| EngineError::MalformedInput {
        path: "msgpack message".into(),
        reason: "top-level msgpack value is not a map".into(),
    })?;

    let mut last_by_key: HashMap<String, &Value> = HashMap::new();
    let mut duplicate_keys = Vec::new();
    for (k, v) in map {
        let Some(key) = k.as_str() else { continue };
        if last_by_key.contains_key(key) {
            duplicate_keys.push(key.to_string());
        }
        last_by_key.insert(key.to_string(), v);
    }

    if !duplicate_keys.is_empty() {
        tracing::warn!(?duplicate_keys, "msgpack message had duplicate top-level keys; using last occurrence");
    }

    let warning = if duplicate_keys.is_empty() {
        None
    } else {
        Some(EngineError::MalformedInput {
            path: "msgpack message".into(),
            reason: format!("duplicate keys, last-value-wins: {duplicate_keys:?}"),
        })
    };

    if let Some(peak_list) = last_by_key.get("peak_list") {
        return Ok(DecodedMessage {
            payload: MessagePayload::Peaks(parse_peak_list(peak_list)?),
            duplicate_key_warning: warning,
        });
    }
    if let Some(corr_data) = last_by_key.get("corr_data") {
        return Ok(DecodedMessage {
            payload: MessagePayload::CorrData(parse_corr_data(corr_data)?),
            duplicate_key_warning: warning,
        });
    }

    Err(EngineError::MalformedInput {
        path: "msgpack message".into(),
        reason: "neither 'peak_list' nor 'corr_data' key present".into(),
    })
}

pub struct DecodedMessage {
    pub payload: MessagePayload,
    pub duplicate_key_warning: Option<EngineError>,
}

pub enum MessagePayload {
    Peaks(Vec<Peak>),
    CorrData(CorrData),
}

/// A raw correlation-data image blob, decoded but not yet peak-searched.
pub struct CorrData {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f64>,
}

fn parse_peak_list(value: &Value) -> Result<Vec<Peak>> {
    let arr = value.as_array().ok_or_else(|| malformed("peak_list is not an array"))?;
    if arr.len() != 3 {
        return Err(malformed("peak_list must have exactly 3 parallel arrays"));
    }
    let fs_list = as_f64_array(&arr[0])?;
    let ss_list = as_f64_array(&arr[1])?;
    let intensity_list = as_f64_array(&arr[2])?;
    if fs_list.len() != ss_list.len() || fs_list.len() != intensity_list.len() {
        return Err(malformed("peak_list arrays have mismatched lengths"));
    }
    Ok(fs_list
        .into_iter()
        .zip(ss_list)
        .zip(intensity_list)
        .map(|((fs, ss), intensity)| Peak {
            panel: String::new(),
            fs,
            ss,
            intensity,
        })
        .collect())
}

fn parse_corr_data(value: &Value) -> Result<CorrData> {
    let map = value.as_map().ok_or_else(|| malformed("corr_data is not a map"))?;
    let mut data_bytes: Option<&[u8]> = None;
    let mut shape: Option<(usize, usize)> = None;
    for (k, v) in map {
        match k.as_str() {
            Some("data") => data_bytes = v.as_slice(),
            Some("shape") => {
                let arr = v.as_array().ok_or_else(|| malformed("shape is not an array"))?;
                if arr.len() != 2 {
                    return Err(malformed("shape must be [height, width]"));
                }
                let h = arr[0].as_u64().ok_or_else(|| malformed("shape[0] not an integer"))? as usize;
                let w = arr[1].as_u64().ok_or_else(|| malformed("shape[1] not an integer"))? as usize;
                shape = Some((h, w));
            }
            _ => {}
        }
    }
    let bytes = data_bytes.ok_or_else(|| malformed("corr_data missing 'data'"))?;
    let (height, width) = shape.ok_or_else(|| malformed("corr_data missing 'shape'"))?;
    if bytes.len() != height * width * 8 {
        return Err(malformed("corr_data byte length does not match shape * 8"));
    }
    let data = bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().expect("chunks_exact(8)")))
        .collect();
    Ok(CorrData { height, width, data })
}

fn as_f64_array(value: &Value) -> Result<Vec<f64>> {
    let arr = value.as_array().ok_or_else(|| malformed("expected an array"))?;
    arr.iter()
        .map(|v| v.as_f64().ok_or_else(|| malformed("expected a float array element")))
        .collect()
}

fn malformed(reason: &str) -> EngineError {
    EngineError::MalformedInput {
        path: "msgpack message".into(),
        reason: reason.to_string(),
    }
}

/// Apply the +0.5 pixel-index→pixel-distance convention shift used for
/// externally imported peaks (spec §4.C), then tag them with their owning
/// panel name via detector lookup.
pub fn finalize_imported_peaks(mut peaks: Vec<Peak>, apply_offset: bool) -> Vec<Peak> {
    if apply_offset {
        crate::peak_search::apply_pixel_index_offset(&mut peaks);
    }
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    #[test]
    fn decodes_peak_list_schema() {
        let value = Value::Map(vec![(
            Value::String("peak_list".into()),
            Value::Array(vec![
                Value::Array(vec![Value::F64(1.0), Value::F64(2.0)]),
                Value::Array(vec![Value::F64(10.0), Value::F64(20.0)]),
                Value::Array(vec![Value::F64(100.0), Value::F64(200.0)]),
            ]),
        )]);
        let bytes = encode(&value);
        let decoded = decode_peak_message(&bytes).unwrap();
        match decoded.payload {
            MessagePayload::Peaks(peaks) => {
                assert_eq!(peaks.len(), 2);
                assert_eq!(peaks[0].fs, 1.0);
                assert_eq!(peaks[0].ss, 10.0);
                assert_eq!(peaks[0].intensity, 100.0);
            }
            _ => panic!("expected Peaks payload"),
        }
        assert!(decoded.duplicate_key_warning.is_none());
    }

    #[test]
    fn decodes_corr_data_schema() {
        let raw: Vec<f64> = vec![1.0, 2.0, 3.0, 4.0];
        let bytes_blob: Vec<u8> = raw.iter().flat_map(|v| v.to_le_bytes()).collect();
        let value = Value::Map(vec![(
            Value::String("corr_data".into()),
            Value::Map(vec![
                (Value::String("data".into()), Value::Binary(bytes_blob)),
                (
                    Value::String("shape".into()),
                    Value::Array(vec![Value::Integer(2.into()), Value::Integer(2.into())]),
                ),
            ]),
        )]);
        let bytes = encode(&value);
        let decoded = decode_peak_message(&bytes).unwrap();
        match decoded.payload {
            MessagePayload::CorrData(corr) => {
                assert_eq!(corr.height, 2);
                assert_eq!(corr.width, 2);
                assert_eq!(corr.data, raw);
            }
            _ => panic!("expected CorrData payload"),
        }
    }

    #[test]
    fn duplicate_key_uses_last_value_and_warns() {
        let value = Value::Map(vec![
            (
                Value::String("peak_list".into()),
                Value::Array(vec![
                    Value::Array(vec![Value::F64(1.0)]),
                    Value::Array(vec![Value::F64(1.0)]),
                    Value::Array(vec![Value::F64(1.0)]),
                ]),
            ),
            (
                Value::String("peak_list".into()),
                Value::Array(vec![
                    Value::Array(vec![Value::F64(9.0)]),
                    Value::Array(vec![Value::F64(9.0)]),
                    Value::Array(vec![Value::F64(9.0)]),
                ]),
            ),
        ]);
        let bytes = encode(&value);
        let decoded = decode_peak_message(&bytes).unwrap();
        assert!(decoded.duplicate_key_warning.is_some());
        match decoded.payload {
            MessagePayload::Peaks(peaks) => assert_eq!(peaks[0].fs, 9.0),
            _ => panic!("expected Peaks payload"),
        }
    }
}
