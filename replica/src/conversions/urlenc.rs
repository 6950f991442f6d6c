use crate::bail;
use crate::error::{ErrorKind, ReplicaResult};
use crate::types::RowData;

/// Decodes an url-encoded row payload into column values.
///
/// Pairs are separated by `&`. A key without `=` is a NULL value, `+` decodes to a space
/// and `%XX` to the escaped byte.
pub fn decode_row(payload: &str) -> ReplicaResult<RowData> {
    let mut row = RowData::new();
    for (key, value) in decode_pairs(payload)? {
        row.insert(key, value);
    }

    Ok(row)
}

/// Decodes an url-encoded string into its pairs, keeping order and repeated keys.
pub fn decode_pairs(payload: &str) -> ReplicaResult<Vec<(String, Option<String>)>> {
    let mut pairs = Vec::new();
    for part in payload.split('&').filter(|part| !part.is_empty()) {
        let pair = match part.split_once('=') {
            Some((key, value)) => (unescape(key)?, Some(unescape(value)?)),
            None => (unescape(part)?, None),
        };
        pairs.push(pair);
    }

    Ok(pairs)
}

fn unescape(s: &str) -> ReplicaResult<String> {
    let bytes = s.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => result.push(b' '),
            b'%' => {
                let Some(hex) = bytes.get(i + 1..i + 3) else {
                    bail!(
                        ErrorKind::InvalidEvent,
                        "Could not decode url-encoded payload",
                        format!("truncated escape in '{s}'")
                    );
                };
                let (Some(high), Some(low)) = (hex_value(hex[0]), hex_value(hex[1])) else {
                    bail!(
                        ErrorKind::InvalidEvent,
                        "Could not decode url-encoded payload",
                        format!("invalid escape in '{s}'")
                    );
                };
                result.push(high << 4 | low);
                i += 2;
            }
            byte => result.push(byte),
        }
        i += 1;
    }

    Ok(String::from_utf8(result)?)
}

/// Value of one hex digit. Signs are not digits here, unlike for `u8::from_str_radix`.
fn hex_value(byte: u8) -> Option<u8> {
    char::from(byte).to_digit(16).map(|digit| digit as u8)
}
