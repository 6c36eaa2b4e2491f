//! Wire codec helpers.
//!
//! All gossip payloads use a deterministic SCALE-family encoding: compact
//! variable-length integers, fixed-size byte arrays emitted verbatim, options
//! as a one-byte tag followed by the payload, and variable slices as a compact
//! length prefix with a per-field hard limit enforced at decode time. The
//! layout must stay byte-identical across releases for gossip compatibility.

use parity_scale_codec::{Compact, Decode, Encode, Error as CodecError, Input, Output};

use crate::errors::{AtxError, AtxResult};

/// Merkle membership proofs never exceed this depth.
pub const MAX_MERKLE_NODES: usize = 32;
/// Upper bound on the proof-of-space index blob.
pub const MAX_POST_INDICES: usize = 800;
/// Ballot-side limits kept for wire compatibility.
pub const MAX_ELIGIBILITY_PROOFS: usize = 25_000;
pub const MAX_ACTIVE_SET: usize = 2_700_000;
pub const MAX_VOTES: usize = 10_000;

pub fn to_bytes<T: Encode>(value: &T) -> Vec<u8> {
    value.encode()
}

pub fn from_bytes<T: Decode>(bytes: &[u8]) -> AtxResult<T> {
    let mut input = bytes;
    let value = T::decode(&mut input).map_err(|err| AtxError::Malformed(err.to_string()))?;
    if !input.is_empty() {
        return Err(AtxError::Malformed("trailing bytes after payload".into()));
    }
    Ok(value)
}

pub fn encode_compact_u32<O: Output + ?Sized>(dest: &mut O, value: u32) {
    Compact(value).encode_to(dest);
}

pub fn decode_compact_u32<I: Input>(input: &mut I) -> Result<u32, CodecError> {
    Ok(Compact::<u32>::decode(input)?.0)
}

pub fn encode_compact_u64<O: Output + ?Sized>(dest: &mut O, value: u64) {
    Compact(value).encode_to(dest);
}

pub fn decode_compact_u64<I: Input>(input: &mut I) -> Result<u64, CodecError> {
    Ok(Compact::<u64>::decode(input)?.0)
}

/// Length-prefixed byte slice with a hard limit.
pub fn encode_byte_slice<O: Output + ?Sized>(dest: &mut O, bytes: &[u8]) {
    Compact(bytes.len() as u32).encode_to(dest);
    dest.write(bytes);
}

pub fn decode_byte_slice<I: Input>(input: &mut I, limit: usize) -> Result<Vec<u8>, CodecError> {
    let len = decode_compact_u32(input)? as usize;
    if len > limit {
        return Err("byte slice exceeds field limit".into());
    }
    let mut buf = vec![0u8; len];
    input.read(&mut buf)?;
    Ok(buf)
}

/// Length-prefixed element slice with a hard limit.
pub fn encode_slice<T: Encode, O: Output + ?Sized>(dest: &mut O, items: &[T]) {
    Compact(items.len() as u32).encode_to(dest);
    for item in items {
        item.encode_to(dest);
    }
}

pub fn decode_slice<T: Decode, I: Input>(input: &mut I, limit: usize) -> Result<Vec<T>, CodecError> {
    let len = decode_compact_u32(input)? as usize;
    if len > limit {
        return Err("slice exceeds field limit".into());
    }
    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        items.push(T::decode(input)?);
    }
    Ok(items)
}

/// Option with a compact-encoded integer payload.
pub fn encode_option_compact_u64<O: Output + ?Sized>(dest: &mut O, value: &Option<u64>) {
    match value {
        Some(value) => {
            dest.push_byte(1);
            encode_compact_u64(dest, *value);
        }
        None => dest.push_byte(0),
    }
}

pub fn decode_option_compact_u64<I: Input>(input: &mut I) -> Result<Option<u64>, CodecError> {
    match input.read_byte()? {
        0 => Ok(None),
        1 => Ok(Some(decode_compact_u64(input)?)),
        _ => Err("invalid option tag".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_integers_round_trip() {
        for value in [0u64, 1, 63, 64, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_compact_u64(&mut buf, value);
            let decoded = decode_compact_u64(&mut buf.as_slice()).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn byte_slice_round_trips_and_enforces_limit() {
        let payload = vec![7u8; 16];
        let mut buf = Vec::new();
        encode_byte_slice(&mut buf, &payload);
        let decoded = decode_byte_slice(&mut buf.as_slice(), 16).unwrap();
        assert_eq!(decoded, payload);

        assert!(decode_byte_slice(&mut buf.as_slice(), 15).is_err());
    }

    #[test]
    fn element_slice_enforces_limit() {
        let items: Vec<u8> = (0..8).collect();
        let mut buf = Vec::new();
        encode_slice(&mut buf, &items);
        assert_eq!(decode_slice::<u8, _>(&mut buf.as_slice(), 8).unwrap(), items);
        assert!(decode_slice::<u8, _>(&mut buf.as_slice(), 7).is_err());
    }

    #[test]
    fn optional_compact_round_trips() {
        for value in [None, Some(0), Some(129), Some(u64::MAX)] {
            let mut buf = Vec::new();
            encode_option_compact_u64(&mut buf, &value);
            assert_eq!(decode_option_compact_u64(&mut buf.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn from_bytes_rejects_trailing_garbage() {
        let mut buf = 5u8.encode();
        buf.push(0xff);
        assert!(matches!(
            from_bytes::<u8>(&buf),
            Err(AtxError::Malformed(_))
        ));
    }
}
