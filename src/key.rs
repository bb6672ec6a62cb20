//! Shard keys and key ranges.
//!
//! A [`ShardKey`] is a typed, immutable byte encoding of an application
//! key value. Encodings are canonical: byte-wise comparison of the raw
//! value equals semantic comparison of the decoded value, so every index
//! in the crate can order and search keys without knowing their type.
//!
//! The absent raw value is the `+infinity` sentinel used as the open
//! upper bound of a [`ShardRange`]; it compares greater than every
//! concrete key of the same type.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Type of the value a shard key encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardKeyType {
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// UUID, compared by its big-endian byte representation.
    Guid,
    /// Raw byte string, compared lexicographically.
    Binary,
    /// Timestamp in milliseconds since the Unix epoch.
    DateTime,
    /// Boolean, false < true.
    Boolean,
    /// 32-bit IEEE-754 float.
    Single,
    /// 64-bit IEEE-754 float.
    Double,
}

impl ShardKeyType {
    /// Encoded width in bytes; `None` for variable-width types.
    fn fixed_width(self) -> Option<usize> {
        match self {
            ShardKeyType::Int32 | ShardKeyType::Single => Some(4),
            ShardKeyType::Int64 | ShardKeyType::DateTime | ShardKeyType::Double => Some(8),
            ShardKeyType::Guid => Some(16),
            ShardKeyType::Boolean => Some(1),
            ShardKeyType::Binary => None,
        }
    }
}

/// A typed, totally ordered shard key.
///
/// `raw == None` is the `+infinity` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKey {
    key_type: ShardKeyType,
    raw: Option<Vec<u8>>,
}

impl ShardKey {
    /// Key from a 32-bit integer.
    pub fn from_i32(value: i32) -> Self {
        Self {
            key_type: ShardKeyType::Int32,
            raw: Some(((value as u32) ^ 0x8000_0000).to_be_bytes().to_vec()),
        }
    }

    /// Key from a 64-bit integer.
    pub fn from_i64(value: i64) -> Self {
        Self {
            key_type: ShardKeyType::Int64,
            raw: Some(((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes().to_vec()),
        }
    }

    /// Key from a UUID.
    pub fn from_guid(value: Uuid) -> Self {
        Self {
            key_type: ShardKeyType::Guid,
            raw: Some(value.as_bytes().to_vec()),
        }
    }

    /// Key from a raw byte string.
    pub fn from_bytes(value: impl Into<Vec<u8>>) -> Self {
        Self {
            key_type: ShardKeyType::Binary,
            raw: Some(value.into()),
        }
    }

    /// Key from a timestamp in milliseconds since the Unix epoch.
    pub fn from_datetime_millis(millis: i64) -> Self {
        Self {
            key_type: ShardKeyType::DateTime,
            raw: Some(((millis as u64) ^ 0x8000_0000_0000_0000).to_be_bytes().to_vec()),
        }
    }

    /// Key from a boolean.
    pub fn from_bool(value: bool) -> Self {
        Self {
            key_type: ShardKeyType::Boolean,
            raw: Some(vec![u8::from(value)]),
        }
    }

    /// Key from a 32-bit float.
    pub fn from_f32(value: f32) -> Self {
        let bits = value.to_bits();
        let ordered = if bits & 0x8000_0000 != 0 {
            !bits
        } else {
            bits ^ 0x8000_0000
        };
        Self {
            key_type: ShardKeyType::Single,
            raw: Some(ordered.to_be_bytes().to_vec()),
        }
    }

    /// Key from a 64-bit float.
    pub fn from_f64(value: f64) -> Self {
        let bits = value.to_bits();
        let ordered = if bits & 0x8000_0000_0000_0000 != 0 {
            !bits
        } else {
            bits ^ 0x8000_0000_0000_0000
        };
        Self {
            key_type: ShardKeyType::Double,
            raw: Some(ordered.to_be_bytes().to_vec()),
        }
    }

    /// The `+infinity` sentinel of the given type.
    pub fn plus_infinity(key_type: ShardKeyType) -> Self {
        Self {
            key_type,
            raw: None,
        }
    }

    /// Rebuild a key from a previously encoded raw value.
    ///
    /// Round-trips with the typed constructors; the byte length must
    /// match the type's encoded width.
    pub fn from_raw(key_type: ShardKeyType, raw: Vec<u8>) -> Result<Self> {
        if let Some(width) = key_type.fixed_width() {
            if raw.len() != width {
                return Err(Error::InvalidArgument(format!(
                    "raw value for {key_type:?} must be {width} bytes, got {}",
                    raw.len()
                )));
            }
        }
        Ok(Self {
            key_type,
            raw: Some(raw),
        })
    }

    /// The key's type.
    pub fn key_type(&self) -> ShardKeyType {
        self.key_type
    }

    /// Whether this key is the `+infinity` sentinel.
    pub fn is_infinity(&self) -> bool {
        self.raw.is_none()
    }

    /// The canonical raw encoding; `None` for the sentinel.
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    /// Decode as a 32-bit integer.
    pub fn as_i32(&self) -> Result<i32> {
        let raw = self.typed_raw(ShardKeyType::Int32)?;
        let bits = u32::from_be_bytes(raw.try_into().expect("width checked"));
        Ok((bits ^ 0x8000_0000) as i32)
    }

    /// Decode as a 64-bit integer.
    pub fn as_i64(&self) -> Result<i64> {
        let raw = self.typed_raw(ShardKeyType::Int64)?;
        let bits = u64::from_be_bytes(raw.try_into().expect("width checked"));
        Ok((bits ^ 0x8000_0000_0000_0000) as i64)
    }

    /// Decode as a UUID.
    pub fn as_guid(&self) -> Result<Uuid> {
        let raw = self.typed_raw(ShardKeyType::Guid)?;
        Ok(Uuid::from_bytes(raw.try_into().expect("width checked")))
    }

    /// Decode as a timestamp in milliseconds since the Unix epoch.
    pub fn as_datetime_millis(&self) -> Result<i64> {
        let raw = self.typed_raw(ShardKeyType::DateTime)?;
        let bits = u64::from_be_bytes(raw.try_into().expect("width checked"));
        Ok((bits ^ 0x8000_0000_0000_0000) as i64)
    }

    /// Decode as a boolean.
    pub fn as_bool(&self) -> Result<bool> {
        let raw = self.typed_raw(ShardKeyType::Boolean)?;
        Ok(raw[0] != 0)
    }

    /// Decode as a 32-bit float.
    pub fn as_f32(&self) -> Result<f32> {
        let raw = self.typed_raw(ShardKeyType::Single)?;
        let ordered = u32::from_be_bytes(raw.try_into().expect("width checked"));
        let bits = if ordered & 0x8000_0000 != 0 {
            ordered ^ 0x8000_0000
        } else {
            !ordered
        };
        Ok(f32::from_bits(bits))
    }

    /// Decode as a 64-bit float.
    pub fn as_f64(&self) -> Result<f64> {
        let raw = self.typed_raw(ShardKeyType::Double)?;
        let ordered = u64::from_be_bytes(raw.try_into().expect("width checked"));
        let bits = if ordered & 0x8000_0000_0000_0000 != 0 {
            ordered ^ 0x8000_0000_0000_0000
        } else {
            !ordered
        };
        Ok(f64::from_bits(bits))
    }

    fn typed_raw(&self, expected: ShardKeyType) -> Result<Vec<u8>> {
        if self.key_type != expected {
            return Err(Error::InvalidArgument(format!(
                "key has type {:?}, expected {expected:?}",
                self.key_type
            )));
        }
        self.raw.clone().ok_or_else(|| {
            Error::InvalidArgument("the +infinity sentinel has no concrete value".into())
        })
    }

    /// The immediate successor of this key in its key space.
    ///
    /// Fixed-width keys increment the raw bytes with carry; incrementing
    /// the maximum value yields the `+infinity` sentinel. Binary keys
    /// append a zero byte, their immediate lexicographic successor.
    /// Point mappings are stored as the unit range `[k, k.successor())`.
    pub fn successor(&self) -> Result<ShardKey> {
        let raw = self.raw.as_ref().ok_or_else(|| {
            Error::InvalidArgument("the +infinity sentinel has no successor".into())
        })?;

        if self.key_type == ShardKeyType::Binary {
            let mut next = raw.clone();
            next.push(0);
            return Ok(ShardKey {
                key_type: self.key_type,
                raw: Some(next),
            });
        }

        let mut next = raw.clone();
        for byte in next.iter_mut().rev() {
            let (incremented, overflow) = byte.overflowing_add(1);
            *byte = incremented;
            if !overflow {
                return Ok(ShardKey {
                    key_type: self.key_type,
                    raw: Some(next),
                });
            }
        }
        // Carried past the most significant byte: past the end of the
        // key space.
        Ok(ShardKey::plus_infinity(self.key_type))
    }

    /// Compare two keys, failing when their types differ.
    pub fn try_compare(&self, other: &ShardKey) -> Result<Ordering> {
        ensure_same_type(self, other)?;
        Ok(self.cmp(other))
    }
}

/// Fail unless both keys encode the same type.
pub(crate) fn ensure_same_type(a: &ShardKey, b: &ShardKey) -> Result<()> {
    if a.key_type != b.key_type {
        return Err(Error::InvalidArgument(format!(
            "cannot compare keys of types {:?} and {:?}",
            a.key_type, b.key_type
        )));
    }
    Ok(())
}

impl Ord for ShardKey {
    // Orders by type first so `cmp` agrees with the derived `Eq`; keys
    // of different types are never `Equal` even with identical raw
    // encodings.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_type
            .cmp(&other.key_type)
            .then_with(|| match (&self.raw, &other.raw) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    }
}

impl PartialOrd for ShardKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.raw {
            None => write!(f, "+inf"),
            Some(raw) => {
                for byte in raw {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// A half-open key range `[low, high)`.
///
/// `high` may be the `+infinity` sentinel, in which case the range is
/// unbounded above. Committed mappings in one shard map hold pairwise
/// non-intersecting ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRange {
    low: ShardKey,
    high: ShardKey,
}

impl ShardRange {
    /// Create a range, validating `low < high` and matching key types.
    pub fn new(low: ShardKey, high: ShardKey) -> Result<Self> {
        ensure_same_type(&low, &high)?;
        if low.is_infinity() {
            return Err(Error::InvalidArgument(
                "range low bound cannot be +infinity".into(),
            ));
        }
        if low >= high {
            return Err(Error::InvalidArgument(format!(
                "range low bound {low} must be less than high bound {high}"
            )));
        }
        Ok(Self { low, high })
    }

    /// The unit range `[key, successor(key))` modelling a point mapping.
    pub fn point(key: &ShardKey) -> Result<Self> {
        let high = key.successor()?;
        Self::new(key.clone(), high)
    }

    /// Lower bound (inclusive).
    pub fn low(&self) -> &ShardKey {
        &self.low
    }

    /// Upper bound (exclusive); may be the `+infinity` sentinel.
    pub fn high(&self) -> &ShardKey {
        &self.high
    }

    /// Key type of both bounds.
    pub fn key_type(&self) -> ShardKeyType {
        self.low.key_type()
    }

    /// Whether the key falls inside `[low, high)`.
    pub fn contains(&self, key: &ShardKey) -> bool {
        key >= &self.low && key < &self.high
    }

    /// Whether two ranges share at least one key.
    pub fn intersects(&self, other: &ShardRange) -> bool {
        self.low < other.high && other.low < self.high
    }

    /// Whether `self` ends exactly where `other` begins. Drives merge
    /// eligibility.
    pub fn is_adjacent_to(&self, other: &ShardRange) -> bool {
        self.high == other.low
    }
}

impl Ord for ShardRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.low
            .cmp(&other.low)
            .then_with(|| self.high.cmp(&other.high))
    }
}

impl PartialOrd for ShardRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ShardRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_order_matches_bytes() {
        let values = [i32::MIN, -7, -1, 0, 1, 42, i32::MAX];
        for window in values.windows(2) {
            let a = ShardKey::from_i32(window[0]);
            let b = ShardKey::from_i32(window[1]);
            assert!(a < b, "{} should sort before {}", window[0], window[1]);
        }
    }

    #[test]
    fn int64_and_datetime_round_trip() {
        for v in [i64::MIN, -1, 0, 99, i64::MAX] {
            assert_eq!(ShardKey::from_i64(v).as_i64().unwrap(), v);
            assert_eq!(
                ShardKey::from_datetime_millis(v).as_datetime_millis().unwrap(),
                v
            );
        }
    }

    #[test]
    fn float_order_matches_bytes() {
        let values = [f64::NEG_INFINITY, -10.5, -0.0, 0.0, 1.25, f64::INFINITY];
        for window in values.windows(2) {
            let a = ShardKey::from_f64(window[0]);
            let b = ShardKey::from_f64(window[1]);
            assert!(a <= b, "{} should not sort after {}", window[0], window[1]);
        }
        assert_eq!(ShardKey::from_f32(-2.5).as_f32().unwrap(), -2.5);
        assert_eq!(ShardKey::from_f64(1e300).as_f64().unwrap(), 1e300);
    }

    #[test]
    fn raw_round_trip() {
        let key = ShardKey::from_i32(-42);
        let raw = key.raw().unwrap().to_vec();
        let back = ShardKey::from_raw(ShardKeyType::Int32, raw).unwrap();
        assert_eq!(back, key);
        assert_eq!(back.as_i32().unwrap(), -42);

        assert!(ShardKey::from_raw(ShardKeyType::Int64, vec![0; 3]).is_err());
    }

    #[test]
    fn cross_type_keys_never_compare_equal() {
        // Same canonical raw bytes, different types.
        let a = ShardKey::from_i64(0);
        let b = ShardKey::from_datetime_millis(0);
        assert_eq!(a.raw(), b.raw());
        assert_ne!(a, b);
        assert_ne!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn mismatched_types_fail() {
        let a = ShardKey::from_i32(1);
        let b = ShardKey::from_i64(1);
        assert!(a.try_compare(&b).is_err());
        assert!(ShardRange::new(a, b).is_err());
    }

    #[test]
    fn infinity_sorts_last() {
        let inf = ShardKey::plus_infinity(ShardKeyType::Int32);
        assert!(ShardKey::from_i32(i32::MAX) < inf);
        assert!(inf.is_infinity());
        assert!(inf.successor().is_err());
    }

    #[test]
    fn successor_carries_and_overflows() {
        assert_eq!(
            ShardKey::from_i32(41).successor().unwrap(),
            ShardKey::from_i32(42)
        );
        assert_eq!(
            ShardKey::from_i32(255).successor().unwrap(),
            ShardKey::from_i32(256)
        );
        assert!(ShardKey::from_i32(i32::MAX).successor().unwrap().is_infinity());
        assert_eq!(
            ShardKey::from_bool(false).successor().unwrap(),
            ShardKey::from_bool(true)
        );
        assert!(ShardKey::from_bool(true).successor().unwrap().is_infinity());
    }

    #[test]
    fn binary_successor_is_immediate() {
        let key = ShardKey::from_bytes(vec![0xAB]);
        let next = key.successor().unwrap();
        assert_eq!(next, ShardKey::from_bytes(vec![0xAB, 0x00]));
        assert!(key < next);
    }

    #[test]
    fn range_contains_half_open() {
        let range =
            ShardRange::new(ShardKey::from_i32(0), ShardKey::from_i32(10)).unwrap();
        assert!(range.contains(&ShardKey::from_i32(0)));
        assert!(range.contains(&ShardKey::from_i32(9)));
        assert!(!range.contains(&ShardKey::from_i32(10)));
        assert!(!range.contains(&ShardKey::from_i32(-1)));
    }

    #[test]
    fn unbounded_range_contains_everything_above() {
        let range = ShardRange::new(
            ShardKey::from_i32(100),
            ShardKey::plus_infinity(ShardKeyType::Int32),
        )
        .unwrap();
        assert!(range.contains(&ShardKey::from_i32(i32::MAX)));
        assert!(!range.contains(&ShardKey::from_i32(99)));
    }

    #[test]
    fn intersection_and_adjacency() {
        let a = ShardRange::new(ShardKey::from_i32(0), ShardKey::from_i32(10)).unwrap();
        let b = ShardRange::new(ShardKey::from_i32(10), ShardKey::from_i32(20)).unwrap();
        let c = ShardRange::new(ShardKey::from_i32(5), ShardKey::from_i32(15)).unwrap();
        assert!(!a.intersects(&b));
        assert!(a.is_adjacent_to(&b));
        assert!(!b.is_adjacent_to(&a));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
    }

    #[test]
    fn invalid_ranges_rejected() {
        assert!(ShardRange::new(ShardKey::from_i32(5), ShardKey::from_i32(5)).is_err());
        assert!(ShardRange::new(ShardKey::from_i32(6), ShardKey::from_i32(5)).is_err());
        assert!(ShardRange::new(
            ShardKey::plus_infinity(ShardKeyType::Int32),
            ShardKey::from_i32(5)
        )
        .is_err());
    }

    #[test]
    fn point_range_is_unit_width() {
        let point = ShardRange::point(&ShardKey::from_i32(42)).unwrap();
        assert!(point.contains(&ShardKey::from_i32(42)));
        assert!(!point.contains(&ShardKey::from_i32(43)));
    }
}
