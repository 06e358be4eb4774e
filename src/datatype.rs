//! Datatype trait, wire encoding and reduction combine functions.
//!
//! This module provides the [`Datatype`] trait, a sealed trait that maps Rust
//! primitive types to a fixed-width little-endian wire encoding and to the
//! combine function used by [`ReduceOp`].
//!
//! Every message carries the [`DatatypeTag`] of its elements, so a receive
//! with a different element type fails instead of reinterpreting the bytes.
//!
//! # Supported Types
//!
//! | Rust Type | Width (bytes) | Tag Value |
//! |-----------|---------------|-----------|
//! | `f32`     | 4             | 0         |
//! | `f64`     | 8             | 1         |
//! | `i32`     | 4             | 2         |
//! | `i64`     | 8             | 3         |
//! | `u8`      | 1             | 4         |
//! | `u32`     | 4             | 5         |
//! | `u64`     | 8             | 6         |

use crate::ReduceOp;
use std::borrow::Cow;
use std::fmt::Debug;

/// Internal module to seal the trait against external implementations.
mod sealed {
    pub trait Sealed {}
}

/// Identifies the element type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DatatypeTag {
    /// 32-bit floating point
    F32 = 0,
    /// 64-bit floating point
    F64 = 1,
    /// 32-bit signed integer
    I32 = 2,
    /// 64-bit signed integer
    I64 = 3,
    /// 8-bit unsigned integer
    U8 = 4,
    /// 32-bit unsigned integer
    U32 = 5,
    /// 64-bit unsigned integer
    U64 = 6,
}

impl TryFrom<u8> for DatatypeTag {
    type Error = u8;

    fn try_from(raw: u8) -> std::result::Result<Self, u8> {
        Ok(match raw {
            0 => DatatypeTag::F32,
            1 => DatatypeTag::F64,
            2 => DatatypeTag::I32,
            3 => DatatypeTag::I64,
            4 => DatatypeTag::U8,
            5 => DatatypeTag::U32,
            6 => DatatypeTag::U64,
            other => return Err(other),
        })
    }
}

/// Trait for element types that can travel in a message.
///
/// This is a **sealed trait**: it cannot be implemented outside this crate.
/// Supported types: [`f32`], [`f64`], [`i32`], [`i64`], [`u8`], [`u32`], [`u64`].
///
/// Encoding is little-endian and lossless, so a broadcast value is
/// bit-identical on every rank.
pub trait Datatype: sealed::Sealed + Copy + PartialEq + Debug + Send + 'static {
    /// The datatype tag.
    const TAG: DatatypeTag;

    /// Encoded width in bytes.
    const SIZE: usize;

    /// Write `self` into `out`, which is exactly [`Self::SIZE`] bytes long.
    fn write_le(self, out: &mut [u8]);

    /// Read a value from exactly [`Self::SIZE`] bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Combine two values with a reduction operator.
    fn combine(op: ReduceOp, a: Self, b: Self) -> Self;

    /// The slice as wire bytes, when its in-memory layout already is the
    /// wire encoding.
    #[doc(hidden)]
    fn as_wire(_data: &[Self]) -> Option<&[u8]> {
        None
    }

    /// Mutable counterpart of [`as_wire`](Self::as_wire).
    #[doc(hidden)]
    fn as_wire_mut(_data: &mut [Self]) -> Option<&mut [u8]> {
        None
    }
}

macro_rules! impl_datatype {
    (float $ty:ty, $tag:expr) => {
        impl sealed::Sealed for $ty {}
        impl Datatype for $ty {
            const TAG: DatatypeTag = $tag;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => a + b,
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Max => a.max(b),
                }
            }
        }
    };
    (int $ty:ty, $tag:expr $(, { $($extra:tt)* })?) => {
        impl sealed::Sealed for $ty {}
        impl Datatype for $ty {
            const TAG: DatatypeTag = $tag;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            // Integer sums wrap on overflow
            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => a.wrapping_add(b),
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Max => a.max(b),
                }
            }

            $($($extra)*)?
        }
    };
}

impl_datatype!(float f32, DatatypeTag::F32);
impl_datatype!(float f64, DatatypeTag::F64);
impl_datatype!(int i32, DatatypeTag::I32);
impl_datatype!(int i64, DatatypeTag::I64);
impl_datatype!(int u8, DatatypeTag::U8, {
    fn as_wire(data: &[u8]) -> Option<&[u8]> {
        Some(data)
    }

    fn as_wire_mut(data: &mut [u8]) -> Option<&mut [u8]> {
        Some(data)
    }
});
impl_datatype!(int u32, DatatypeTag::U32);
impl_datatype!(int u64, DatatypeTag::U64);

/// Encode a slice into its wire representation. Byte slices are borrowed.
pub(crate) fn encode<D: Datatype>(data: &[D]) -> Cow<'_, [u8]> {
    if let Some(bytes) = D::as_wire(data) {
        return Cow::Borrowed(bytes);
    }
    let mut bytes = vec![0u8; data.len() * D::SIZE];
    for (value, out) in data.iter().zip(bytes.chunks_exact_mut(D::SIZE)) {
        value.write_le(out);
    }
    Cow::Owned(bytes)
}

/// Decode `bytes` into `out`. `bytes.len()` must be `out.len() * D::SIZE`.
pub(crate) fn decode_into<D: Datatype>(bytes: &[u8], out: &mut [D]) {
    debug_assert_eq!(bytes.len(), out.len() * D::SIZE);
    for (slot, raw) in out.iter_mut().zip(bytes.chunks_exact(D::SIZE)) {
        *slot = D::read_le(raw);
    }
}

/// Element-wise `acc[i] = op(acc[i], other[i])`.
pub(crate) fn combine_into<D: Datatype>(op: ReduceOp, acc: &mut [D], other: &[D]) {
    for (a, &b) in acc.iter_mut().zip(other) {
        *a = D::combine(op, *a, b);
    }
}
