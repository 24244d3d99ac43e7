//! Dimension axis compression.
//!
//! Coordinate axes are very often regular: a start value and a constant step. Such an axis
//! is sent as two numbers instead of `dim_n` values. On receipt the axis is expanded again
//! from its [`Compression`] description.
//!
//! # Methods
//!
//! - `0` ([`Compression::Regular`]): `v[0] = dim0`, `v[i] = v[i-1] + diff`.
//! - `1` ([`Compression::Domains`]): run `r` contributes `sams[r]` values
//!   `offs[r] + k * ints[r]`.
//! - `2` ([`Compression::Offsets`]): `v[i] = offs[i]`.
//! - `3` ([`Compression::Broadcast`]): `v[i] = offs[0] + i * ints[0]` for `udoms` values.
//!
//! Only method 0 is ever produced by [`compress`]; the others are generated by servers.
//!
//! An axis keeps its [`Compression`] after expansion, so [`Dim::is_compressed`] means
//! "reconstructable", not "values missing".
use thiserror::Error;

use crate::data::{Compression, DataType, Dim, Values};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to allocate {0} dimension values")]
    AllocationFailed(usize),
    #[error("dimension type {0:?} cannot be expanded")]
    UnsupportedType(DataType),
    #[error("inconsistent domain arrays: {0}")]
    InconsistentDomains(String),
}

/// Largest integer magnitude an `f64` start or step holds without rounding.
const MAX_EXACT_INTEGER: f64 = (1u64 << 53) as f64;

trait Element: Copy + Sized {
    /// True when every successive difference equals the first one.
    fn is_regular(values: &[Self]) -> bool;
    /// True when the value survives a trip through `f64` unchanged.
    fn is_exact(self) -> bool;
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
    fn advance(self, diff: f64) -> Self;
    fn at(base: Self, k: usize, stride: Self) -> Self;
    fn slice(values: &Values) -> Option<&[Self]>;
}

macro_rules! float_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            fn is_regular(values: &[Self]) -> bool {
                let tolerance = 10.0 * <$t>::EPSILON as f64;
                let first = values[1] as f64 - values[0] as f64;
                values
                    .windows(2)
                    .all(|w| ((w[1] as f64 - w[0] as f64) - first).abs() <= tolerance)
            }

            fn is_exact(self) -> bool {
                true
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(v: f64) -> Self {
                v as $t
            }

            fn advance(self, diff: f64) -> Self {
                self + diff as $t
            }

            fn at(base: Self, k: usize, stride: Self) -> Self {
                base + k as $t * stride
            }

            fn slice(values: &Values) -> Option<&[Self]> {
                match values {
                    Values::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

macro_rules! int_element {
    ($t:ty, $variant:ident $(| $alias:ident)?) => {
        impl Element for $t {
            fn is_regular(values: &[Self]) -> bool {
                let first = values[1] as i128 - values[0] as i128;
                values.windows(2).all(|w| w[1] as i128 - w[0] as i128 == first)
            }

            fn is_exact(self) -> bool {
                (self as i128).unsigned_abs() <= MAX_EXACT_INTEGER as u128
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(v: f64) -> Self {
                v as $t
            }

            fn advance(self, diff: f64) -> Self {
                (self as i128).wrapping_add(diff.round() as i128) as $t
            }

            fn at(base: Self, k: usize, stride: Self) -> Self {
                base.wrapping_add((k as $t).wrapping_mul(stride))
            }

            fn slice(values: &Values) -> Option<&[Self]> {
                match values {
                    Values::$variant(v) $(| Values::$alias(v))? => Some(v),
                    _ => None,
                }
            }
        }
    };
}

float_element!(f32, Float);
float_element!(f64, Double);
int_element!(i8, Char);
int_element!(i16, Short);
int_element!(i32, Int);
int_element!(u8, UnsignedChar);
int_element!(u16, UnsignedShort);
int_element!(u32, UnsignedInt);
int_element!(i64, Long | Long64);
int_element!(u64, UnsignedLong | UnsignedLong64);

/// Replace a regular axis by its start and mean step.
///
/// Returns `true` if the axis is now described by a [`Compression`] (including when it
/// already was). Irregular axes, axes with fewer than two samples and complex or string
/// axes are left untouched and `false` is returned.
pub fn compress(dim: &mut Dim) -> bool {
    if dim.is_compressed() {
        return true;
    }
    let Some(values) = &dim.values else {
        return false;
    };
    match regular_run(values) {
        Some((dim0, diff)) => {
            dim.compression = Some(Compression::Regular { dim0, diff });
            true
        }
        None => false,
    }
}

/// Start value and mean step of `values`, if they form an arithmetic sequence.
///
/// 64-bit integer axes beyond 2^53 are not compressible: their start or step would be
/// rounded on the wire.
pub fn regular_run(values: &Values) -> Option<(f64, f64)> {
    match values {
        Values::Char(v) => regular(v),
        Values::Short(v) => regular(v),
        Values::Int(v) => regular(v),
        Values::UnsignedInt(v) => regular(v),
        Values::Long(v) | Values::Long64(v) => regular(v),
        Values::Float(v) => regular(v),
        Values::Double(v) => regular(v),
        Values::UnsignedChar(v) => regular(v),
        Values::UnsignedShort(v) => regular(v),
        Values::UnsignedLong(v) | Values::UnsignedLong64(v) => regular(v),
        Values::Complex(_) | Values::DComplex(_) | Values::String(_) => None,
    }
}

fn regular<T: Element>(values: &[T]) -> Option<(f64, f64)> {
    if values.len() < 2 || !T::is_regular(values) {
        return None;
    }
    let (first, last) = (values[0], values[values.len() - 1]);
    if !first.is_exact() || !last.is_exact() {
        return None;
    }
    let (first, last) = (first.to_f64(), last.to_f64());
    let diff = (last - first) / (values.len() - 1) as f64;
    if diff.abs() > MAX_EXACT_INTEGER {
        return None;
    }
    Some((first, diff))
}

/// Rebuild the coordinate values of a compressed axis.
///
/// A no-op for uncompressed axes, empty axes and axes whose values are already present.
pub fn decompress(dim: &mut Dim) -> Result<(), CodecError> {
    let Some(compression) = &dim.compression else {
        return Ok(());
    };
    let n = dim.dim_n as usize;
    if n == 0 || dim.values.as_ref().is_some_and(|v| v.len() == n) {
        return Ok(());
    }

    let values = match dim.data_type {
        DataType::Char => Values::Char(expand(compression, n)?),
        DataType::Short => Values::Short(expand(compression, n)?),
        DataType::Int => Values::Int(expand(compression, n)?),
        DataType::UnsignedInt => Values::UnsignedInt(expand(compression, n)?),
        DataType::Long => Values::Long(expand(compression, n)?),
        DataType::Long64 => Values::Long64(expand(compression, n)?),
        DataType::Float => Values::Float(expand(compression, n)?),
        DataType::Double => Values::Double(expand(compression, n)?),
        DataType::UnsignedChar => Values::UnsignedChar(expand(compression, n)?),
        DataType::UnsignedShort => Values::UnsignedShort(expand(compression, n)?),
        DataType::UnsignedLong => Values::UnsignedLong(expand(compression, n)?),
        DataType::UnsignedLong64 => Values::UnsignedLong64(expand(compression, n)?),
        other => return Err(CodecError::UnsupportedType(other)),
    };
    dim.values = Some(values);
    Ok(())
}

fn typed<'a, T: Element>(values: &'a Values, what: &str) -> Result<&'a [T], CodecError> {
    T::slice(values).ok_or_else(|| {
        CodecError::InconsistentDomains(format!(
            "{what} array is {:?}, not the dimension type",
            values.data_type()
        ))
    })
}

fn expand<T: Element>(compression: &Compression, n: usize) -> Result<Vec<T>, CodecError> {
    let mut out: Vec<T> = Vec::new();
    out.try_reserve_exact(n)
        .map_err(|_| CodecError::AllocationFailed(n))?;

    match compression {
        Compression::Regular { dim0, diff } => {
            let mut current = T::from_f64(*dim0);
            out.push(current);
            for _ in 1..n {
                current = current.advance(*diff);
                out.push(current);
            }
        }
        Compression::Domains { sams, offs, ints } => {
            let offs = typed::<T>(offs, "offset")?;
            let ints = typed::<T>(ints, "stride")?;
            if offs.len() != sams.len() || ints.len() != sams.len() {
                return Err(CodecError::InconsistentDomains(format!(
                    "{} runs but {} offsets and {} strides",
                    sams.len(),
                    offs.len(),
                    ints.len()
                )));
            }
            let total: i64 = sams.iter().map(|&s| s as i64).sum();
            if sams.iter().any(|&s| s < 0) || total != n as i64 {
                return Err(CodecError::InconsistentDomains(format!(
                    "runs hold {total} samples, dimension has {n}"
                )));
            }
            for (r, &count) in sams.iter().enumerate() {
                for k in 0..count as usize {
                    out.push(T::at(offs[r], k, ints[r]));
                }
            }
        }
        Compression::Offsets { offs } => {
            let offs = typed::<T>(offs, "offset")?;
            if offs.len() != n {
                return Err(CodecError::InconsistentDomains(format!(
                    "{} offsets for {n} values",
                    offs.len()
                )));
            }
            out.extend_from_slice(offs);
        }
        Compression::Broadcast { udoms, offs, ints } => {
            let offs = typed::<T>(offs, "offset")?;
            let ints = typed::<T>(ints, "stride")?;
            if *udoms as usize != n || offs.is_empty() || ints.is_empty() {
                return Err(CodecError::InconsistentDomains(format!(
                    "{udoms} runs for {n} values"
                )));
            }
            for i in 0..n {
                out.push(T::at(offs[0], i, ints[0]));
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_double_axis_round_trips() {
        let original: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let mut dim = Dim::new(Values::Double(original.clone()));

        assert!(compress(&mut dim));
        assert_eq!(
            dim.compression,
            Some(Compression::Regular {
                dim0: 0.0,
                diff: 1.0
            })
        );

        dim.values = None;
        decompress(&mut dim).unwrap();
        assert_eq!(dim.values, Some(Values::Double(original)));
        assert!(dim.is_compressed());
    }

    #[test]
    fn descending_integers_round_trip() {
        let original = vec![50, 40, 30, 20, 10, 0, -10];
        let mut dim = Dim::new(Values::Int(original.clone()));

        assert!(compress(&mut dim));
        dim.values = None;
        decompress(&mut dim).unwrap();
        assert_eq!(dim.values, Some(Values::Int(original)));
    }

    #[test]
    fn fractional_float_step_within_epsilon() {
        let original: Vec<f32> = (0..8).map(|i| i as f32 * 0.25).collect();
        let mut dim = Dim::new(Values::Float(original.clone()));

        assert!(compress(&mut dim));
        dim.values = None;
        decompress(&mut dim).unwrap();
        assert_eq!(dim.values, Some(Values::Float(original)));
    }

    #[test]
    fn irregular_axis_is_untouched() {
        let original = vec![0.0, 1.0, 2.0, 3.5, 4.5];
        let mut dim = Dim::new(Values::Double(original.clone()));

        assert!(!compress(&mut dim));
        assert!(!dim.is_compressed());
        assert_eq!(dim.values, Some(Values::Double(original)));
    }

    #[test]
    fn large_64_bit_axes_stay_uncompressed() {
        let original: Vec<i64> = (0..10).map(|i| 1_700_000_000_000_000_001 + i).collect();
        let mut dim = Dim::new(Values::Long64(original.clone()));
        assert!(!compress(&mut dim));
        assert_eq!(dim.values, Some(Values::Long64(original)));

        let mut wide = Dim::new(Values::UnsignedLong64(vec![0, u64::MAX / 2]));
        assert!(!compress(&mut wide));

        let small: Vec<i64> = (0..5).map(|i| -(1 << 40) + i * 3).collect();
        let mut dim = Dim::new(Values::Long64(small.clone()));
        assert!(compress(&mut dim));
        dim.values = None;
        decompress(&mut dim).unwrap();
        assert_eq!(dim.values, Some(Values::Long64(small)));
    }

    #[test]
    fn short_and_complex_axes_are_refused() {
        let mut single = Dim::new(Values::Double(vec![4.0]));
        assert!(!compress(&mut single));

        let mut complex = Dim::new(Values::Complex(vec![Default::default(); 4]));
        assert!(!compress(&mut complex));
    }

    #[test]
    fn decompress_twice_keeps_buffer() {
        let mut dim = Dim::compressed(
            DataType::Double,
            10,
            Compression::Regular {
                dim0: 0.0,
                diff: 1.0,
            },
        );
        decompress(&mut dim).unwrap();
        let first = dim.values.clone();
        let ptr = match &dim.values {
            Some(Values::Double(v)) => v.as_ptr(),
            other => panic!("unexpected values {other:?}"),
        };

        decompress(&mut dim).unwrap();
        let again = match &dim.values {
            Some(Values::Double(v)) => v.as_ptr(),
            other => panic!("unexpected values {other:?}"),
        };
        assert_eq!(ptr, again);
        assert_eq!(dim.values, first);
        assert!(dim.is_compressed());
    }

    #[test]
    fn domain_methods_expand() {
        let mut domains = Dim::compressed(
            DataType::Int,
            5,
            Compression::Domains {
                sams: vec![3, 2],
                offs: Values::Int(vec![0, 100]),
                ints: Values::Int(vec![1, 10]),
            },
        );
        decompress(&mut domains).unwrap();
        assert_eq!(domains.values, Some(Values::Int(vec![0, 1, 2, 100, 110])));

        let mut offsets = Dim::compressed(
            DataType::Float,
            3,
            Compression::Offsets {
                offs: Values::Float(vec![1.5, -2.0, 7.0]),
            },
        );
        decompress(&mut offsets).unwrap();
        assert_eq!(offsets.values, Some(Values::Float(vec![1.5, -2.0, 7.0])));

        let mut broadcast = Dim::compressed(
            DataType::UnsignedLong64,
            4,
            Compression::Broadcast {
                udoms: 4,
                offs: Values::UnsignedLong64(vec![5]),
                ints: Values::UnsignedLong64(vec![3]),
            },
        );
        decompress(&mut broadcast).unwrap();
        assert_eq!(
            broadcast.values,
            Some(Values::UnsignedLong64(vec![5, 8, 11, 14]))
        );
    }

    #[test]
    fn mismatched_domains_are_reported() {
        let mut dim = Dim::compressed(
            DataType::Int,
            6,
            Compression::Domains {
                sams: vec![3, 2],
                offs: Values::Int(vec![0, 100]),
                ints: Values::Int(vec![1, 10]),
            },
        );
        assert!(matches!(
            decompress(&mut dim),
            Err(CodecError::InconsistentDomains(_))
        ));
        assert_eq!(dim.values, None);
    }

    #[test]
    fn unsupported_type_and_empty_axis() {
        let mut complex = Dim::compressed(
            DataType::Complex,
            2,
            Compression::Regular {
                dim0: 0.0,
                diff: 1.0,
            },
        );
        assert_eq!(
            decompress(&mut complex),
            Err(CodecError::UnsupportedType(DataType::Complex))
        );

        let mut empty = Dim::compressed(
            DataType::Double,
            0,
            Compression::Regular {
                dim0: 0.0,
                diff: 1.0,
            },
        );
        decompress(&mut empty).unwrap();
        assert_eq!(empty.values, None);
    }
}
