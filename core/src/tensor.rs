//! Tensor representation exchanged with the engine.
//!
//! A [`Tensor`] is an element type, a shape and the raw little-endian element
//! bytes. Construction always checks that the byte length matches the
//! shape, so every tensor that exists has already passed the size invariant
//! the engine relies on.
//!
//! # Wire format
//!
//! Tensors cross the engine boundary (and the transport) in a self-describing
//! layout:
//!
//! ```text
//! u32 LE element type code | u64 LE rank | rank x i64 LE dims | raw data
//! ```

use ndarray::{ArrayD, IxDyn};
use std::fmt;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

const NUMERICAL_INTEGER_SIGNED: u32 = 0x11;
const NUMERICAL_INTEGER_UNSIGNED: u32 = 0x12;
const NUMERICAL_BOOLEAN: u32 = 0x13;
const NUMERICAL_FLOAT_IEEE: u32 = 0x21;
const NUMERICAL_FLOAT_BRAIN: u32 = 0x22;
const NUMERICAL_FLOAT_COMPLEX: u32 = 0x23;

const fn type_code(numerical: u32, bits: u32) -> u32 {
    (numerical << 24) | bits
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Pred,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F16,
    Bf16,
    F32,
    F64,
    C64,
    C128,
}

impl ElementType {
    const ALL: [ElementType; 15] = [
        Self::Pred,
        Self::S8,
        Self::S16,
        Self::S32,
        Self::S64,
        Self::U8,
        Self::U16,
        Self::U32,
        Self::U64,
        Self::F16,
        Self::Bf16,
        Self::F32,
        Self::F64,
        Self::C64,
        Self::C128,
    ];

    /// Size of one element in bytes.
    pub fn byte_size(self) -> usize {
        match self {
            Self::Pred | Self::S8 | Self::U8 => 1,
            Self::S16 | Self::U16 | Self::F16 | Self::Bf16 => 2,
            Self::S32 | Self::U32 | Self::F32 => 4,
            Self::S64 | Self::U64 | Self::F64 | Self::C64 => 8,
            Self::C128 => 16,
        }
    }

    /// Engine element type code.
    pub fn code(self) -> u32 {
        let bits = (self.byte_size() * 8) as u32;
        let numerical = match self {
            Self::Pred => NUMERICAL_BOOLEAN,
            Self::S8 | Self::S16 | Self::S32 | Self::S64 => NUMERICAL_INTEGER_SIGNED,
            Self::U8 | Self::U16 | Self::U32 | Self::U64 => NUMERICAL_INTEGER_UNSIGNED,
            Self::F16 | Self::F32 | Self::F64 => NUMERICAL_FLOAT_IEEE,
            Self::Bf16 => NUMERICAL_FLOAT_BRAIN,
            Self::C64 | Self::C128 => NUMERICAL_FLOAT_COMPLEX,
        };
        type_code(numerical, bits)
    }

    /// Look up an element type by engine code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

impl FromStr for ElementType {
    type Err = BridgeError;

    /// Parse an Nx type name like "f32", "s8", "bf16" or "pred".
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.to_string() == s)
            .ok_or_else(|| BridgeError::decode(format!("Unknown element type: {}", s)))
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pred => "pred",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::C64 => "c64",
            Self::C128 => "c128",
        };
        f.write_str(name)
    }
}

/// Rust scalar types with a direct tensor element representation.
pub trait Element: Copy {
    const ELEMENT_TYPE: ElementType;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const ELEMENT_TYPE: ElementType = ElementType::$variant;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_element! {
    i8 => S8,
    i16 => S16,
    i32 => S32,
    i64 => S64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

/// Byte length implied by an element type and shape, or `None` on overflow.
pub fn implied_byte_len(element_type: ElementType, shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .try_fold(element_type.byte_size(), |acc, &dim| acc.checked_mul(dim))
}

/// A shaped, typed buffer of raw element bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    element_type: ElementType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Create a tensor from raw bytes, checking the size invariant.
    pub fn new(element_type: ElementType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = implied_byte_len(element_type, &shape).ok_or_else(|| {
            BridgeError::decode(format!("Shape {:?} overflows the addressable size", shape))
        })?;
        if data.len() != expected {
            return Err(BridgeError::decode(format!(
                "{} tensor of shape {:?} needs {} bytes, got {}",
                element_type,
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            element_type,
            shape,
            data,
        })
    }

    /// Create a tensor from typed values.
    pub fn from_values<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * T::ELEMENT_TYPE.byte_size());
        for &v in values {
            v.write_le(&mut data);
        }
        Self::new(T::ELEMENT_TYPE, shape, data)
    }

    /// Create a tensor from an ndarray.
    pub fn from_array<T: Element>(array: &ArrayD<T>) -> Result<Self> {
        let values: Vec<T> = array.iter().copied().collect();
        Self::from_values(array.shape().to_vec(), &values)
    }

    /// Element type of the tensor.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw element bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the tensor, returning its raw bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Number of raw data bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the elements as typed values.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.element_type != T::ELEMENT_TYPE {
            return Err(BridgeError::decode(format!(
                "Cannot read {} tensor as {}",
                self.element_type,
                T::ELEMENT_TYPE
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.element_type.byte_size())
            .map(T::read_le)
            .collect())
    }

    /// Read the elements as a dynamic-dimensional array.
    pub fn to_array<T: Element>(&self) -> Result<ArrayD<T>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.to_vec()?)
            .map_err(|e| BridgeError::decode(format!("Array shape error: {}", e)))
    }

    /// Widen numeric elements to f64, for display.
    ///
    /// Returns `None` for element types without a direct scalar mapping
    /// (pred, f16, bf16, complex).
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        fn widen<T: Element>(t: &Tensor) -> Option<Vec<f64>> {
            t.to_vec::<T>()
                .ok()
                .map(|v| v.into_iter().map(Element::to_f64).collect())
        }
        match self.element_type {
            ElementType::S8 => widen::<i8>(self),
            ElementType::S16 => widen::<i16>(self),
            ElementType::S32 => widen::<i32>(self),
            ElementType::S64 => widen::<i64>(self),
            ElementType::U8 => widen::<u8>(self),
            ElementType::U16 => widen::<u16>(self),
            ElementType::U32 => widen::<u32>(self),
            ElementType::U64 => widen::<u64>(self),
            ElementType::F32 => widen::<f32>(self),
            ElementType::F64 => widen::<f64>(self),
            _ => None,
        }
    }

    /// Narrow f64 values to the given element type.
    ///
    /// Integer targets saturate. `pred` stores nonzero values as 1.
    pub fn from_f64_values(
        element_type: ElementType,
        shape: Vec<usize>,
        values: &[f64],
    ) -> Result<Self> {
        fn narrow<T: Element>(shape: Vec<usize>, values: &[f64]) -> Result<Tensor> {
            let typed: Vec<T> = values.iter().map(|&v| T::from_f64(v)).collect();
            Tensor::from_values(shape, &typed)
        }
        match element_type {
            ElementType::Pred => {
                let data = values.iter().map(|&v| u8::from(v != 0.0)).collect();
                Self::new(ElementType::Pred, shape, data)
            }
            ElementType::S8 => narrow::<i8>(shape, values),
            ElementType::S16 => narrow::<i16>(shape, values),
            ElementType::S32 => narrow::<i32>(shape, values),
            ElementType::S64 => narrow::<i64>(shape, values),
            ElementType::U8 => narrow::<u8>(shape, values),
            ElementType::U16 => narrow::<u16>(shape, values),
            ElementType::U32 => narrow::<u32>(shape, values),
            ElementType::U64 => narrow::<u64>(shape, values),
            ElementType::F32 => narrow::<f32>(shape, values),
            ElementType::F64 => narrow::<f64>(shape, values),
            other => Err(BridgeError::decode(format!(
                "Cannot build {} tensor from numeric values",
                other
            ))),
        }
    }

    /// Serialize to the self-describing wire layout.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.shape.len() * 8 + self.data.len());
        out.extend_from_slice(&self.element_type.code().to_le_bytes());
        out.extend_from_slice(&(self.shape.len() as u64).to_le_bytes());
        for &dim in &self.shape {
            out.extend_from_slice(&(dim as i64).to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse the self-describing wire layout.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader { bytes, offset: 0 };

        let code = u32::from_le_bytes(reader.take_array("element type")?);
        let element_type = ElementType::from_code(code).ok_or_else(|| {
            BridgeError::decode(format!("Unknown element type code: {:#010x}", code))
        })?;

        let rank = u64::from_le_bytes(reader.take_array("rank")?);
        let max_rank = (reader.remaining() / 8) as u64;
        if rank > max_rank {
            return Err(BridgeError::decode(format!(
                "Rank {} does not fit in a {}-byte payload",
                rank,
                bytes.len()
            )));
        }

        let mut shape = Vec::with_capacity(rank as usize);
        for _ in 0..rank {
            let dim = i64::from_le_bytes(reader.take_array("dimension")?);
            let dim = usize::try_from(dim)
                .map_err(|_| BridgeError::decode(format!("Negative dimension: {}", dim)))?;
            shape.push(dim);
        }

        Self::new(element_type, shape, reader.rest().to_vec())
    }
}

struct WireReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    fn take_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let end = self.offset + N;
        let slice = self.bytes.get(self.offset..end).ok_or_else(|| {
            BridgeError::decode(format!(
                "Truncated tensor payload: missing {} at byte {}",
                field, self.offset
            ))
        })?;
        self.offset = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.offset..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_names() {
        for t in ElementType::ALL {
            assert_eq!(t.to_string().parse::<ElementType>().unwrap(), t);
        }
        assert_eq!(" F32 ".parse::<ElementType>().unwrap(), ElementType::F32);
        assert!("f128".parse::<ElementType>().is_err());
    }

    #[test]
    fn test_element_type_codes() {
        assert_eq!(ElementType::F32.code(), 0x2100_0020);
        assert_eq!(ElementType::S32.code(), 0x1100_0020);
        assert_eq!(ElementType::U8.code(), 0x1200_0008);
        assert_eq!(ElementType::Bf16.code(), 0x2200_0010);
        assert_eq!(ElementType::from_code(0x2300_0040), Some(ElementType::C64));
        assert_eq!(ElementType::from_code(0), None);
    }

    #[test]
    fn test_size_invariant() {
        assert!(Tensor::new(ElementType::F32, vec![2, 2], vec![0; 16]).is_ok());
        assert!(Tensor::new(ElementType::F32, vec![2, 2], vec![0; 15]).is_err());
        assert!(Tensor::new(ElementType::U8, vec![0, 5], vec![]).is_ok());
        assert!(Tensor::new(ElementType::F64, vec![usize::MAX, 2], vec![]).is_err());

        let scalar = Tensor::new(ElementType::S64, vec![], vec![0; 8]).unwrap();
        assert_eq!(scalar.len(), 1);
    }

    #[test]
    fn test_typed_access() {
        let t = Tensor::from_values(vec![4], &[-1i32, 2, -3, 4]).unwrap();
        assert_eq!(t.element_type(), ElementType::S32);
        assert_eq!(t.to_vec::<i32>().unwrap(), vec![-1, 2, -3, 4]);
        assert!(t.to_vec::<f32>().is_err());
        assert_eq!(t.to_f64_vec().unwrap(), vec![-1.0, 2.0, -3.0, 4.0]);

        let arr = t.to_array::<i32>().unwrap();
        assert_eq!(arr.shape(), &[4]);
    }

    #[test]
    fn test_from_f64_values() {
        let t = Tensor::from_f64_values(ElementType::U8, vec![3], &[1.0, 300.0, -5.0]).unwrap();
        assert_eq!(t.to_vec::<u8>().unwrap(), vec![1, 255, 0]);

        let p = Tensor::from_f64_values(ElementType::Pred, vec![2], &[0.0, 0.5]).unwrap();
        assert_eq!(p.data(), &[0, 1]);

        assert!(Tensor::from_f64_values(ElementType::F32, vec![2], &[1.0]).is_err());
        assert!(Tensor::from_f64_values(ElementType::Bf16, vec![1], &[1.0]).is_err());
    }

    #[test]
    fn test_wire_layout() {
        let t = Tensor::from_values(vec![1, 2], &[1.5f32, -2.0]).unwrap();
        let wire = t.serialize();
        assert_eq!(wire.len(), 4 + 8 + 2 * 8 + 8);
        assert_eq!(&wire[0..4], &0x2100_0020u32.to_le_bytes());
        assert_eq!(&wire[4..12], &2u64.to_le_bytes());
        assert_eq!(Tensor::deserialize(&wire).unwrap(), t);
    }

    #[test]
    fn test_deserialize_rejects_malformed() {
        let t = Tensor::from_values(vec![3], &[1u8, 2, 3]).unwrap();
        let wire = t.serialize();

        // Truncated header.
        assert!(Tensor::deserialize(&wire[..6]).is_err());
        // Missing one data byte.
        assert!(Tensor::deserialize(&wire[..wire.len() - 1]).is_err());
        // Trailing garbage.
        let mut long = wire.clone();
        long.push(0);
        assert!(Tensor::deserialize(&long).is_err());
        // Absurd rank.
        let mut bad_rank = wire.clone();
        bad_rank[4..12].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(Tensor::deserialize(&bad_rank).is_err());
        // Negative dimension.
        let mut negative = wire;
        negative[12..20].copy_from_slice(&(-3i64).to_le_bytes());
        assert!(Tensor::deserialize(&negative).is_err());
    }
}
