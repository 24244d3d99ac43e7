//! Element type tags and typed value arrays.
//!
//! Every payload that crosses the wire is described by a [`DataType`] tag and carried as a
//! [`Values`] array. The tag decides how many bytes each element takes and, together with
//! the negotiated protocol version, whether the peer is allowed to send it at all.
use bincode::{Decode, Encode};

/// Element type of a data, error or dimension array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum DataType {
    #[default]
    Unknown = 0,
    Char = 1,
    Short = 2,
    Int = 3,
    UnsignedInt = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    UnsignedChar = 8,
    UnsignedShort = 9,
    UnsignedLong = 10,
    Long64 = 11,
    UnsignedLong64 = 12,
    Complex = 13,
    DComplex = 14,
    Undefined = 15,
    Vlen = 16,
    String = 17,
    Compound = 18,
    Opaque = 19,
    Enum = 20,
    String2 = 21,
    Void = 22,
    Capnp = 23,
}

impl DataType {
    const ALL: [DataType; 24] = [
        DataType::Unknown,
        DataType::Char,
        DataType::Short,
        DataType::Int,
        DataType::UnsignedInt,
        DataType::Long,
        DataType::Float,
        DataType::Double,
        DataType::UnsignedChar,
        DataType::UnsignedShort,
        DataType::UnsignedLong,
        DataType::Long64,
        DataType::UnsignedLong64,
        DataType::Complex,
        DataType::DComplex,
        DataType::Undefined,
        DataType::Vlen,
        DataType::String,
        DataType::Compound,
        DataType::Opaque,
        DataType::Enum,
        DataType::String2,
        DataType::Void,
        DataType::Capnp,
    ];

    /// Look up a tag received from the wire.
    pub fn from_tag(tag: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.tag() == tag)
    }

    pub fn tag(self) -> i32 {
        self as i32
    }

    /// First protocol version able to represent this type.
    pub fn introduced_in(self) -> u32 {
        match self {
            DataType::UnsignedChar
            | DataType::UnsignedShort
            | DataType::UnsignedLong
            | DataType::UnsignedLong64
            | DataType::Complex
            | DataType::DComplex => 3,
            DataType::Compound => 4,
            DataType::String => 6,
            _ => 1,
        }
    }

    pub fn supported_in(self, version: u32) -> bool {
        version >= self.introduced_in()
    }
}

/// Kind of structured payload attached to a compound block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpaqueType {
    #[default]
    Unknown,
    XmlDocument,
    Structures,
    XdrFile,
    XdrObject,
}

impl OpaqueType {
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(OpaqueType::Unknown),
            1 => Some(OpaqueType::XmlDocument),
            2 => Some(OpaqueType::Structures),
            3 => Some(OpaqueType::XdrFile),
            4 => Some(OpaqueType::XdrObject),
            _ => None,
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            OpaqueType::Unknown => 0,
            OpaqueType::XmlDocument => 1,
            OpaqueType::Structures => 2,
            OpaqueType::XdrFile => 3,
            OpaqueType::XdrObject => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Encode, Decode)]
pub struct Complex32 {
    pub real: f32,
    pub imaginary: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Encode, Decode)]
pub struct Complex64 {
    pub real: f64,
    pub imaginary: f64,
}

/// An owned, typed array. One variant per transmissible element type.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Char(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    UnsignedInt(Vec<u32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    UnsignedChar(Vec<u8>),
    UnsignedShort(Vec<u16>),
    UnsignedLong(Vec<u64>),
    Long64(Vec<i64>),
    UnsignedLong64(Vec<u64>),
    Complex(Vec<Complex32>),
    DComplex(Vec<Complex64>),
    String(Vec<u8>),
}

/// Expand `$body` once per [`Values`] variant with `$v` bound to the inner vector.
macro_rules! with_values {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            $crate::data::Values::Char($v) => $body,
            $crate::data::Values::Short($v) => $body,
            $crate::data::Values::Int($v) => $body,
            $crate::data::Values::UnsignedInt($v) => $body,
            $crate::data::Values::Long($v) => $body,
            $crate::data::Values::Float($v) => $body,
            $crate::data::Values::Double($v) => $body,
            $crate::data::Values::UnsignedChar($v) => $body,
            $crate::data::Values::UnsignedShort($v) => $body,
            $crate::data::Values::UnsignedLong($v) => $body,
            $crate::data::Values::Long64($v) => $body,
            $crate::data::Values::UnsignedLong64($v) => $body,
            $crate::data::Values::Complex($v) => $body,
            $crate::data::Values::DComplex($v) => $body,
            $crate::data::Values::String($v) => $body,
        }
    };
}
pub(crate) use with_values;

impl Values {
    pub fn data_type(&self) -> DataType {
        match self {
            Values::Char(_) => DataType::Char,
            Values::Short(_) => DataType::Short,
            Values::Int(_) => DataType::Int,
            Values::UnsignedInt(_) => DataType::UnsignedInt,
            Values::Long(_) => DataType::Long,
            Values::Float(_) => DataType::Float,
            Values::Double(_) => DataType::Double,
            Values::UnsignedChar(_) => DataType::UnsignedChar,
            Values::UnsignedShort(_) => DataType::UnsignedShort,
            Values::UnsignedLong(_) => DataType::UnsignedLong,
            Values::Long64(_) => DataType::Long64,
            Values::UnsignedLong64(_) => DataType::UnsignedLong64,
            Values::Complex(_) => DataType::Complex,
            Values::DComplex(_) => DataType::DComplex,
            Values::String(_) => DataType::String,
        }
    }

    pub fn len(&self) -> usize {
        with_values!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_lookup() {
        for t in DataType::ALL {
            assert_eq!(DataType::from_tag(t.tag()), Some(t));
        }
        assert_eq!(DataType::from_tag(99), None);
    }

    #[test]
    fn introduction_versions() {
        assert!(DataType::Double.supported_in(1));
        assert!(!DataType::UnsignedShort.supported_in(2));
        assert!(DataType::UnsignedShort.supported_in(3));
        assert!(!DataType::Compound.supported_in(3));
        assert!(!DataType::String.supported_in(5));
        assert!(DataType::String.supported_in(6));
    }

    #[test]
    fn values_report_their_type() {
        let v = Values::UnsignedShort(vec![1, 2, 3]);
        assert_eq!(v.data_type(), DataType::UnsignedShort);
        assert_eq!(v.len(), 3);
    }
}
