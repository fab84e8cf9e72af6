use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use half::{bf16, f16};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element type of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    BF16,
    I32,
    I8,
    U8,
    /// 1-bit packed type. Occupies one byte per element for size accounting.
    Bin,
}

impl DataType {
    /// Returns the size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::BF16 => 2,
            DataType::I32 => 4,
            DataType::I8 => 1,
            DataType::U8 => 1,
            DataType::Bin => 1,
        }
    }

    /// Returns number of logical elements packed in this data type.
    pub const fn count(self) -> usize {
        match self {
            DataType::Bin => 8,
            _ => 1,
        }
    }
}

pub trait Scalar: Sized + Zeroable + Pod + Send + Sync {
    const DATA_TYPE: DataType;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for bf16 {
    const DATA_TYPE: DataType = DataType::BF16;
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

impl Scalar for i8 {
    const DATA_TYPE: DataType = DataType::I8;
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_size() {
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::F16.size(), 2);
        assert_eq!(DataType::BF16.size(), 2);
        assert_eq!(DataType::Bin.size(), 1);
        assert_eq!(<f16 as Scalar>::DATA_TYPE, DataType::F16);
    }
}
