use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    U8,
    U16,
    U32,
    I32,
}

impl DataType {
    /// Returns the size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
            DataType::I32 => 4,
        }
    }
}

pub trait Zero {
    fn zero() -> Self;
}

impl Zero for f32 {
    fn zero() -> Self {
        0.0
    }
}

impl Zero for f16 {
    fn zero() -> Self {
        Self::ZERO
    }
}

impl Zero for u8 {
    fn zero() -> Self {
        0
    }
}

impl Zero for u16 {
    fn zero() -> Self {
        0
    }
}

impl Zero for u32 {
    fn zero() -> Self {
        0
    }
}

impl Zero for i32 {
    fn zero() -> Self {
        0
    }
}

pub trait One {
    fn one() -> Self;
}

impl One for f32 {
    fn one() -> Self {
        1.0
    }
}

impl One for f16 {
    fn one() -> Self {
        Self::ONE
    }
}

impl One for u8 {
    fn one() -> Self {
        1
    }
}

impl One for u16 {
    fn one() -> Self {
        1
    }
}

impl One for u32 {
    fn one() -> Self {
        1
    }
}

impl One for i32 {
    fn one() -> Self {
        1
    }
}

pub trait Scalar:
    Sized + Zeroable + Pod + Zero + One + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
    const DATA_TYPE: DataType;

    /// Converts a sequential index into the scalar, wrapping or rounding as the type requires.
    fn from_index(index: usize) -> Self;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    #[inline]
    fn from_index(index: usize) -> Self {
        index as f32
    }
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;

    #[inline]
    fn from_index(index: usize) -> Self {
        f16::from_f32(index as f32)
    }
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;

    #[inline]
    fn from_index(index: usize) -> Self {
        index as u8
    }
}

impl Scalar for u16 {
    const DATA_TYPE: DataType = DataType::U16;

    #[inline]
    fn from_index(index: usize) -> Self {
        index as u16
    }
}

impl Scalar for u32 {
    const DATA_TYPE: DataType = DataType::U32;

    #[inline]
    fn from_index(index: usize) -> Self {
        index as u32
    }
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;

    #[inline]
    fn from_index(index: usize) -> Self {
        index as i32
    }
}
