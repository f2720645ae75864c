use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Storage order of a layout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Order {
    /// The last axis is contiguous.
    #[default]
    RowMajor,
    /// The first axis is contiguous.
    ColumnMajor,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Number of elements covered by the shape.
    #[inline]
    pub fn size(&self) -> usize {
        self.iter().product()
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.to_vec())
    }
}

/// Maps a logical multi-dimensional index onto a linear element offset.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{shape}:{strides}")]
pub struct Layout {
    shape: Shape,
    strides: Shape,
}

impl Layout {
    /// Creates a row-major layout from a shape.
    #[inline]
    pub fn from_shape(shape: impl Into<Shape>) -> Self {
        Self::with_order(shape, Order::RowMajor)
    }

    /// Creates a layout from a shape, with strides following the given storage order.
    pub fn with_order(shape: impl Into<Shape>, order: Order) -> Self {
        let shape: Shape = shape.into();
        let mut strides = vec![0; shape.len()];
        let mut stride = 1;
        match order {
            Order::RowMajor => {
                for (axis, &dim) in shape.iter().enumerate().rev() {
                    strides[axis] = stride;
                    stride *= dim;
                }
            }
            Order::ColumnMajor => {
                for (axis, &dim) in shape.iter().enumerate() {
                    strides[axis] = stride;
                    stride *= dim;
                }
            }
        }
        let strides = strides.into();
        Self { shape, strides }
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn strides(&self) -> &Shape {
        &self.strides
    }

    /// Number of axes.
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Linear offset of a logical index. Returns `None` if the index is out of bounds.
    pub fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.len() {
            return None;
        }
        itertools::izip!(index, self.shape.iter(), self.strides.iter())
            .try_fold(0, |offset, (&x, &dim, &stride)| {
                (x < dim).then_some(offset + x * stride)
            })
    }

    /// Offsets of all elements, visited in logical row-major order.
    #[inline]
    pub fn offsets(&self) -> Offsets<'_> {
        let index = vec![0; self.len()];
        let remaining = self.size();
        Offsets {
            layout: self,
            index,
            remaining,
        }
    }
}

/// Iterator over the element offsets of a [`Layout`] in logical row-major order.
#[derive(Debug, Clone)]
pub struct Offsets<'a> {
    layout: &'a Layout,
    index: Vec<usize>,
    remaining: usize,
}

impl Iterator for Offsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let offset = self
            .index
            .iter()
            .zip_eq(self.layout.strides.iter())
            .map(|(x, stride)| x * stride)
            .sum();

        for (x, &dim) in self.index.iter_mut().zip(self.layout.shape.iter()).rev() {
            *x += 1;
            if *x < dim {
                break;
            }
            *x = 0;
        }
        Some(offset)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Offsets<'_> {}

pub trait IntoLayout {
    fn into_layout(self) -> Layout;
}

impl IntoLayout for Layout {
    #[inline]
    fn into_layout(self) -> Layout {
        self
    }
}

impl IntoLayout for Shape {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout::from_shape(self)
    }
}

impl<const N: usize> IntoLayout for [usize; N] {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout::from_shape(self)
    }
}

impl IntoLayout for usize {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout::from_shape([self])
    }
}
