use std::fmt;
use std::hash::{Hash, Hasher};

use itertools::{Itertools, izip};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::DescError;

/// A single extent. [`UNDEFINED_DIM`] means "not known at this time".
pub type Dim = usize;

/// Sentinel for an extent that is unknown until runtime. Doubles as the
/// sentinel for not-yet-placed strides and offsets in memory descriptors.
pub const UNDEFINED_DIM: Dim = Dim::MAX;

/// Renders a dimension, `?` when unknown.
pub fn dim_to_string(dim: Dim) -> String {
    if dim == UNDEFINED_DIM {
        "?".to_string()
    } else {
        dim.to_string()
    }
}

/// Renders a dims sequence as `{2, ?, 4}`.
pub fn dims_to_string(dims: &[Dim]) -> String {
    format!("{{{}}}", dims.iter().map(|&d| dim_to_string(d)).format(", "))
}

/// Integer ceiling division. The divisor must be non-zero.
#[inline]
pub(crate) const fn div_up(value: Dim, divisor: Dim) -> Dim {
    value.div_ceil(divisor)
}

/// A tensor's rank and per-axis bounds.
///
/// A static shape has equal lower and upper bounds on every axis:
/// ```text
/// min_dims = [2, 3, 4, 5]    max_dims = [2, 3, 4, 5]    dims = [2, 3, 4, 5]
/// ```
/// A dynamic shape carries a range on at least one axis, collapsed to
/// [`UNDEFINED_DIM`] in the effective dims:
/// ```text
/// min_dims = [2, 3, 1, 1]    max_dims = [2, 3, 6, 6]    dims = [2, 3, ?, ?]
/// ```
/// Shapes are immutable; transformations produce new values.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Shape {
    min_dims: Vec<Dim>,
    max_dims: Vec<Dim>,
    dims: Vec<Dim>,
    is_static: bool,
}

impl Shape {
    /// Creates a static shape where every axis is pinned to `dims`.
    pub fn from_dims(dims: impl Into<Vec<Dim>>) -> Self {
        let min_dims: Vec<Dim> = dims.into();
        let max_dims = min_dims.clone();
        let dims = min_dims.clone();
        Self {
            min_dims,
            max_dims,
            dims,
            is_static: true,
        }
    }

    /// Creates a shape from per-axis `(min, max)` bounds. Any axis where the
    /// bounds differ becomes [`UNDEFINED_DIM`] in the effective dims.
    ///
    /// # Panics
    /// Panics if the bound sequences differ in length.
    pub fn from_bounds(min_dims: impl Into<Vec<Dim>>, max_dims: impl Into<Vec<Dim>>) -> Self {
        let min_dims: Vec<Dim> = min_dims.into();
        let max_dims: Vec<Dim> = max_dims.into();
        assert_eq!(
            min_dims.len(),
            max_dims.len(),
            "min and max bounds must have one entry per axis"
        );
        let dims = izip!(&min_dims, &max_dims)
            .map(|(&min, &max)| if min == max { min } else { UNDEFINED_DIM })
            .collect_vec();
        let is_static = !dims.contains(&UNDEFINED_DIM);
        Self {
            min_dims,
            max_dims,
            dims,
            is_static,
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.min_dims.len()
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Lower bound per axis.
    #[inline]
    pub fn min_dims(&self) -> &[Dim] {
        &self.min_dims
    }

    /// Upper bound per axis.
    #[inline]
    pub fn max_dims(&self) -> &[Dim] {
        &self.max_dims
    }

    /// Effective dims: the exact extent where pinned, [`UNDEFINED_DIM`] where
    /// the axis is still ranged.
    #[inline]
    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    /// Returns the exact dims, or [`DescError::NotStatic`] for a dynamic shape.
    pub fn static_dims(&self) -> Result<&[Dim], DescError> {
        if !self.is_static {
            return Err(DescError::NotStatic);
        }
        Ok(&self.min_dims)
    }

    /// Total element count of a static shape.
    pub fn element_count(&self) -> Result<usize, DescError> {
        Ok(self.static_dims()?.iter().product())
    }

    /// Checks whether concrete `dims` fall inside this shape's bounds: the
    /// rank must match, every pinned axis must match exactly, and every
    /// ranged axis must lie within `[min, max]`.
    pub fn is_compatible(&self, dims: &[Dim]) -> bool {
        if self.rank() != dims.len() {
            return false;
        }
        izip!(&self.dims, &self.min_dims, &self.max_dims, dims).all(
            |(&dim, &min, &max, &candidate)| {
                (dim == candidate || dim == UNDEFINED_DIM) && min <= candidate && candidate <= max
            },
        )
    }
}

/// Equality is defined over the bounds only.
impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.min_dims == other.min_dims && self.max_dims == other.max_dims
    }
}

impl Eq for Shape {}

impl Hash for Shape {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.min_dims.hash(state);
        self.max_dims.hash(state);
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes = izip!(&self.dims, &self.min_dims, &self.max_dims)
            .map(|(&dim, &min, &max)| {
                if dim == UNDEFINED_DIM {
                    format!("{} - {}", dim_to_string(min), dim_to_string(max))
                } else {
                    dim.to_string()
                }
            })
            .format(", ");
        write!(f, "{{{axes}}}")
    }
}

impl From<Vec<Dim>> for Shape {
    #[inline]
    fn from(dims: Vec<Dim>) -> Self {
        Self::from_dims(dims)
    }
}

impl<const N: usize> From<[Dim; N]> for Shape {
    #[inline]
    fn from(dims: [Dim; N]) -> Self {
        Self::from_dims(dims.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_shape() {
        let shape = Shape::from_dims([2, 3, 4, 5]);
        assert!(shape.is_static());
        assert_eq!(shape.rank(), 4);
        assert_eq!(shape.static_dims().unwrap(), &[2, 3, 4, 5]);
        assert_eq!(shape.element_count().unwrap(), 120);
        assert_eq!(shape.to_string(), "{2, 3, 4, 5}");
    }

    #[test]
    fn test_dynamic_shape() {
        let shape = Shape::from_bounds(vec![2, 3, 1, 1], vec![2, 3, 6, 6]);
        assert!(!shape.is_static());
        assert_eq!(shape.dims(), &[2, 3, UNDEFINED_DIM, UNDEFINED_DIM]);
        assert!(matches!(shape.static_dims(), Err(DescError::NotStatic)));
        assert_eq!(shape.to_string(), "{2, 3, 1 - 6, 1 - 6}");
    }

    #[test]
    fn test_bounds_collapse_to_static() {
        let shape = Shape::from_bounds(vec![4, 4], vec![4, 4]);
        assert!(shape.is_static());
        assert_eq!(shape.dims(), &[4, 4]);
    }

    #[test]
    fn test_is_compatible() {
        let shape = Shape::from_bounds(vec![2, 1, 1], vec![2, 8, 8]);
        assert!(shape.is_compatible(&[2, 4, 8]));
        assert!(shape.is_compatible(&[2, 1, 1]));
        assert!(!shape.is_compatible(&[3, 4, 8]));
        assert!(!shape.is_compatible(&[2, 9, 8]));
        assert!(!shape.is_compatible(&[2, 4]));
    }

    #[test]
    fn test_equality_over_bounds() {
        let lhs = Shape::from_bounds(vec![1, 1], vec![4, 4]);
        let rhs = Shape::from_bounds(vec![1, 1], vec![4, 4]);
        assert_eq!(lhs, rhs);
        assert_ne!(lhs, Shape::from_dims([4, 4]));
    }

    #[test]
    fn test_unbounded_axis_display() {
        let shape = Shape::from_bounds(vec![1], vec![UNDEFINED_DIM]);
        assert_eq!(shape.to_string(), "{1 - ?}");
    }
}
