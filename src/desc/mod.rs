//! Memory layout descriptors.
//!
//! A descriptor answers, for one tensor, how its logical elements are
//! arranged in a flat buffer: axis order, blocking, strides, padding and
//! base offset. Two concrete kinds exist behind the closed [`MemoryDesc`]
//! variant:
//!
//! 1. [`BlockedDesc`] — a self-contained value built directly from explicit
//!    block/order/stride parameters, or defaulted to dense row-major.
//! 2. [`NativeDesc`] — a wrapper over the native compute library's opaque
//!    blocking structure, deriving its blocked fields lazily.
//!
//! Shared logic over the common field set (masked compatibility, padded
//! element counting, offset arithmetic) lives here as free functions over
//! the [`BlockedLayout`] getter trait, invoked by each variant.

use derive_more::{Display, From};
use itertools::izip;

use crate::{
    error::DescError,
    num::DataType,
    shape::{Dim, Shape, UNDEFINED_DIM},
};

pub mod blocked;
pub mod convert;
pub mod native;

pub use blocked::BlockedDesc;
pub use native::{FormatTag, NativeDesc};

/// Sentinel returned by size queries when the descriptor is not fully
/// defined yet.
pub const UNDEFINED_SIZE: usize = usize::MAX;

/// Well-known layout families a descriptor can be matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum LayoutType {
    /// General per-channel (channels-last) format.
    Nspc,
    /// General planar format.
    Ncsp,
    /// Channels blocked by 8.
    NCsp8c,
    /// Channels blocked by 16.
    NCsp16c,
}

/// Bitmask selecting which blocked fields take part in a compatibility
/// check. The base-offset bit is kept separate so callers can accept
/// descriptors that agree on layout but not on placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmpMask(u32);

impl CmpMask {
    pub const DIMS: Self = Self(1);
    pub const STRIDES: Self = Self(1 << 1);
    pub const ORDER: Self = Self(1 << 2);
    pub const OFFSETS: Self = Self(1 << 3);
    pub const OFFSET0: Self = Self(1 << 4);
    pub const FULL: Self = Self(0x1f);

    #[inline]
    pub const fn contains(self, rhs: Self) -> bool {
        self.0 & rhs.0 == rhs.0
    }
}

impl std::ops::BitOr for CmpMask {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The common field set of every blocked layout: four equal-length
/// sequences of length `rank + inner block count`, plus one base offset.
pub trait BlockedLayout {
    fn precision(&self) -> DataType;
    fn shape(&self) -> &Shape;
    /// Physical extents, outer dims first, inner block sizes trailing.
    fn block_dims(&self) -> &[Dim];
    /// Logical axis each physical dimension represents.
    fn order(&self) -> &[Dim];
    /// Offset from the buffer start to the first element.
    fn offset_padding(&self) -> Dim;
    /// Per-dimension offset inside the padded area.
    fn offset_padding_to_data(&self) -> &[Dim];
    fn strides(&self) -> &[Dim];
}

/// Field-masked compatibility over the common blocked field set. Sequences
/// selected by the mask are compared with exact equality; tolerance for
/// runtime-unknown values lives in kind-specific checks only.
pub fn masked_compatible(
    lhs: &(impl BlockedLayout + ?Sized),
    rhs: &(impl BlockedLayout + ?Sized),
    mask: CmpMask,
) -> bool {
    if lhs.shape() != rhs.shape() || lhs.precision() != rhs.precision() {
        return false;
    }
    if mask.contains(CmpMask::DIMS) && lhs.block_dims() != rhs.block_dims() {
        return false;
    }
    if mask.contains(CmpMask::ORDER) && lhs.order() != rhs.order() {
        return false;
    }
    if mask.contains(CmpMask::STRIDES) && lhs.strides() != rhs.strides() {
        return false;
    }
    if mask.contains(CmpMask::OFFSETS)
        && lhs.offset_padding_to_data() != rhs.offset_padding_to_data()
    {
        return false;
    }
    if mask.contains(CmpMask::OFFSET0) && lhs.offset_padding() != rhs.offset_padding() {
        return false;
    }
    true
}

/// Total element count including padding: per logical axis, the product of
/// every block size mapped to it through the order, multiplied across axes.
pub fn padded_elements_count(desc: &(impl BlockedLayout + ?Sized)) -> Result<usize, DescError> {
    let block_dims = desc.block_dims();
    if block_dims.contains(&UNDEFINED_DIM) {
        return Err(DescError::InvalidLayout(
            "cannot compute padded elements count with undefined blocked dims".into(),
        ));
    }
    let mut padded = vec![1usize; desc.shape().rank()];
    for (&axis, &dim) in izip!(desc.order(), block_dims) {
        padded[axis] *= dim;
    }
    Ok(padded.iter().product())
}

/// True if blocking padded some axis beyond its logical extent, i.e. the
/// physical capacity holds phantom elements.
pub fn blocks_extended(desc: &(impl BlockedLayout + ?Sized)) -> bool {
    let rank = desc.shape().rank();
    let order = desc.order();
    let block_dims = desc.block_dims();
    for i in rank..order.len() {
        let axis = order[i];
        let mut padded: Dim = 1;
        for j in rank..order.len() {
            if order[j] == axis {
                padded *= block_dims[j];
            }
        }
        // outer extent of the blocked axis
        match order[..rank].iter().position(|&outer| outer == axis) {
            Some(position) if block_dims[position] != UNDEFINED_DIM => {
                padded *= block_dims[position];
            }
            _ => padded = UNDEFINED_DIM,
        }
        if padded != desc.shape().dims()[axis] {
            return true;
        }
    }
    false
}

/// Canonical format string: one letter per logical axis in physical order,
/// uppercased when the axis carries an inner block, followed by
/// `<size><letter>` for every inner block in physical order. Deterministic
/// across construction paths, which makes it usable as a cache-key
/// fingerprint.
pub fn serialize_format(desc: &(impl BlockedLayout + ?Sized)) -> String {
    let rank = desc.shape().rank();
    let order = desc.order();
    let block_dims = desc.block_dims();
    let blocked_axes: rustc_hash::FxHashSet<Dim> = order[rank..].iter().copied().collect();
    let mut result = String::new();
    for &axis in &order[..rank] {
        let letter = (b'a' + axis as u8) as char;
        match blocked_axes.contains(&axis) {
            true => result.push(letter.to_ascii_uppercase()),
            false => result.push(letter),
        }
    }
    for (&axis, &block) in izip!(&order[rank..], &block_dims[rank..]) {
        result.push_str(&block.to_string());
        result.push((b'a' + axis as u8) as char);
    }
    result
}

/// Physical offset of the element at a logical per-axis index.
///
/// Axes are processed from the innermost physical position outward: each
/// position consumes `index mod block` as the local coordinate and carries
/// `index div block` into the next outer occurrence of the same axis, which
/// handles axes split across several physical positions.
pub fn blocked_offset(desc: &(impl BlockedLayout + ?Sized), index: &[Dim]) -> Dim {
    let order = desc.order();
    let block_dims = desc.block_dims();
    let n = order.len();
    let mut index = index.to_vec();
    let mut shift = vec![0; n];
    for i in (0..n).rev() {
        let axis = order[i];
        shift[i] = index[axis] % block_dims[i];
        index[axis] /= block_dims[i];
    }
    let mut offset = desc.offset_padding();
    for (&shift, &pad, &stride) in izip!(&shift, desc.offset_padding_to_data(), desc.strides()) {
        offset += (shift + pad) * stride;
    }
    offset
}

/// Physical offset of the n'th logical element (last axis fastest).
/// Static shapes only.
pub(crate) fn flat_element_offset(
    desc: &(impl BlockedLayout + ?Sized),
    element: usize,
) -> Result<Dim, DescError> {
    let dims = desc.shape().static_dims()?;
    let mut pos = vec![0; dims.len()];
    let mut remainder = element;
    for i in (0..dims.len()).rev() {
        pos[i] = remainder % dims[i];
        remainder /= dims[i];
    }
    Ok(blocked_offset(desc, &pos))
}

/// Discriminant of [`MemoryDesc`], used for kind checks and cast errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DescKind {
    Blocked,
    Native,
}

impl DescKind {
    const fn name(self) -> &'static str {
        match self {
            DescKind::Blocked => "Blocked",
            DescKind::Native => "Native",
        }
    }
}

/// A tensor memory layout descriptor. Closed variant over the two concrete
/// kinds; all polymorphic operations dispatch here.
#[derive(Debug, Clone, From)]
pub enum MemoryDesc {
    Blocked(BlockedDesc),
    Native(NativeDesc),
}

impl MemoryDesc {
    #[inline]
    pub fn kind(&self) -> DescKind {
        match self {
            MemoryDesc::Blocked(_) => DescKind::Blocked,
            MemoryDesc::Native(_) => DescKind::Native,
        }
    }

    #[inline]
    pub fn precision(&self) -> DataType {
        match self {
            MemoryDesc::Blocked(desc) => desc.precision(),
            MemoryDesc::Native(desc) => desc.precision(),
        }
    }

    pub fn set_precision(&mut self, precision: DataType) {
        match self {
            MemoryDesc::Blocked(desc) => desc.set_precision(precision),
            MemoryDesc::Native(desc) => desc.set_precision(precision),
        }
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        match self {
            MemoryDesc::Blocked(desc) => desc.shape(),
            MemoryDesc::Native(desc) => desc.shape(),
        }
    }

    /// Checks that all dims, strides and offsets are defined.
    pub fn is_defined(&self) -> bool {
        match self {
            MemoryDesc::Blocked(desc) => desc.is_defined(),
            MemoryDesc::Native(desc) => desc.is_defined(),
        }
    }

    /// Polymorphic compatibility. Dispatches on both concrete kinds; any
    /// unrecognized combination reports `false` rather than failing.
    pub fn is_compatible(&self, rhs: &MemoryDesc) -> bool {
        match (self, rhs) {
            (MemoryDesc::Blocked(lhs), MemoryDesc::Blocked(rhs)) => lhs.is_compatible(rhs),
            (MemoryDesc::Native(lhs), MemoryDesc::Native(rhs)) => lhs.is_compatible(rhs),
            (MemoryDesc::Blocked(lhs), MemoryDesc::Native(rhs)) => {
                masked_compatible(lhs, rhs, CmpMask::FULL)
            }
            (MemoryDesc::Native(lhs), MemoryDesc::Blocked(rhs)) => {
                masked_compatible(lhs, rhs, CmpMask::FULL)
            }
        }
    }

    /// Minimal required memory size in bytes, [`UNDEFINED_SIZE`] if the
    /// descriptor is not fully defined.
    pub fn current_mem_size(&self) -> usize {
        match self {
            MemoryDesc::Blocked(desc) => desc.current_mem_size(),
            MemoryDesc::Native(desc) => desc.current_mem_size(),
        }
    }

    /// Memory upper bound: the current size for static shapes, the size at
    /// the shape's maximum bounds otherwise. [`UNDEFINED_SIZE`] when a bound
    /// is itself unknown.
    pub fn max_mem_size(&self) -> usize {
        match self {
            MemoryDesc::Blocked(desc) => desc.max_mem_size(),
            MemoryDesc::Native(desc) => desc.max_mem_size(),
        }
    }

    /// Clones the descriptor with new dims. Fails with
    /// [`DescError::ShapeMismatch`] if `dims` conflict with the internal
    /// shape (defined dims, rank or bounds).
    pub fn clone_with_new_dims(&self, dims: &[Dim]) -> Result<MemoryDesc, DescError> {
        if !self.shape().is_compatible(dims) {
            return Err(DescError::ShapeMismatch {
                shape: self.shape().to_string(),
                dims: crate::shape::dims_to_string(dims),
            });
        }
        match self {
            MemoryDesc::Blocked(desc) => desc.clone_with_new_dims_impl(dims).map(Self::Blocked),
            MemoryDesc::Native(desc) => desc.clone_with_new_dims_impl(dims).map(Self::Native),
        }
    }

    pub fn has_layout_type(&self, layout: LayoutType) -> bool {
        match self {
            MemoryDesc::Blocked(desc) => desc.has_layout_type(layout),
            MemoryDesc::Native(desc) => desc.has_layout_type(layout),
        }
    }

    /// Canonical human-readable format string, usable as a cache-key
    /// fingerprint.
    pub fn serialize_format(&self) -> String {
        match self {
            MemoryDesc::Blocked(desc) => desc.serialize_format(),
            MemoryDesc::Native(desc) => desc.serialize_format(),
        }
    }

    /// True if the descriptor pads some axis beyond its logical extent.
    pub fn blocks_extended(&self) -> bool {
        match self {
            MemoryDesc::Blocked(desc) => blocks_extended(desc),
            MemoryDesc::Native(desc) => desc.blocks_extended(),
        }
    }

    /// Physical index of the n'th logical element, considering padding,
    /// layout and blocking. Used by debug dumps and specialized copy
    /// kernels; static shapes only.
    pub fn element_offset(&self, element: usize) -> Result<Dim, DescError> {
        match self {
            MemoryDesc::Blocked(desc) => flat_element_offset(desc, element),
            MemoryDesc::Native(desc) => flat_element_offset(desc, element),
        }
    }

    /// Safe accessor for the explicit blocked kind.
    pub fn as_blocked(&self) -> Result<&BlockedDesc, DescError> {
        match self {
            MemoryDesc::Blocked(desc) => Ok(desc),
            _ => Err(DescError::CastMismatch {
                expected: DescKind::Blocked.name(),
                actual: self.kind().name(),
            }),
        }
    }

    /// Safe accessor for the native adapter kind.
    pub fn as_native(&self) -> Result<&NativeDesc, DescError> {
        match self {
            MemoryDesc::Native(desc) => Ok(desc),
            _ => Err(DescError::CastMismatch {
                expected: DescKind::Native.name(),
                actual: self.kind().name(),
            }),
        }
    }
}

impl BlockedLayout for MemoryDesc {
    fn precision(&self) -> DataType {
        MemoryDesc::precision(self)
    }

    fn shape(&self) -> &Shape {
        MemoryDesc::shape(self)
    }

    fn block_dims(&self) -> &[Dim] {
        match self {
            MemoryDesc::Blocked(desc) => desc.block_dims(),
            MemoryDesc::Native(desc) => desc.block_dims(),
        }
    }

    fn order(&self) -> &[Dim] {
        match self {
            MemoryDesc::Blocked(desc) => desc.order(),
            MemoryDesc::Native(desc) => desc.order(),
        }
    }

    fn offset_padding(&self) -> Dim {
        match self {
            MemoryDesc::Blocked(desc) => desc.offset_padding(),
            MemoryDesc::Native(desc) => desc.offset_padding(),
        }
    }

    fn offset_padding_to_data(&self) -> &[Dim] {
        match self {
            MemoryDesc::Blocked(desc) => desc.offset_padding_to_data(),
            MemoryDesc::Native(desc) => desc.offset_padding_to_data(),
        }
    }

    fn strides(&self) -> &[Dim] {
        match self {
            MemoryDesc::Blocked(desc) => desc.strides(),
            MemoryDesc::Native(desc) => desc.strides(),
        }
    }
}
