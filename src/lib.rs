//! Tensor memory layout descriptors for a CPU inference runtime.
//!
//! A [`shape::Shape`] pins each axis of a tensor to an exact extent or a
//! `[min, max]` range. A [`desc::MemoryDesc`] then describes how those
//! logical elements land in a flat buffer: axis order, blocking, strides,
//! padding and base offset. Consumers query descriptors for offsets,
//! compatibility and canonical format strings; [`desc::convert`] bridges
//! descriptor kinds at integration boundaries.
//!
//! Descriptors are immutable value objects. The only interior state is a
//! set of write-once [`memo::Memo`] cells for derived fields, so sharing
//! them across threads needs no further synchronization.

pub mod desc;
pub mod error;
pub mod memo;
pub mod num;
pub mod shape;

pub use desc::{BlockedDesc, BlockedLayout, LayoutType, MemoryDesc, NativeDesc};
pub use error::DescError;
pub use num::DataType;
pub use shape::{Dim, Shape, UNDEFINED_DIM};
