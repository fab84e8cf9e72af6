//! Stateless conversions between descriptor kinds and the legacy
//! interchange format.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{BlockedDesc, BlockedLayout, MemoryDesc, NativeDesc};
use crate::{
    error::DescError,
    num::DataType,
    shape::{Dim, Shape, UNDEFINED_DIM},
};

/// Materializes any descriptor into an explicit blocked snapshot, forcing
/// every lazily derived field.
pub fn to_blocked(desc: &MemoryDesc) -> Result<BlockedDesc, DescError> {
    if let MemoryDesc::Blocked(desc) = desc {
        return Ok(desc.clone());
    }
    BlockedDesc::new(
        desc.precision(),
        desc.shape().clone(),
        desc.block_dims().to_vec(),
        desc.order().to_vec(),
        desc.offset_padding(),
        Some(desc.offset_padding_to_data().to_vec()),
        Some(desc.strides().to_vec()),
    )
}

/// Rebuilds any descriptor as a native adapter, validating that the layout
/// is expressible in the native blocking structure.
pub fn to_native(desc: &MemoryDesc) -> Result<NativeDesc, DescError> {
    if let MemoryDesc::Native(desc) = desc {
        return Ok(desc.clone());
    }
    log::debug!(
        "rebuilding a {} descriptor as a native adapter",
        desc.serialize_format()
    );
    NativeDesc::new(
        desc.precision(),
        desc.shape().clone(),
        desc.block_dims().to_vec(),
        desc.order().to_vec(),
        desc.offset_padding(),
        Some(desc.offset_padding_to_data().to_vec()),
        Some(desc.strides().to_vec()),
    )
}

/// The legacy interchange blocking record: flat, fully materialized, no
/// lazy fields.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LegacyBlocking {
    pub block_dims: Vec<Dim>,
    pub order: Vec<Dim>,
    pub offset_padding: Dim,
    pub offset_padding_to_data: Vec<Dim>,
    pub strides: Vec<Dim>,
}

/// The legacy tensor descriptor interchange struct.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LegacyTensorDesc {
    pub precision: DataType,
    pub dims: Vec<Dim>,
    pub blocking: LegacyBlocking,
}

/// Flattens a descriptor into the legacy interchange struct. The legacy
/// format has no notion of dynamic extents, so the shape must be static.
pub fn to_legacy(desc: &MemoryDesc) -> Result<LegacyTensorDesc, DescError> {
    let dims = desc.shape().static_dims()?.to_vec();
    Ok(LegacyTensorDesc {
        precision: desc.precision(),
        dims,
        blocking: LegacyBlocking {
            block_dims: desc.block_dims().to_vec(),
            order: desc.order().to_vec(),
            offset_padding: desc.offset_padding(),
            offset_padding_to_data: desc.offset_padding_to_data().to_vec(),
            strides: desc.strides().to_vec(),
        },
    })
}

/// Rebuilds a descriptor from the legacy interchange struct, as a native
/// adapter so downstream consumers can hand it to the compute library
/// without a second conversion.
pub fn from_legacy(legacy: &LegacyTensorDesc) -> Result<MemoryDesc, DescError> {
    let desc = NativeDesc::new(
        legacy.precision,
        Shape::from_dims(legacy.dims.clone()),
        legacy.blocking.block_dims.clone(),
        legacy.blocking.order.clone(),
        legacy.blocking.offset_padding,
        Some(legacy.blocking.offset_padding_to_data.clone()),
        Some(legacy.blocking.strides.clone()),
    )?;
    Ok(MemoryDesc::Native(desc))
}

/// Produces a variant of `desc` with the same layout shape but fully
/// unknown placement: undefined base offset and strides, zero
/// per-dimension offsets. The concrete kind is preserved.
pub fn undefine_offsets(desc: &MemoryDesc) -> Result<MemoryDesc, DescError> {
    let strides = vec![UNDEFINED_DIM; desc.order().len()];
    let offsets = vec![0; desc.order().len()];
    match desc {
        MemoryDesc::Blocked(desc) => BlockedDesc::new(
            desc.precision(),
            desc.shape().clone(),
            desc.block_dims().to_vec(),
            desc.order().to_vec(),
            UNDEFINED_DIM,
            Some(offsets),
            Some(strides),
        )
        .map(MemoryDesc::Blocked),
        MemoryDesc::Native(desc) => NativeDesc::new(
            desc.precision(),
            desc.shape().clone(),
            desc.block_dims().to_vec(),
            desc.order().to_vec(),
            UNDEFINED_DIM,
            Some(offsets),
            Some(strides),
        )
        .map(MemoryDesc::Native),
    }
}

/// Produces a variant of `desc` with placement reset to the defaults: zero
/// base offset, zero per-dimension offsets, dense strides re-derived from
/// the block dims. The concrete kind is preserved.
pub fn reset_offsets(desc: &MemoryDesc) -> Result<MemoryDesc, DescError> {
    match desc {
        MemoryDesc::Blocked(desc) => BlockedDesc::new(
            desc.precision(),
            desc.shape().clone(),
            desc.block_dims().to_vec(),
            desc.order().to_vec(),
            0,
            None,
            None,
        )
        .map(MemoryDesc::Blocked),
        MemoryDesc::Native(desc) => NativeDesc::new(
            desc.precision(),
            desc.shape().clone(),
            desc.block_dims().to_vec(),
            desc.order().to_vec(),
            0,
            None,
            None,
        )
        .map(MemoryDesc::Native),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::native::FormatTag;
    use crate::desc::{CmpMask, DescKind, masked_compatible};
    use crate::shape::div_up;

    fn blocked_8c(dims: [Dim; 4]) -> BlockedDesc {
        let [n, c, h, w] = dims;
        BlockedDesc::new(
            DataType::F32,
            Shape::from_dims(dims.to_vec()),
            vec![n, div_up(c, 8), h, w, 8],
            vec![0, 1, 2, 3, 1],
            0,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_to_blocked_snapshot() {
        let native = NativeDesc::from_tag(
            DataType::F32,
            Shape::from_dims([2, 16, 4, 4]),
            FormatTag::ABcd8b,
        )
        .unwrap();
        let snapshot = to_blocked(&MemoryDesc::from(native.clone())).unwrap();
        assert_eq!(snapshot.block_dims(), native.block_dims());
        assert_eq!(snapshot.strides(), native.strides());
        assert_eq!(snapshot.order(), native.order());
        assert!(masked_compatible(&snapshot, &native, CmpMask::FULL));
    }

    #[test]
    fn test_to_native_matches_format() {
        let desc = MemoryDesc::from(blocked_8c([2, 16, 4, 4]));
        let native = to_native(&desc).unwrap();
        assert_eq!(native.format(), Some(FormatTag::ABcd8b));
        assert!(masked_compatible(&native, &desc, CmpMask::FULL));
    }

    #[test]
    fn test_legacy_round_trip() {
        let legacy = LegacyTensorDesc {
            precision: DataType::F32,
            dims: vec![1, 16, 4, 4],
            blocking: LegacyBlocking {
                block_dims: vec![1, 2, 4, 4, 8],
                order: vec![0, 1, 2, 3, 1],
                offset_padding: 0,
                offset_padding_to_data: vec![0; 5],
                strides: vec![256, 128, 32, 8, 1],
            },
        };
        let desc = from_legacy(&legacy).unwrap();
        assert_eq!(desc.kind(), DescKind::Native);
        assert_eq!(to_legacy(&desc).unwrap(), legacy);
    }

    #[test]
    fn test_legacy_requires_static_shape() {
        let shape = Shape::from_bounds(vec![1, 16], vec![4, 16]);
        let desc = MemoryDesc::from(BlockedDesc::dense(DataType::F32, shape));
        assert!(matches!(to_legacy(&desc), Err(DescError::NotStatic)));
    }

    #[test]
    fn test_undefine_and_reset_offsets() {
        let desc = MemoryDesc::from(blocked_8c([1, 16, 4, 4]));
        let undefined = undefine_offsets(&desc).unwrap();
        assert_eq!(undefined.kind(), DescKind::Blocked);
        assert!(!undefined.is_defined());
        assert_eq!(undefined.offset_padding(), UNDEFINED_DIM);
        assert!(undefined.strides().iter().all(|&s| s == UNDEFINED_DIM));
        // layout shape survives even though placement is unknown
        assert!(masked_compatible(
            &undefined,
            &desc,
            CmpMask::DIMS | CmpMask::ORDER | CmpMask::OFFSETS
        ));

        let reset = reset_offsets(&undefined).unwrap();
        assert!(reset.is_defined());
        assert_eq!(reset.offset_padding(), 0);
        assert!(desc.is_compatible(&reset));
    }

    #[test]
    fn test_undefine_preserves_native_kind() {
        let native = NativeDesc::plain(DataType::F16, Shape::from_dims([2, 3, 4])).unwrap();
        let undefined = undefine_offsets(&MemoryDesc::from(native)).unwrap();
        assert_eq!(undefined.kind(), DescKind::Native);
        assert!(!undefined.is_defined());
    }
}
