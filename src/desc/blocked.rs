use itertools::Itertools;

use super::{BlockedLayout, LayoutType, UNDEFINED_SIZE, blocked_offset, padded_elements_count};
use crate::{
    error::DescError,
    memo::Memo,
    num::DataType,
    shape::{Dim, Shape, UNDEFINED_DIM, dims_to_string, div_up},
};

/// Derives dense row-major strides for `block_dims`: a right-to-left running
/// product, or all-undefined if any extent is unknown.
fn dense_strides(block_dims: &[Dim]) -> Vec<Dim> {
    if block_dims.contains(&UNDEFINED_DIM) {
        return vec![UNDEFINED_DIM; block_dims.len()];
    }
    let mut strides = vec![0; block_dims.len()];
    if let Some(last) = strides.last_mut() {
        *last = 1;
    }
    for i in (0..block_dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * block_dims[i + 1];
    }
    strides
}

/// A self-contained blocked layout built from explicit parameters.
///
/// Holds the four field sequences directly; nothing is derived lazily except
/// the memoized definedness and padded element count.
#[derive(Debug, Clone)]
pub struct BlockedDesc {
    precision: DataType,
    shape: Shape,
    block_dims: Vec<Dim>,
    order: Vec<Dim>,
    offset_padding: Dim,
    offset_padding_to_data: Vec<Dim>,
    strides: Vec<Dim>,
    defined: Memo<bool>,
    padded_count: Memo<usize>,
}

impl BlockedDesc {
    /// Creates a dense row-major descriptor: identity order, no blocking,
    /// zero offsets, running-product strides.
    pub fn dense(precision: DataType, shape: Shape) -> Self {
        let block_dims = shape.dims().to_vec();
        let order = (0..shape.rank()).collect_vec();
        let offset_padding_to_data = vec![0; shape.rank()];
        let strides = dense_strides(&block_dims);
        Self {
            precision,
            shape,
            block_dims,
            order,
            offset_padding: 0,
            offset_padding_to_data,
            strides,
            defined: Memo::new(),
            padded_count: Memo::new(),
        }
    }

    /// Creates a descriptor from explicit blocked parameters.
    ///
    /// `offset_padding_to_data` and `strides` default to zeros and dense
    /// row-major respectively when omitted. Fails with
    /// [`DescError::InvalidLayout`] if the order contains the undefined
    /// sentinel, if any inner-block extent is undefined, or if the four
    /// field sequences do not share one length.
    pub fn new(
        precision: DataType,
        shape: Shape,
        block_dims: Vec<Dim>,
        order: Vec<Dim>,
        offset_padding: Dim,
        offset_padding_to_data: Option<Vec<Dim>>,
        strides: Option<Vec<Dim>>,
    ) -> Result<Self, DescError> {
        if order.contains(&UNDEFINED_DIM) {
            return Err(DescError::InvalidLayout(format!(
                "undefined order is not supported: {}",
                dims_to_string(&order)
            )));
        }
        if block_dims
            .get(shape.rank()..)
            .unwrap_or_default()
            .contains(&UNDEFINED_DIM)
        {
            return Err(DescError::InvalidLayout(format!(
                "undefined inner block dims are not supported: {}",
                dims_to_string(&block_dims)
            )));
        }

        let offset_padding_to_data =
            offset_padding_to_data.unwrap_or_else(|| vec![0; order.len()]);
        let strides = strides.unwrap_or_else(|| dense_strides(&block_dims));

        if order.len() != block_dims.len()
            || order.len() != offset_padding_to_data.len()
            || order.len() != strides.len()
        {
            return Err(DescError::InvalidLayout(
                "order, blocked dims, offset padding to data and strides must have equal size"
                    .into(),
            ));
        }
        if order.len() < shape.rank() {
            return Err(DescError::InvalidLayout(
                "order must cover every logical axis".into(),
            ));
        }
        if order.iter().any(|&axis| axis >= shape.rank()) {
            return Err(DescError::InvalidLayout(format!(
                "order entry does not name a logical axis: {}",
                dims_to_string(&order)
            )));
        }

        Ok(Self {
            precision,
            shape,
            block_dims,
            order,
            offset_padding,
            offset_padding_to_data,
            strides,
            defined: Memo::new(),
            padded_count: Memo::new(),
        })
    }

    #[inline]
    pub fn precision(&self) -> DataType {
        self.precision
    }

    pub fn set_precision(&mut self, precision: DataType) {
        self.precision = precision;
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn is_defined(&self) -> bool {
        *self.defined.get_or_init(|| {
            !self.block_dims.contains(&UNDEFINED_DIM)
                && !self.strides.contains(&UNDEFINED_DIM)
                && !self.order.contains(&UNDEFINED_DIM)
                && !self.offset_padding_to_data.contains(&UNDEFINED_DIM)
                && self.offset_padding != UNDEFINED_DIM
        })
    }

    pub fn is_compatible(&self, rhs: &BlockedDesc) -> bool {
        super::masked_compatible(self, rhs, super::CmpMask::FULL)
    }

    /// Physical offset of the element at a logical per-axis index.
    pub fn offset(&self, index: &[Dim]) -> Dim {
        blocked_offset(self, index)
    }

    /// Minimal required memory size in bytes, [`UNDEFINED_SIZE`] if any
    /// field is still unknown.
    pub fn current_mem_size(&self) -> usize {
        if !self.is_defined() {
            return UNDEFINED_SIZE;
        }
        // distance from the buffer start to one past the last element
        let mut elements = self.offset_padding + 1;
        for (&dim, &stride) in self.block_dims.iter().zip_eq(&self.strides) {
            elements += (dim - 1) * stride;
        }
        elements * self.precision.size()
    }

    pub fn max_mem_size(&self) -> usize {
        if self.shape.is_static() {
            return self.current_mem_size();
        }
        let max_dims = self.shape.max_dims();
        if max_dims.contains(&UNDEFINED_DIM) {
            return UNDEFINED_SIZE;
        }
        match self.clone_with_new_dims_impl(max_dims) {
            Ok(desc) => desc.current_mem_size(),
            Err(_) => UNDEFINED_SIZE,
        }
    }

    /// Total element count including padding, memoized.
    pub fn padded_elements_count(&self) -> Result<usize, DescError> {
        self.padded_count
            .try_get_or_init(|| padded_elements_count(self))
            .copied()
    }

    pub fn has_layout_type(&self, layout: LayoutType) -> bool {
        match layout {
            LayoutType::Ncsp => self.is_plain(),
            LayoutType::Nspc => self.is_tail_c(),
            LayoutType::NCsp8c => self.is_blocked_c(Some(8)),
            LayoutType::NCsp16c => self.is_blocked_c(Some(16)),
        }
    }

    /// Identity order, no blocking.
    pub fn is_plain(&self) -> bool {
        self.order.len() == self.shape.rank()
            && self.order.iter().enumerate().all(|(i, &axis)| axis == i)
    }

    /// Exactly one inner block on the channel axis, identity outer order,
    /// and a matching block size (`None` accepts any size).
    pub fn is_blocked_c(&self, block_size: Option<Dim>) -> bool {
        if self.order.len() != self.shape.rank() + 1 {
            return false;
        }
        if !self.order[..self.order.len() - 1]
            .iter()
            .enumerate()
            .all(|(i, &axis)| axis == i)
        {
            return false;
        }
        if self.order.last() != Some(&1) {
            return false;
        }
        match block_size {
            Some(size) => self.block_dims.last() == Some(&size),
            None => true,
        }
    }

    /// Channels-last: no blocking, leading order sorted ascending, channel
    /// axis at the innermost position.
    pub fn is_tail_c(&self) -> bool {
        if self.shape.rank() < 3 || self.order.len() != self.shape.rank() {
            return false;
        }
        if !self.order[..self.order.len() - 1].is_sorted() {
            return false;
        }
        self.order.last() == Some(&1)
    }

    pub fn serialize_format(&self) -> String {
        super::serialize_format(self)
    }

    /// Clone-with-new-dims body; the shape bounds have already been checked
    /// by the caller.
    pub(super) fn clone_with_new_dims_impl(&self, dims: &[Dim]) -> Result<Self, DescError> {
        if dims.contains(&UNDEFINED_DIM) {
            return Err(DescError::InvalidLayout(
                "cannot clone with undefined dims".into(),
            ));
        }

        // Stride recalculation for strided blobs is not supported; require a
        // dense product chain from the innermost dimension outward.
        for i in (0..self.strides.len().saturating_sub(1)).rev() {
            if self.strides[i] == UNDEFINED_DIM
                || self.strides[i + 1] == UNDEFINED_DIM
                || self.block_dims[i + 1] == UNDEFINED_DIM
            {
                break;
            }
            if self.strides[i] != self.strides[i + 1] * self.block_dims[i + 1] {
                return Err(DescError::NotImplemented(
                    "cannot clone with new dims for a not dense tensor".into(),
                ));
            }
        }

        let rank = dims.len();
        let mut new_block_dims = vec![0; self.order.len()];
        for i in 0..rank {
            new_block_dims[i] = dims[self.order[i]];
        }
        for i in rank..self.order.len() {
            new_block_dims[i] = self.block_dims[i];
            let outer = self.order[..rank]
                .iter()
                .position(|&axis| axis == self.order[i])
                .ok_or_else(|| {
                    DescError::InvalidLayout(format!(
                        "inner block axis {} has no outer position in order {}",
                        self.order[i],
                        dims_to_string(&self.order)
                    ))
                })?;
            new_block_dims[outer] = div_up(new_block_dims[outer], self.block_dims[i]);
        }

        let offset_padding_to_data = (!self.offset_padding_to_data.contains(&UNDEFINED_DIM))
            .then(|| self.offset_padding_to_data.clone());

        Self::new(
            self.precision,
            Shape::from_dims(dims.to_vec()),
            new_block_dims,
            self.order.clone(),
            self.offset_padding,
            offset_padding_to_data,
            None,
        )
    }
}

impl BlockedLayout for BlockedDesc {
    fn precision(&self) -> DataType {
        self.precision
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn block_dims(&self) -> &[Dim] {
        &self.block_dims
    }

    fn order(&self) -> &[Dim] {
        &self.order
    }

    fn offset_padding(&self) -> Dim {
        self.offset_padding
    }

    fn offset_padding_to_data(&self) -> &[Dim] {
        &self.offset_padding_to_data
    }

    fn strides(&self) -> &[Dim] {
        &self.strides
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::blocks_extended;

    fn blocked_8c(shape: [Dim; 4]) -> BlockedDesc {
        let [n, c, h, w] = shape;
        BlockedDesc::new(
            DataType::F32,
            Shape::from_dims(shape.to_vec()),
            vec![n, div_up(c, 8), h, w, 8],
            vec![0, 1, 2, 3, 1],
            0,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_dense_nchw() {
        let desc = BlockedDesc::dense(DataType::F32, Shape::from_dims([1, 3, 4, 4]));
        assert_eq!(desc.order(), &[0, 1, 2, 3]);
        assert_eq!(desc.block_dims(), &[1, 3, 4, 4]);
        assert_eq!(desc.strides(), &[48, 16, 4, 1]);
        assert_eq!(desc.offset_padding(), 0);
        assert_eq!(desc.offset(&[0, 2, 1, 3]), 39);
        assert!(desc.is_defined());
        assert_eq!(desc.current_mem_size(), 48 * 4);
        assert_eq!(desc.padded_elements_count().unwrap(), 48);
    }

    #[test]
    fn test_flat_index_round_trip() {
        let dims = [2, 3, 5, 7];
        let desc = crate::desc::MemoryDesc::from(BlockedDesc::dense(
            DataType::F32,
            Shape::from_dims(dims.to_vec()),
        ));
        // dense layout maps the flat logical index to itself
        for _ in 0..64 {
            let element = fastrand::usize(0..dims.iter().product());
            assert_eq!(desc.element_offset(element).unwrap(), element);
        }
    }

    #[test]
    fn test_plain_format_any_rank() {
        for rank in 1..=6 {
            let dims = (1..=rank).collect_vec();
            let desc = BlockedDesc::dense(DataType::U8, Shape::from_dims(dims));
            assert!(desc.is_plain());
            assert!(desc.has_layout_type(LayoutType::Ncsp));
        }
    }

    #[test]
    fn test_blocked_c_format() {
        let desc = blocked_8c([1, 16, 4, 4]);
        assert!(desc.has_layout_type(LayoutType::NCsp8c));
        assert!(!desc.has_layout_type(LayoutType::Ncsp));
        assert!(!desc.has_layout_type(LayoutType::NCsp16c));
        assert!(desc.is_blocked_c(None));
    }

    #[test]
    fn test_tail_c_format() {
        let desc = BlockedDesc::new(
            DataType::F32,
            Shape::from_dims([2, 3, 4, 4]),
            vec![2, 4, 4, 3],
            vec![0, 2, 3, 1],
            0,
            None,
            None,
        )
        .unwrap();
        assert!(desc.is_tail_c());
        assert!(desc.has_layout_type(LayoutType::Nspc));
        assert_eq!(desc.strides(), &[48, 12, 3, 1]);
    }

    #[test]
    fn test_blocked_offset_with_split_axis() {
        // 16 channels blocked by 8: element [0, 11, 0, 0] lives in the
        // second block, local coordinate 3.
        let desc = blocked_8c([1, 16, 2, 2]);
        assert_eq!(desc.strides(), &[64, 32, 16, 8, 1]);
        assert_eq!(desc.offset(&[0, 11, 0, 0]), 32 + 3);
    }

    #[test]
    fn test_padding_detection() {
        assert!(blocks_extended(&blocked_8c([1, 20, 4, 4])));
        assert!(!blocks_extended(&blocked_8c([1, 16, 4, 4])));
        assert_eq!(
            blocked_8c([1, 20, 4, 4]).padded_elements_count().unwrap(),
            1 * 24 * 4 * 4
        );
    }

    #[test]
    fn test_serialize_format() {
        let plain = BlockedDesc::dense(DataType::F32, Shape::from_dims([1, 3, 4, 4]));
        assert_eq!(plain.serialize_format(), "abcd");
        let blocked = blocked_8c([1, 16, 4, 4]);
        assert_eq!(blocked.serialize_format(), "aBcd8b");
        let blocked16 = BlockedDesc::new(
            DataType::F32,
            Shape::from_dims([1, 16, 4, 4]),
            vec![1, 1, 4, 4, 16],
            vec![0, 1, 2, 3, 1],
            0,
            None,
            None,
        )
        .unwrap();
        assert_ne!(blocked.serialize_format(), blocked16.serialize_format());
    }

    #[test]
    fn test_invalid_layout() {
        let shape = Shape::from_dims([2, 16]);
        assert!(matches!(
            BlockedDesc::new(
                DataType::F32,
                shape.clone(),
                vec![2, 2, 8],
                vec![0, 1, UNDEFINED_DIM],
                0,
                None,
                None,
            ),
            Err(DescError::InvalidLayout(_))
        ));
        assert!(matches!(
            BlockedDesc::new(
                DataType::F32,
                shape.clone(),
                vec![2, 2, UNDEFINED_DIM],
                vec![0, 1, 1],
                0,
                None,
                None,
            ),
            Err(DescError::InvalidLayout(_))
        ));
        assert!(matches!(
            BlockedDesc::new(
                DataType::F32,
                shape,
                vec![2, 16],
                vec![0, 1],
                0,
                None,
                Some(vec![16, 1, 1]),
            ),
            Err(DescError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_clone_with_new_dims_keeps_blocking() {
        let desc = blocked_8c([1, 16, 4, 4]);
        let cloned = desc.clone_with_new_dims_impl(&[2, 20, 5, 5]).unwrap();
        assert_eq!(cloned.block_dims(), &[2, 3, 5, 5, 8]);
        assert_eq!(cloned.order(), &[0, 1, 2, 3, 1]);
        assert!(cloned.shape().is_static());
    }

    #[test]
    fn test_clone_with_new_dims_rejects_strided() {
        // stride gap on the outermost dimension
        let desc = BlockedDesc::new(
            DataType::F32,
            Shape::from_dims([2, 3]),
            vec![2, 3],
            vec![0, 1],
            0,
            None,
            Some(vec![8, 1]),
        )
        .unwrap();
        assert!(matches!(
            desc.clone_with_new_dims_impl(&[2, 3]),
            Err(DescError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_undefined_strides_not_defined() {
        let shape = Shape::from_bounds(vec![1, 16], vec![4, 16]);
        let desc = BlockedDesc::new(
            DataType::F32,
            shape.clone(),
            shape.dims().to_vec(),
            vec![0, 1],
            0,
            None,
            None,
        )
        .unwrap();
        assert!(!desc.is_defined());
        assert_eq!(desc.current_mem_size(), UNDEFINED_SIZE);
        assert_eq!(desc.max_mem_size(), 4 * 16 * 4);
    }
}
