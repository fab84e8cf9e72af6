use derive_more::Display;
use itertools::Itertools;

use super::{BlockedLayout, LayoutType, UNDEFINED_SIZE, padded_elements_count};
use crate::{
    error::DescError,
    memo::Memo,
    num::DataType,
    shape::{Dim, Shape, UNDEFINED_DIM, dims_to_string},
};

/// Capacity of the native descriptor's fixed arrays, for outer dims and
/// inner blocks alike.
pub const NATIVE_MAX_DIMS: usize = 7;

/// The native library's sentinel for an extent resolved only at runtime.
pub const RUNTIME_DIM: i64 = i64::MIN;

#[inline]
pub(crate) fn to_native_dim(dim: Dim) -> i64 {
    if dim == UNDEFINED_DIM {
        RUNTIME_DIM
    } else {
        dim as i64
    }
}

#[inline]
pub(crate) fn from_native_dim(dim: i64) -> Dim {
    if dim == RUNTIME_DIM {
        UNDEFINED_DIM
    } else {
        dim as Dim
    }
}

/// Signed ceiling division (`i64::div_ceil` is not yet stable).
#[inline]
fn native_div_ceil(lhs: i64, rhs: i64) -> i64 {
    let quot = lhs / rhs;
    let rem = lhs % rhs;
    if (rem > 0 && rhs > 0) || (rem < 0 && rhs < 0) {
        quot + 1
    } else {
        quot
    }
}

/// Weak entry comparison: a runtime-unknown value on either side matches.
#[inline]
fn native_dim_eq_weak(lhs: i64, rhs: i64) -> bool {
    lhs == rhs || lhs == RUNTIME_DIM || rhs == RUNTIME_DIM
}

fn native_dims_eq_weak(lhs: &[i64], rhs: &[i64]) -> bool {
    lhs.len() == rhs.len()
        && lhs
            .iter()
            .zip(rhs)
            .all(|(&l, &r)| native_dim_eq_weak(l, r))
}

/// Format kind of a native tensor descriptor. Only `Blocked` is interpreted
/// by this crate; the rest are opaque and rejected at the adapter boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NativeFormatKind {
    Undef,
    Any,
    Blocked,
    Opaque,
}

/// The blocking record of a native tensor descriptor: outer strides indexed
/// by logical axis, plus the trailing inner block sizes and the axes they
/// subdivide.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NativeBlocking {
    pub strides: [i64; NATIVE_MAX_DIMS],
    pub inner_nblks: usize,
    pub inner_blks: [i64; NATIVE_MAX_DIMS],
    pub inner_idxs: [i64; NATIVE_MAX_DIMS],
}

/// The native compute library's tensor descriptor. An immutable interchange
/// value: this crate copies it around but never mutates one it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeTensorDesc {
    pub ndims: usize,
    pub data_type: DataType,
    pub format_kind: NativeFormatKind,
    pub dims: [i64; NATIVE_MAX_DIMS],
    pub padded_dims: [i64; NATIVE_MAX_DIMS],
    pub padded_offsets: [i64; NATIVE_MAX_DIMS],
    pub offset0: i64,
    pub blocking: NativeBlocking,
}

impl NativeTensorDesc {
    fn empty(data_type: DataType, ndims: usize) -> Self {
        Self {
            ndims,
            data_type,
            format_kind: NativeFormatKind::Blocked,
            dims: [0; NATIVE_MAX_DIMS],
            padded_dims: [0; NATIVE_MAX_DIMS],
            padded_offsets: [0; NATIVE_MAX_DIMS],
            offset0: 0,
            blocking: NativeBlocking::default(),
        }
    }

    fn has_runtime_dims_or_strides(&self) -> bool {
        self.dims[..self.ndims].contains(&RUNTIME_DIM)
            || self.padded_dims[..self.ndims].contains(&RUNTIME_DIM)
            || self.blocking.strides[..self.ndims].contains(&RUNTIME_DIM)
            || self.offset0 == RUNTIME_DIM
    }
}

/// Well-known native format tags, bounded to rank 6. Each tag names one
/// canonical permutation-plus-blocking arrangement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FormatTag {
    #[display("a")]
    A,
    #[display("ab")]
    Ab,
    #[display("ba")]
    Ba,
    #[display("abc")]
    Abc,
    #[display("acb")]
    Acb,
    #[display("bac")]
    Bac,
    #[display("aBc8b")]
    ABc8b,
    #[display("aBc16b")]
    ABc16b,
    #[display("abcd")]
    Abcd,
    #[display("acdb")]
    Acdb,
    #[display("bacd")]
    Bacd,
    #[display("aBcd8b")]
    ABcd8b,
    #[display("aBcd16b")]
    ABcd16b,
    #[display("abcde")]
    Abcde,
    #[display("acdeb")]
    Acdeb,
    #[display("aBcde8b")]
    ABcde8b,
    #[display("aBcde16b")]
    ABcde16b,
    #[display("abcdef")]
    Abcdef,
    #[display("aBcdef16b")]
    ABcdef16b,
}

impl FormatTag {
    pub const fn rank(self) -> usize {
        match self {
            FormatTag::A => 1,
            FormatTag::Ab | FormatTag::Ba => 2,
            FormatTag::Abc
            | FormatTag::Acb
            | FormatTag::Bac
            | FormatTag::ABc8b
            | FormatTag::ABc16b => 3,
            FormatTag::Abcd
            | FormatTag::Acdb
            | FormatTag::Bacd
            | FormatTag::ABcd8b
            | FormatTag::ABcd16b => 4,
            FormatTag::Abcde | FormatTag::Acdeb | FormatTag::ABcde8b | FormatTag::ABcde16b => 5,
            FormatTag::Abcdef | FormatTag::ABcdef16b => 6,
        }
    }

    /// The tag's layout as `(perm, inner_blks, inner_idxs)`.
    fn layout(self) -> (Vec<usize>, Vec<Dim>, Vec<usize>) {
        let identity = |rank: usize| (0..rank).collect_vec();
        match self {
            FormatTag::A => (identity(1), vec![], vec![]),
            FormatTag::Ab => (identity(2), vec![], vec![]),
            FormatTag::Ba => (vec![1, 0], vec![], vec![]),
            FormatTag::Abc => (identity(3), vec![], vec![]),
            FormatTag::Acb => (vec![0, 2, 1], vec![], vec![]),
            FormatTag::Bac => (vec![1, 0, 2], vec![], vec![]),
            FormatTag::ABc8b => (identity(3), vec![8], vec![1]),
            FormatTag::ABc16b => (identity(3), vec![16], vec![1]),
            FormatTag::Abcd => (identity(4), vec![], vec![]),
            FormatTag::Acdb => (vec![0, 2, 3, 1], vec![], vec![]),
            FormatTag::Bacd => (vec![1, 0, 2, 3], vec![], vec![]),
            FormatTag::ABcd8b => (identity(4), vec![8], vec![1]),
            FormatTag::ABcd16b => (identity(4), vec![16], vec![1]),
            FormatTag::Abcde => (identity(5), vec![], vec![]),
            FormatTag::Acdeb => (vec![0, 2, 3, 4, 1], vec![], vec![]),
            FormatTag::ABcde8b => (identity(5), vec![8], vec![1]),
            FormatTag::ABcde16b => (identity(5), vec![16], vec![1]),
            FormatTag::Abcdef => (identity(6), vec![], vec![]),
            FormatTag::ABcdef16b => (identity(6), vec![16], vec![1]),
        }
    }

    /// Known tags of the given rank, in match preference order.
    pub fn by_rank(rank: usize) -> &'static [FormatTag] {
        match rank {
            1 => &[FormatTag::A],
            2 => &[FormatTag::Ab, FormatTag::Ba],
            3 => &[
                FormatTag::Abc,
                FormatTag::Acb,
                FormatTag::Bac,
                FormatTag::ABc8b,
                FormatTag::ABc16b,
            ],
            4 => &[
                FormatTag::Abcd,
                FormatTag::Acdb,
                FormatTag::Bacd,
                FormatTag::ABcd8b,
                FormatTag::ABcd16b,
            ],
            5 => &[
                FormatTag::Abcde,
                FormatTag::Acdeb,
                FormatTag::ABcde8b,
                FormatTag::ABcde16b,
            ],
            6 => &[FormatTag::Abcdef, FormatTag::ABcdef16b],
            _ => &[],
        }
    }
}

/// Recovers the canonical outer order of a native descriptor: axis indices
/// sorted by stride descending, with the outer block extent descending as
/// the tie-break. Two axes can share a stride only when their block extents
/// differ, so the result is deterministic; the native `inner_idxs` tail is
/// appended unchanged.
fn recover_order(raw: &NativeTensorDesc) -> Vec<Dim> {
    let ndims = raw.ndims;
    let blk = &raw.blocking;

    let mut total_block = vec![1i64; ndims];
    for i in 0..blk.inner_nblks {
        total_block[blk.inner_idxs[i] as usize] *= blk.inner_blks[i];
    }
    let mut outer_block_dims = raw.dims[..ndims].to_vec();
    for (dim, &total) in outer_block_dims.iter_mut().zip(&total_block) {
        if *dim != RUNTIME_DIM {
            *dim = native_div_ceil(*dim, total);
        }
    }

    let mut order = (0..ndims).collect_vec();
    order.sort_by(|&lhs, &rhs| {
        (blk.strides[rhs], outer_block_dims[rhs]).cmp(&(blk.strides[lhs], outer_block_dims[lhs]))
    });
    order.extend(blk.inner_idxs[..blk.inner_nblks].iter().map(|&i| i as Dim));
    order
}

/// Recomputes the derivable parts of a native descriptor (padded dims,
/// dense strides, zero offsets) from its preserved blocking arrays. The
/// inner block structure is never reconstructed, keeping the result
/// recognizable by the native library's own format matching.
fn fill_blocked(raw: &mut NativeTensorDesc, perm: &[usize]) {
    let ndims = raw.ndims;
    let blk = raw.blocking;

    let mut total_block = [1i64; NATIVE_MAX_DIMS];
    let mut inner_product = 1i64;
    for i in 0..blk.inner_nblks {
        total_block[blk.inner_idxs[i] as usize] *= blk.inner_blks[i];
        inner_product *= blk.inner_blks[i];
    }

    for i in 0..ndims {
        raw.padded_offsets[i] = 0;
        raw.padded_dims[i] = if raw.dims[i] == RUNTIME_DIM {
            RUNTIME_DIM
        } else {
            native_div_ceil(raw.dims[i], total_block[i]) * total_block[i]
        };
    }
    raw.offset0 = 0;

    if raw.padded_dims[..ndims].contains(&RUNTIME_DIM) {
        for i in 0..ndims {
            raw.blocking.strides[i] = RUNTIME_DIM;
        }
    } else {
        let mut stride = inner_product;
        for &axis in perm.iter().rev() {
            raw.blocking.strides[axis] = stride;
            stride *= raw.padded_dims[axis] / total_block[axis];
        }
    }
}

/// A memory descriptor wrapping the native library's opaque blocking
/// structure. Block dims, strides and per-dimension offsets are derived
/// from the raw descriptor lazily and memoized; the canonical order is
/// recovered at construction.
#[derive(Debug, Clone)]
pub struct NativeDesc {
    raw: NativeTensorDesc,
    shape: Shape,
    order: Vec<Dim>,
    block_dims: Memo<Vec<Dim>>,
    strides: Memo<Vec<Dim>>,
    offset_padding_to_data: Memo<Vec<Dim>>,
    defined: Memo<bool>,
    padded_count: Memo<usize>,
}

impl NativeDesc {
    fn assemble(raw: NativeTensorDesc, shape: Shape, order: Vec<Dim>) -> Self {
        Self {
            raw,
            shape,
            order,
            block_dims: Memo::new(),
            strides: Memo::new(),
            offset_padding_to_data: Memo::new(),
            defined: Memo::new(),
            padded_count: Memo::new(),
        }
    }

    /// Creates a dense plain descriptor over `shape`. Dynamic extents leave
    /// the native strides marked runtime.
    pub fn plain(precision: DataType, shape: Shape) -> Result<Self, DescError> {
        let rank = shape.rank();
        if rank > NATIVE_MAX_DIMS {
            return Err(DescError::InvalidLayout(format!(
                "rank {rank} exceeds native descriptor capacity {NATIVE_MAX_DIMS}"
            )));
        }
        let dims = shape.dims();
        let mut raw = NativeTensorDesc::empty(precision, rank);
        for (i, &dim) in dims.iter().enumerate() {
            raw.dims[i] = to_native_dim(dim);
            raw.padded_dims[i] = raw.dims[i];
        }
        if dims.contains(&UNDEFINED_DIM) {
            for i in 0..rank {
                raw.blocking.strides[i] = RUNTIME_DIM;
            }
        } else {
            let mut stride = 1i64;
            for i in (0..rank).rev() {
                raw.blocking.strides[i] = stride;
                stride *= raw.dims[i];
            }
        }
        let order = (0..rank).collect_vec();
        Ok(Self::assemble(raw, shape, order))
    }

    /// Creates a descriptor from explicit blocked parameters, filling the
    /// native structure field by field.
    ///
    /// The first `rank` entries of `order` must be a permutation of
    /// `[0, rank)`; supplied strides must be non-increasing with a dense
    /// inner-block chain; inner padding offsets must be zero. Violations
    /// fail with [`DescError::InvalidLayout`].
    pub fn new(
        precision: DataType,
        shape: Shape,
        block_dims: Vec<Dim>,
        order: Vec<Dim>,
        offset_padding: Dim,
        offset_padding_to_data: Option<Vec<Dim>>,
        strides: Option<Vec<Dim>>,
    ) -> Result<Self, DescError> {
        let rank = shape.rank();

        // scalar case
        if rank == 0 {
            let mut raw = NativeTensorDesc::empty(precision, 1);
            raw.dims[0] = 1;
            raw.padded_dims[0] = 1;
            raw.blocking.strides[0] = 1;
            raw.offset0 = to_native_dim(offset_padding);
            return Ok(Self::assemble(raw, shape, vec![0]));
        }

        if order.len() != block_dims.len() {
            return Err(DescError::InvalidLayout(
                "order and blocked dims must have equal size".into(),
            ));
        }
        if offset_padding_to_data
            .as_ref()
            .is_some_and(|offsets| offsets.len() != order.len())
        {
            return Err(DescError::InvalidLayout(
                "offset padding to data must have equal size with order and blocked dims".into(),
            ));
        }
        if strides
            .as_ref()
            .is_some_and(|strides| strides.len() != order.len())
        {
            return Err(DescError::InvalidLayout(
                "strides must have equal size with order and blocked dims".into(),
            ));
        }
        if order.len() < rank {
            return Err(DescError::InvalidLayout(
                "order must cover every logical axis".into(),
            ));
        }
        if order.contains(&UNDEFINED_DIM) {
            return Err(DescError::InvalidLayout(format!(
                "undefined order is not supported: {}",
                dims_to_string(&order)
            )));
        }
        if block_dims[rank..].contains(&UNDEFINED_DIM) {
            return Err(DescError::InvalidLayout(format!(
                "undefined inner block dims are not supported: {}",
                dims_to_string(&block_dims)
            )));
        }
        if order.iter().any(|&axis| axis >= rank) {
            return Err(DescError::InvalidLayout(format!(
                "order entry does not name a logical axis: {}",
                dims_to_string(&order)
            )));
        }
        let inner_ndims = order.len() - rank;
        if rank > NATIVE_MAX_DIMS || inner_ndims > NATIVE_MAX_DIMS {
            return Err(DescError::InvalidLayout(format!(
                "rank {rank} + {inner_ndims} inner blocks exceeds native descriptor capacity"
            )));
        }

        if let Some(strides) = &strides {
            if strides.windows(2).any(|pair| pair[0] < pair[1]) {
                return Err(DescError::InvalidLayout(format!(
                    "strides must be non-increasing: {}",
                    dims_to_string(strides)
                )));
            }
            if !strides.contains(&UNDEFINED_DIM) {
                let mut inner_dense = matches!(strides[strides.len() - 1], 0 | 1);
                for i in rank..strides.len().saturating_sub(1) {
                    inner_dense &= strides[i] == strides[i + 1] * block_dims[i + 1];
                }
                if !inner_dense {
                    return Err(DescError::InvalidLayout(format!(
                        "inner blocks are not dense: {}",
                        dims_to_string(strides)
                    )));
                }
            }
        }

        // outer_order[axis] is the physical position of that axis
        let mut outer_order = vec![usize::MAX; rank];
        for (position, &axis) in order[..rank].iter().enumerate() {
            outer_order[axis] = position;
        }
        if outer_order.contains(&usize::MAX) {
            return Err(DescError::InvalidLayout(format!(
                "order is not a permutation of the outer axes: {}",
                dims_to_string(&order)
            )));
        }

        let mut raw = NativeTensorDesc::empty(precision, rank);
        raw.offset0 = to_native_dim(offset_padding);
        for (i, &dim) in shape.dims().iter().enumerate() {
            raw.dims[i] = to_native_dim(dim);
        }

        if let Some(offsets) = &offset_padding_to_data {
            if offsets[rank..].iter().any(|&pad| pad != 0) {
                return Err(DescError::InvalidLayout(format!(
                    "inner pad offsets must be zero: {}",
                    dims_to_string(offsets)
                )));
            }
            for (i, &pad) in offsets[..rank].iter().enumerate() {
                raw.padded_offsets[i] = to_native_dim(pad);
            }
        }

        for i in 0..rank {
            raw.padded_dims[i] = 1;
        }
        for (&axis, &dim) in order.iter().zip(&block_dims) {
            if raw.padded_dims[axis] != RUNTIME_DIM && dim != UNDEFINED_DIM {
                raw.padded_dims[axis] *= dim as i64;
            } else {
                raw.padded_dims[axis] = RUNTIME_DIM;
            }
        }

        raw.blocking.inner_nblks = inner_ndims;
        for i in 0..inner_ndims {
            raw.blocking.inner_blks[i] = block_dims[rank + i] as i64;
            raw.blocking.inner_idxs[i] = order[rank + i] as i64;
        }

        match &strides {
            None => {
                if block_dims.contains(&UNDEFINED_DIM) {
                    for i in 0..rank {
                        raw.blocking.strides[i] = RUNTIME_DIM;
                    }
                } else {
                    let mut dense = vec![0i64; order.len()];
                    dense[order.len() - 1] = 1;
                    for i in (0..order.len() - 1).rev() {
                        dense[i] = dense[i + 1] * block_dims[i + 1] as i64;
                    }
                    for axis in 0..rank {
                        raw.blocking.strides[axis] = dense[outer_order[axis]];
                    }
                }
            }
            Some(strides) => {
                for axis in 0..rank {
                    raw.blocking.strides[axis] = to_native_dim(strides[outer_order[axis]]);
                }
            }
        }

        Ok(Self::assemble(raw, shape, order))
    }

    /// Creates a canonical descriptor for a known format tag at the given
    /// shape. The tag's rank must match the shape's.
    pub fn from_tag(precision: DataType, shape: Shape, tag: FormatTag) -> Result<Self, DescError> {
        let rank = shape.rank();
        if tag.rank() != rank {
            return Err(DescError::InvalidLayout(format!(
                "format tag {tag} does not fit rank {rank}"
            )));
        }
        let (perm, inner_blks, inner_idxs) = tag.layout();

        let mut total_block = vec![1; rank];
        for (&axis, &block) in inner_idxs.iter().zip(&inner_blks) {
            total_block[axis] *= block;
        }
        let dims = shape.dims();
        let mut block_dims = perm
            .iter()
            .map(|&axis| match dims[axis] {
                UNDEFINED_DIM => UNDEFINED_DIM,
                dim => dim.div_ceil(total_block[axis]),
            })
            .collect_vec();
        block_dims.extend(&inner_blks);

        let mut order = perm;
        order.extend(&inner_idxs);

        Self::new(precision, shape, block_dims, order, 0, None, None)
    }

    /// Wraps a raw native descriptor, recovering the canonical order from
    /// its strides. Non-blocked kinds are rejected with
    /// [`DescError::UnsupportedFormat`]; runtime extents leave no basis for
    /// order recovery and are rejected as invalid.
    pub fn from_raw(raw: NativeTensorDesc) -> Result<Self, DescError> {
        if raw.format_kind != NativeFormatKind::Blocked {
            return Err(DescError::UnsupportedFormat(format!(
                "cannot wrap a {} native descriptor",
                raw.format_kind
            )));
        }
        if raw.has_runtime_dims_or_strides() {
            return Err(DescError::InvalidLayout(
                "cannot recover order from runtime dims or strides".into(),
            ));
        }
        let dims = raw.dims[..raw.ndims]
            .iter()
            .map(|&dim| from_native_dim(dim))
            .collect_vec();
        let shape = Shape::from_dims(dims);
        let order = recover_order(&raw);
        log::trace!("recovered order {order:?} from a raw native descriptor");
        Ok(Self::assemble(raw, shape, order))
    }

    /// The wrapped native descriptor.
    #[inline]
    pub fn raw(&self) -> &NativeTensorDesc {
        &self.raw
    }

    #[inline]
    pub fn precision(&self) -> DataType {
        self.raw.data_type
    }

    pub fn set_precision(&mut self, precision: DataType) {
        self.raw.data_type = precision;
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Blocked dims derived from the native structure: outer extents are
    /// the logical dims divided (ceiling) by the total inner block per
    /// axis, mapped through the order; inner block sizes trail.
    pub fn block_dims(&self) -> &[Dim] {
        self.block_dims.get_or_init(|| {
            let ndims = self.raw.ndims;
            let blk = &self.raw.blocking;

            let mut total_block = vec![1; ndims];
            for i in 0..blk.inner_nblks {
                total_block[blk.inner_idxs[i] as usize] *= blk.inner_blks[i] as Dim;
            }
            let outer_block_dims = self.raw.dims[..ndims]
                .iter()
                .enumerate()
                .map(|(i, &dim)| match from_native_dim(dim) {
                    UNDEFINED_DIM => UNDEFINED_DIM,
                    dim => dim.div_ceil(total_block[i]),
                })
                .collect_vec();

            let mut block_dims = self.order[..ndims]
                .iter()
                .map(|&axis| outer_block_dims[axis])
                .collect_vec();
            block_dims.extend(blk.inner_blks[..blk.inner_nblks].iter().map(|&b| b as Dim));
            block_dims
        })
    }

    /// Strides derived lazily: inner strides are a right-to-left running
    /// product of the inner block sizes; outer strides come straight from
    /// the native blocking, reordered through the recovered order.
    pub fn strides(&self) -> &[Dim] {
        self.strides.get_or_init(|| {
            let ndims = self.raw.ndims;
            let blk = &self.raw.blocking;

            let mut inner_strides = vec![1 as Dim; blk.inner_nblks];
            for i in (0..blk.inner_nblks.saturating_sub(1)).rev() {
                inner_strides[i] = inner_strides[i + 1] * blk.inner_blks[i + 1] as Dim;
            }

            let mut strides = self.order[..ndims]
                .iter()
                .map(|&axis| from_native_dim(blk.strides[axis]))
                .collect_vec();
            strides.extend(inner_strides);
            strides
        })
    }

    #[inline]
    pub fn order(&self) -> &[Dim] {
        &self.order
    }

    #[inline]
    pub fn offset_padding(&self) -> Dim {
        from_native_dim(self.raw.offset0)
    }

    pub fn offset_padding_to_data(&self) -> &[Dim] {
        self.offset_padding_to_data.get_or_init(|| {
            (0..self.order.len())
                .map(|i| match self.raw.padded_offsets.get(i) {
                    Some(&offset) => from_native_dim(offset),
                    None => 0,
                })
                .collect_vec()
        })
    }

    pub fn is_defined(&self) -> bool {
        *self
            .defined
            .get_or_init(|| !self.raw.has_runtime_dims_or_strides())
    }

    /// Weak structural compatibility. Bit-identical native descriptors
    /// match trivially; otherwise dims, padded dims, padded offsets and the
    /// base offset are compared with the runtime-unknown wildcard, the
    /// inner block structure exactly, and the leading axis's stride is
    /// skipped when that axis's extent is 1: a batch-size-1 stride cannot
    /// affect addressing and must not block reuse.
    pub fn is_compatible(&self, rhs: &NativeDesc) -> bool {
        if self.shape != rhs.shape || self.precision() != rhs.precision() {
            return false;
        }
        if self.raw == rhs.raw {
            return true;
        }
        if matches!(
            self.raw.format_kind,
            NativeFormatKind::Undef | NativeFormatKind::Any
        ) {
            return false;
        }

        let ndims = self.raw.ndims;
        let blk = &self.raw.blocking;
        let r_blk = &rhs.raw.blocking;
        let stride_start = if ndims > 0 && self.raw.dims[0] == 1 {
            1
        } else {
            0
        };

        ndims == rhs.raw.ndims
            && self.order == rhs.order
            && self.raw.format_kind == rhs.raw.format_kind
            && self.raw.data_type == rhs.raw.data_type
            && native_dims_eq_weak(&self.raw.dims[..ndims], &rhs.raw.dims[..ndims])
            && native_dims_eq_weak(
                &blk.strides[stride_start..ndims],
                &r_blk.strides[stride_start..ndims],
            )
            && blk.inner_nblks == r_blk.inner_nblks
            && blk.inner_blks[..blk.inner_nblks] == r_blk.inner_blks[..blk.inner_nblks]
            && blk.inner_idxs[..blk.inner_nblks] == r_blk.inner_idxs[..blk.inner_nblks]
            && native_dims_eq_weak(&self.raw.padded_dims[..ndims], &rhs.raw.padded_dims[..ndims])
            && native_dims_eq_weak(
                &self.raw.padded_offsets[..ndims],
                &rhs.raw.padded_offsets[..ndims],
            )
            && native_dim_eq_weak(self.raw.offset0, rhs.raw.offset0)
    }

    /// Checks whether this descriptor's physical arrangement matches a
    /// known format tag: same inner block structure and the same canonical
    /// outer order, each side canonicalized independently.
    pub fn is_same(&self, tag: FormatTag) -> Result<bool, DescError> {
        if self.raw.format_kind != NativeFormatKind::Blocked {
            return Err(DescError::UnsupportedFormat(
                "format matching is only defined for blocked native descriptors".into(),
            ));
        }
        if tag.rank() != self.raw.ndims || self.raw.has_runtime_dims_or_strides() {
            return Ok(false);
        }
        let reference = Self::from_tag(self.precision(), self.shape.clone(), tag)?;

        let blk = &self.raw.blocking;
        let r_blk = &reference.raw.blocking;
        if blk.inner_nblks != r_blk.inner_nblks
            || blk.inner_blks[..blk.inner_nblks] != r_blk.inner_blks[..blk.inner_nblks]
            || blk.inner_idxs[..blk.inner_nblks] != r_blk.inner_idxs[..blk.inner_nblks]
        {
            return Ok(false);
        }
        Ok(recover_order(&self.raw) == recover_order(&reference.raw))
    }

    /// Best-effort recovery of a human-readable format tag, by linear
    /// search over the known tags of this rank.
    pub fn format(&self) -> Option<FormatTag> {
        FormatTag::by_rank(self.raw.ndims)
            .iter()
            .copied()
            .find(|&tag| self.is_same(tag).unwrap_or(false))
    }

    pub fn serialize_format(&self) -> String {
        super::serialize_format(self)
    }

    pub fn has_layout_type(&self, layout: LayoutType) -> bool {
        match layout {
            LayoutType::Ncsp => self.is_plain(),
            LayoutType::Nspc => self.is_tail_c(),
            LayoutType::NCsp8c => self.is_blocked_c(Some(8)),
            LayoutType::NCsp16c => self.is_blocked_c(Some(16)),
        }
    }

    fn is_plain(&self) -> bool {
        self.order.len() == self.shape.rank()
            && self.order.iter().enumerate().all(|(i, &axis)| axis == i)
    }

    fn is_blocked_c(&self, block_size: Option<Dim>) -> bool {
        let blk = &self.raw.blocking;
        if self.raw.format_kind != NativeFormatKind::Blocked
            || blk.inner_nblks != 1
            || blk.inner_idxs[0] != 1
        {
            return false;
        }
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
        match block_size {
            Some(size) => blk.inner_blks[0] == size as i64,
            None => true,
        }
    }

    fn is_tail_c(&self) -> bool {
        if self.shape.rank() < 3 || self.order.len() != self.shape.rank() {
            return false;
        }
        if !self.order[..self.order.len() - 1].is_sorted() {
            return false;
        }
        self.order.last() == Some(&1)
    }

    /// True if padding extended some axis beyond its logical extent.
    pub fn blocks_extended(&self) -> bool {
        let ndims = self.raw.ndims;
        self.raw.dims[..ndims] != self.raw.padded_dims[..ndims]
    }

    /// Total element count including padding, memoized.
    pub fn padded_elements_count(&self) -> Result<usize, DescError> {
        self.padded_count
            .try_get_or_init(|| padded_elements_count(self))
            .copied()
    }

    /// Minimal required memory size in bytes, from the padded capacity.
    pub fn current_mem_size(&self) -> usize {
        if !self.is_defined() {
            return UNDEFINED_SIZE;
        }
        match self.padded_elements_count() {
            Ok(count) => (self.offset_padding() + count) * self.precision().size(),
            Err(_) => UNDEFINED_SIZE,
        }
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

    /// Clone-with-new-dims body; the shape bounds have already been checked
    /// by the caller. The blocking arrays are carried over bit-for-bit and
    /// only the derivable fields are refilled.
    pub(super) fn clone_with_new_dims_impl(&self, dims: &[Dim]) -> Result<Self, DescError> {
        let mut raw = self.raw;
        for (i, &dim) in dims.iter().enumerate() {
            raw.dims[i] = to_native_dim(dim);
        }
        fill_blocked(&mut raw, &self.order[..dims.len()]);
        Self::from_raw(raw)
    }
}

impl BlockedLayout for NativeDesc {
    fn precision(&self) -> DataType {
        self.precision()
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn block_dims(&self) -> &[Dim] {
        self.block_dims()
    }

    fn order(&self) -> &[Dim] {
        &self.order
    }

    fn offset_padding(&self) -> Dim {
        self.offset_padding()
    }

    fn offset_padding_to_data(&self) -> &[Dim] {
        self.offset_padding_to_data()
    }

    fn strides(&self) -> &[Dim] {
        self.strides()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked_8c(dims: [Dim; 4], strides: Option<Vec<Dim>>) -> NativeDesc {
        let [n, c, h, w] = dims;
        NativeDesc::new(
            DataType::F32,
            Shape::from_dims(dims.to_vec()),
            vec![n, c.div_ceil(8), h, w, 8],
            vec![0, 1, 2, 3, 1],
            0,
            None,
            strides,
        )
        .unwrap()
    }

    #[test]
    fn test_plain_derivation() {
        let desc = NativeDesc::plain(DataType::F32, Shape::from_dims([2, 16, 4, 4])).unwrap();
        assert_eq!(desc.block_dims(), &[2, 16, 4, 4]);
        assert_eq!(desc.strides(), &[256, 16, 4, 1]);
        assert_eq!(desc.order(), &[0, 1, 2, 3]);
        assert!(desc.is_defined());
        assert!(desc.is_plain());
        assert_eq!(desc.serialize_format(), "abcd");
        assert_eq!(desc.format(), Some(FormatTag::Abcd));
    }

    #[test]
    fn test_blocked_derivation() {
        let desc = blocked_8c([1, 20, 4, 4], None);
        assert_eq!(desc.block_dims(), &[1, 3, 4, 4, 8]);
        assert_eq!(desc.strides(), &[384, 128, 32, 8, 1]);
        assert_eq!(desc.raw().padded_dims[..4], [1, 24, 4, 4]);
        assert!(desc.blocks_extended());
        assert_eq!(desc.padded_elements_count().unwrap(), 384);
        assert_eq!(desc.current_mem_size(), 384 * 4);
        assert_eq!(desc.serialize_format(), "aBcd8b");
    }

    #[test]
    fn test_format_tag_round_trip() {
        let shape = Shape::from_dims([2, 16, 4, 4]);
        let desc = NativeDesc::from_tag(DataType::F32, shape.clone(), FormatTag::ABcd8b).unwrap();
        assert!(desc.is_same(FormatTag::ABcd8b).unwrap());
        assert!(!desc.is_same(FormatTag::Abcd).unwrap());
        assert_eq!(desc.format(), Some(FormatTag::ABcd8b));
        assert!(desc.has_layout_type(LayoutType::NCsp8c));
        assert!(!desc.has_layout_type(LayoutType::Ncsp));

        let tail = NativeDesc::from_tag(DataType::F32, shape, FormatTag::Acdb).unwrap();
        assert!(tail.has_layout_type(LayoutType::Nspc));
        assert_eq!(tail.format(), Some(FormatTag::Acdb));
    }

    #[test]
    fn test_canonicalization_idempotent() {
        let explicit = blocked_8c([2, 16, 4, 4], None);
        let rewrapped = NativeDesc::from_raw(*explicit.raw()).unwrap();
        assert_eq!(explicit.order(), rewrapped.order());
        assert_eq!(explicit.serialize_format(), rewrapped.serialize_format());
        assert_eq!(explicit.block_dims(), rewrapped.block_dims());
    }

    #[test]
    fn test_permuted_order_recovery() {
        // channels-last physically, constructed without an order hint
        let desc = NativeDesc::from_tag(
            DataType::F32,
            Shape::from_dims([2, 3, 4, 5]),
            FormatTag::Acdb,
        )
        .unwrap();
        let rewrapped = NativeDesc::from_raw(*desc.raw()).unwrap();
        assert_eq!(rewrapped.order(), &[0, 2, 3, 1]);
        assert_eq!(rewrapped.strides(), &[60, 15, 3, 1]);
    }

    #[test]
    fn test_batch_one_stride_exemption() {
        let dense = blocked_8c([1, 16, 8, 8], None);
        let strided = blocked_8c([1, 16, 8, 8], Some(vec![4096, 512, 64, 8, 1]));
        assert!(dense.is_compatible(&strided));
        assert!(strided.is_compatible(&dense));

        let dense = blocked_8c([2, 16, 8, 8], None);
        let strided = blocked_8c([2, 16, 8, 8], Some(vec![4096, 512, 64, 8, 1]));
        assert!(!dense.is_compatible(&strided));
    }

    #[test]
    fn test_inner_structure_compared_exactly() {
        let by_8 = blocked_8c([1, 16, 8, 8], None);
        let by_16 = NativeDesc::from_tag(
            DataType::F32,
            Shape::from_dims([1, 16, 8, 8]),
            FormatTag::ABcd16b,
        )
        .unwrap();
        assert!(!by_8.is_compatible(&by_16));
    }

    #[test]
    fn test_from_raw_rejections() {
        let desc = NativeDesc::plain(DataType::F32, Shape::from_dims([2, 3])).unwrap();
        let mut raw = *desc.raw();
        raw.format_kind = NativeFormatKind::Opaque;
        assert!(matches!(
            NativeDesc::from_raw(raw),
            Err(DescError::UnsupportedFormat(_))
        ));

        let mut raw = *desc.raw();
        raw.dims[0] = RUNTIME_DIM;
        assert!(matches!(
            NativeDesc::from_raw(raw),
            Err(DescError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_invalid_explicit_parameters() {
        let shape = Shape::from_dims([2, 16, 4, 4]);
        // ascending strides
        assert!(matches!(
            NativeDesc::new(
                DataType::F32,
                shape.clone(),
                vec![2, 16, 4, 4],
                vec![0, 1, 2, 3],
                0,
                None,
                Some(vec![1, 4, 64, 256]),
            ),
            Err(DescError::InvalidLayout(_))
        ));
        // outer order is not a permutation
        assert!(matches!(
            NativeDesc::new(
                DataType::F32,
                shape.clone(),
                vec![2, 16, 4, 4],
                vec![0, 1, 1, 3],
                0,
                None,
                None,
            ),
            Err(DescError::InvalidLayout(_))
        ));
        // non-zero inner pad offset
        assert!(matches!(
            NativeDesc::new(
                DataType::F32,
                shape,
                vec![2, 2, 4, 4, 8],
                vec![0, 1, 2, 3, 1],
                0,
                Some(vec![0, 0, 0, 0, 2]),
                None,
            ),
            Err(DescError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_clone_with_new_dims_preserves_blocking() {
        let desc = blocked_8c([2, 16, 4, 4], None);
        let cloned = desc.clone_with_new_dims_impl(&[4, 20, 5, 5]).unwrap();
        assert_eq!(cloned.raw().blocking.inner_nblks, 1);
        assert_eq!(cloned.raw().blocking.inner_blks[0], 8);
        assert_eq!(cloned.raw().padded_dims[..4], [4, 24, 5, 5]);
        assert_eq!(cloned.block_dims(), &[4, 3, 5, 5, 8]);
        assert_eq!(cloned.order(), desc.order());
    }

    #[test]
    fn test_dynamic_shape_strides_runtime() {
        let shape = Shape::from_bounds(vec![1, 16, 4, 4], vec![8, 16, 4, 4]);
        let desc = NativeDesc::plain(DataType::F16, shape).unwrap();
        assert!(!desc.is_defined());
        assert_eq!(desc.current_mem_size(), UNDEFINED_SIZE);
        assert_eq!(desc.max_mem_size(), 8 * 16 * 4 * 4 * 2);
        assert_eq!(desc.strides()[0], UNDEFINED_DIM);
    }

    #[test]
    fn test_masked_compatible_against_blocked() {
        use crate::desc::{BlockedDesc, CmpMask, masked_compatible};
        let shape = Shape::from_dims([2, 16, 4, 4]);
        let native = NativeDesc::plain(DataType::F32, shape.clone()).unwrap();
        let blocked = BlockedDesc::dense(DataType::F32, shape);
        assert!(masked_compatible(&native, &blocked, CmpMask::FULL));
    }
}
