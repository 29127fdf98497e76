//! Flat-buffer bookkeeping for variable-count collectives.
//!
//! Collective transfers move one contiguous buffer per call, split between
//! processes by a count array and a matching displacement array. This module
//! holds the pure functions that build and take apart those buffers:
//!
//! - [`displacements`] maps a count array to its prefix-sum offsets.
//! - [`Layout`] pairs the two and answers "which range belongs to rank `r`".
//! - [`pack`] concatenates payloads and records their sizes; [`unpack`] is its
//!   inverse.
//! - [`segment_sums`] folds per-task sizes into per-process totals.
//! - [`encode_sizes`] / [`decode_sizes`] move integer arrays through byte
//!   collectives.
//!
//! ```
//! use bytes::Bytes;
//! use dapply::packing::{pack, unpack};
//!
//! let payloads = vec![Bytes::from_static(b"ab"), Bytes::new(), Bytes::from_static(b"cde")];
//! let (flat, sizes) = pack(&payloads);
//! assert_eq!(&flat[..], b"abcde");
//! assert_eq!(sizes, vec![2, 0, 3]);
//! assert_eq!(unpack(flat, &sizes).unwrap(), payloads);
//! ```

use std::ops::Range;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Width of one integer in an encoded size array.
pub const SIZE_WIDTH: usize = std::mem::size_of::<u64>();

/// Inconsistent shape metadata.
///
/// The partition planner and the collectors agree on shapes by construction,
/// so any of these indicates a protocol bug or a misbehaving peer. The round
/// that observes one is aborted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("buffer holds {actual} bytes but the sizes describe {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("counts describe {expected} items but {actual} were provided")]
    CountMismatch { expected: usize, actual: usize },
    #[error("encoded size array of {0} bytes is not a multiple of 8")]
    TruncatedSizes(usize),
    #[error("size {0} does not fit in this platform's address space")]
    SizeOverflow(u64),
    #[error("rank {rank} is outside a layout of {len} ranks")]
    RankOutOfRange { rank: usize, len: usize },
}

/// Prefix-sum offsets for `counts`, starting at zero.
///
/// ```
/// assert_eq!(dapply::packing::displacements(&[2, 3, 0, 4]), vec![0, 2, 5, 5]);
/// ```
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0usize, |offset, &count| {
            let start = *offset;
            *offset += count;
            Some(start)
        })
        .collect()
}

/// How a flat buffer is split between the ranks of a group.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Layout {
    counts: Vec<usize>,
    displacements: Vec<usize>,
}

impl Layout {
    pub fn from_counts(counts: Vec<usize>) -> Self {
        let displacements = displacements(&counts);
        Self {
            counts,
            displacements,
        }
    }

    /// A layout where every rank holds `count` units.
    pub fn uniform(ranks: usize, count: usize) -> Self {
        Self::from_counts(vec![count; ranks])
    }

    /// Scale every count by `width`, e.g. from items to bytes.
    pub fn scaled(&self, width: usize) -> Self {
        Self::from_counts(self.counts.iter().map(|count| count * width).collect())
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn displacements(&self) -> &[usize] {
        &self.displacements
    }

    /// Number of ranks described.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Total units across every rank.
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn count(&self, rank: usize) -> Result<usize, ShapeError> {
        self.counts
            .get(rank)
            .copied()
            .ok_or(ShapeError::RankOutOfRange {
                rank,
                len: self.len(),
            })
    }

    /// The range of the flat buffer owned by `rank`.
    pub fn range(&self, rank: usize) -> Result<Range<usize>, ShapeError> {
        let count = self.count(rank)?;
        let start = self.displacements[rank];
        Ok(start..start + count)
    }
}

/// Concatenate `payloads` in order, returning the flat buffer and each
/// payload's size.
pub fn pack(payloads: &[Bytes]) -> (Bytes, Vec<usize>) {
    let sizes: Vec<usize> = payloads.iter().map(Bytes::len).collect();
    let mut flat = BytesMut::with_capacity(sizes.iter().sum());
    for payload in payloads {
        flat.extend_from_slice(payload);
    }

    (flat.freeze(), sizes)
}

/// Split `flat` back into payloads of the given `sizes`.
///
/// The returned payloads share `flat`'s allocation.
pub fn unpack(flat: Bytes, sizes: &[usize]) -> Result<Vec<Bytes>, ShapeError> {
    let expected: usize = sizes.iter().sum();
    if expected != flat.len() {
        return Err(ShapeError::LengthMismatch {
            expected,
            actual: flat.len(),
        });
    }

    Ok(displacements(sizes)
        .into_iter()
        .zip(sizes)
        .map(|(start, size)| flat.slice(start..start + size))
        .collect())
}

/// Sum consecutive runs of `sizes`, one run per entry of `counts`.
///
/// Used to derive per-process byte counts from per-task byte sizes.
pub fn segment_sums(sizes: &[usize], counts: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let expected: usize = counts.iter().sum();
    if expected != sizes.len() {
        return Err(ShapeError::CountMismatch {
            expected,
            actual: sizes.len(),
        });
    }

    Ok(displacements(counts)
        .into_iter()
        .zip(counts)
        .map(|(start, count)| sizes[start..start + count].iter().sum())
        .collect())
}

/// Encode integers as fixed-width little-endian words.
pub fn encode_sizes(sizes: &[usize]) -> Bytes {
    let mut buf = BytesMut::with_capacity(sizes.len() * SIZE_WIDTH);
    for &size in sizes {
        buf.put_u64_le(size as u64);
    }
    buf.freeze()
}

/// Inverse of [`encode_sizes`].
pub fn decode_sizes(mut buf: Bytes) -> Result<Vec<usize>, ShapeError> {
    if buf.len() % SIZE_WIDTH != 0 {
        return Err(ShapeError::TruncatedSizes(buf.len()));
    }

    let mut sizes = Vec::with_capacity(buf.len() / SIZE_WIDTH);
    while buf.has_remaining() {
        let size = buf.get_u64_le();
        sizes.push(usize::try_from(size).map_err(|_| ShapeError::SizeOverflow(size))?);
    }

    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn payloads(sizes: &[usize]) -> Vec<Bytes> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| Bytes::from(vec![i as u8; size]))
            .collect()
    }

    #[test]
    fn displacements_start_at_zero() {
        assert_eq!(displacements(&[]), Vec::<usize>::new());
        assert_eq!(displacements(&[0, 0, 7]), vec![0, 0, 0]);
        assert_eq!(displacements(&[4, 1, 2]), vec![0, 4, 5]);
    }

    #[test]
    fn layout_ranges_tile_the_buffer() {
        let layout = Layout::from_counts(vec![3, 0, 2, 5]);
        assert_eq!(layout.total(), 10);
        assert_eq!(layout.range(0).unwrap(), 0..3);
        assert_eq!(layout.range(1).unwrap(), 3..3);
        assert_eq!(layout.range(2).unwrap(), 3..5);
        assert_eq!(layout.range(3).unwrap(), 5..10);
        assert_eq!(
            layout.range(4),
            Err(ShapeError::RankOutOfRange { rank: 4, len: 4 })
        );
        assert_eq!(layout.scaled(8).counts(), &[24, 0, 16, 40]);
    }

    #[test]
    fn unpack_inverts_pack_for_small_batches() {
        for sizes in [vec![], vec![5], vec![0], vec![1, 0, 3]] {
            let original = payloads(&sizes);
            let (flat, packed_sizes) = pack(&original);
            assert_eq!(packed_sizes, sizes);
            assert_eq!(unpack(flat, &packed_sizes).unwrap(), original);
        }
    }

    #[test]
    fn unpack_inverts_pack_for_random_batches() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let n = rng.gen_range(0..40);
            let sizes: Vec<usize> = (0..n).map(|_| rng.gen_range(0..64)).collect();
            let original = payloads(&sizes);
            let (flat, packed_sizes) = pack(&original);
            assert_eq!(flat.len(), sizes.iter().sum::<usize>());
            assert_eq!(unpack(flat, &packed_sizes).unwrap(), original);
        }
    }

    #[test]
    fn unpack_rejects_wrong_length() {
        let flat = Bytes::from_static(b"abc");
        assert_eq!(
            unpack(flat, &[1, 1]),
            Err(ShapeError::LengthMismatch {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn segment_sums_follow_counts() {
        let sizes = [1, 2, 3, 4, 5, 6];
        assert_eq!(segment_sums(&sizes, &[2, 0, 3, 1]).unwrap(), vec![3, 0, 12, 6]);
        assert_eq!(
            segment_sums(&sizes, &[2, 2]),
            Err(ShapeError::CountMismatch {
                expected: 4,
                actual: 6
            })
        );
    }

    #[test]
    fn sizes_codec() {
        let sizes = vec![0, 1, 255, 1 << 20];
        let encoded = encode_sizes(&sizes);
        assert_eq!(encoded.len(), sizes.len() * SIZE_WIDTH);
        assert_eq!(decode_sizes(encoded).unwrap(), sizes);
        assert_eq!(
            decode_sizes(Bytes::from_static(&[1, 2, 3])),
            Err(ShapeError::TruncatedSizes(3))
        );
    }
}
