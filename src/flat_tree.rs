//! index arithmetic for an in-order ("flat") binary tree
//!
//! Leaves sit at even indices, interior nodes at odd ones. The binary
//! representation of `index + 1` encodes depth (trailing one bits) and
//! horizontal offset, so every function here is a couple of shifts.
//!
//! ```text
//! 0
//!   1
//! 2
//!     3
//! 4
//!   5
//! 6
//! ```
use smallvec::SmallVec;

/// result type of [full_roots]; a feed of 2^64 blocks has at most 64 roots
pub type Roots = SmallVec<[u64; 64]>;

/// number of trailing one bits, i.e. the height of the node above the leaves
pub fn depth(index: u64) -> u64 {
    (!index).trailing_zeros() as u64
}

/// horizontal offset of the node within its depth row
pub fn offset(index: u64) -> u64 {
    index >> (depth(index) + 1)
}

/// node index from a depth and a horizontal offset
pub fn index(depth: u64, offset: u64) -> u64 {
    (offset << (depth + 1)) | ((1 << depth) - 1)
}

pub fn parent(i: u64) -> u64 {
    let d = depth(i);
    index(d + 1, offset(i) >> 1)
}

pub fn sibling(i: u64) -> u64 {
    let d = depth(i);
    index(d, offset(i) ^ 1)
}

pub fn uncle(i: u64) -> u64 {
    sibling(parent(i))
}

/// left child of an interior node. Calling this on a leaf is forbidden.
pub fn left_child(i: u64) -> u64 {
    let d = depth(i);
    debug_assert!(d > 0, "leaves have no children");
    index(d - 1, offset(i) << 1)
}

/// right child of an interior node. Calling this on a leaf is forbidden.
pub fn right_child(i: u64) -> u64 {
    let d = depth(i);
    debug_assert!(d > 0, "leaves have no children");
    index(d - 1, (offset(i) << 1) + 1)
}

/// leftmost leaf index covered by the subtree under `i`
pub fn left_span(i: u64) -> u64 {
    i - ((1 << depth(i)) - 1)
}

/// rightmost leaf index covered by the subtree under `i`
pub fn right_span(i: u64) -> u64 {
    i + (1 << depth(i)) - 1
}

/// number of leaves covered by the subtree under `i`
pub fn count_leaves(i: u64) -> u64 {
    1 << depth(i)
}

/// The minimal set of subtree roots covering the first `index / 2` leaves,
/// ascending. `index` must be even (a leaf boundary).
pub fn full_roots(index: u64) -> Roots {
    debug_assert!(index & 1 == 0, "roots are only defined at leaf boundaries");
    let mut roots = Roots::new();
    let mut remaining = index / 2;
    let mut offset = 0u64;
    while remaining > 0 {
        let mut factor = 1u64;
        while factor * 2 <= remaining {
            factor *= 2;
        }
        roots.push(offset + factor - 1);
        offset += 2 * factor;
        remaining -= factor;
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn small_tree() {
        assert_eq!(depth(0), 0);
        assert_eq!(depth(1), 1);
        assert_eq!(depth(3), 2);
        assert_eq!(depth(5), 1);
        assert_eq!(parent(0), 1);
        assert_eq!(parent(2), 1);
        assert_eq!(parent(1), 3);
        assert_eq!(sibling(0), 2);
        assert_eq!(sibling(1), 5);
        assert_eq!(uncle(0), 5);
        assert_eq!(left_child(3), 1);
        assert_eq!(right_child(3), 5);
        assert_eq!(left_span(3), 0);
        assert_eq!(right_span(3), 6);
        assert_eq!(left_span(5), 4);
        assert_eq!(right_span(5), 6);
    }

    #[test]
    fn roots_of_prefixes() {
        assert!(full_roots(0).is_empty());
        assert_eq!(full_roots(2).as_slice(), &[0]);
        assert_eq!(full_roots(4).as_slice(), &[1]);
        assert_eq!(full_roots(6).as_slice(), &[1, 4]);
        assert_eq!(full_roots(8).as_slice(), &[3]);
        assert_eq!(full_roots(10).as_slice(), &[3, 8]);
        assert_eq!(full_roots(16).as_slice(), &[7]);
        assert_eq!(full_roots(18).as_slice(), &[7, 16]);
    }

    #[quickcheck]
    fn parent_identities(i: u64) -> bool {
        let i = i >> 8;
        parent(sibling(i)) == parent(i)
            && left_child(parent(i)) <= i
            && i <= right_child(parent(i))
    }

    #[quickcheck]
    fn child_spans_partition_parent(i: u64) -> bool {
        let i = parent(i >> 8);
        left_span(i) == left_span(left_child(i))
            && right_span(i) == right_span(right_child(i))
            && right_span(left_child(i)) + 2 == left_span(right_child(i))
    }

    #[quickcheck]
    fn full_roots_cover_exactly(n: u16) -> bool {
        let n = n as u64 * 2;
        let roots = full_roots(n);
        let covered: u64 = roots.iter().map(|r| count_leaves(*r)).sum();
        let ascending = roots.windows(2).all(|w| w[0] < w[1]);
        let contiguous = roots
            .windows(2)
            .all(|w| right_span(w[0]) + 2 == left_span(w[1]));
        covered == n / 2 && ascending && contiguous
    }
}
