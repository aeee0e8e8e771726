//! proof planning over the set of locally stored tree nodes
//!
//! The tree bitfield records which node hashes are committed. This module
//! answers the questions replication needs: what does a peer already know
//! (`digest`), which nodes do we have to send so a peer can verify one block
//! (`proof`), and how far does the verified tree extend (`verified_by`,
//! `blocks`). Everything here is pure bookkeeping; hashing happens in the
//! feed when a proof is assembled or checked.
use crate::bitfield::Bitfield;
use crate::flat_tree as flat;
use smallvec::SmallVec;

/// What a peer already holds around one leaf, so proofs can skip it.
///
/// Opaque to users; the replication collaborator decides how to put it on
/// the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Digest {
    /// the peer has the leaf node itself
    pub node: bool,
    /// bit `k`: the peer has the sibling at height `k` of the leaf's chain
    pub siblings: u64,
    /// height whose parent is already committed on the peer, if any
    pub anchor: Option<u32>,
}

impl Digest {
    pub fn has_sibling(&self, level: u32) -> bool {
        level < 64 && (self.siblings >> level) & 1 == 1
    }
}

/// the node indices to ship for one block, plus the root boundary if the
/// proof has to extend all the way up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofPlan {
    pub nodes: SmallVec<[u64; 8]>,
    pub verified_by: Option<u64>,
}

pub fn get(bits: &Bitfield, index: u64) -> bool {
    bits.tree_get(index)
}

/// Commit node `index` and auto-fill ancestors whose sibling is present.
/// Returns false if the node was already committed.
pub fn set(bits: &mut Bitfield, mut index: u64) -> bool {
    if !bits.tree_set(index, true) {
        return false;
    }
    while bits.tree_get(flat::sibling(index)) {
        index = flat::parent(index);
        if !bits.tree_set(index, true) {
            break;
        }
    }
    true
}

/// describe what we already hold around `block`, for handing to a prover
pub fn digest(bits: &Bitfield, block: u64) -> Digest {
    let mut node = 2 * block;
    if bits.tree_get(node) {
        return Digest {
            node: true,
            ..Digest::default()
        };
    }
    let mut siblings = 0u64;
    for level in 0..64 {
        // nothing above a node spanning the whole allocated tree can be set
        if flat::left_span(node) == 0 && flat::right_span(node) >= bits.tree_capacity() {
            break;
        }
        if bits.tree_get(flat::sibling(node)) {
            siblings |= 1 << level;
        }
        if bits.tree_get(flat::parent(node)) {
            return Digest {
                node: false,
                siblings,
                anchor: Some(level),
            };
        }
        node = flat::parent(node);
    }
    Digest {
        node: false,
        siblings,
        anchor: None,
    }
}

/// Leaf boundary (`2 * blocks`) up to which the committed tree containing
/// `index` extends; 0 when `index` itself is not committed.
pub fn verified_by(bits: &Bitfield, index: u64) -> u64 {
    if !bits.tree_get(index) {
        return 0;
    }
    // climb to the top of the committed tree
    let mut top = index;
    while bits.tree_get(flat::parent(top)) {
        top = flat::parent(top);
    }
    // then absorb committed full subtrees sitting to the right
    loop {
        let next = flat::right_span(top) + 2;
        let max_depth = (next / 2).trailing_zeros();
        let found = (0..=max_depth)
            .rev()
            .map(|d| next + (1 << d) - 1)
            .find(|idx| bits.tree_get(*idx));
        match found {
            Some(idx) => top = idx,
            None => return flat::right_span(top) + 2,
        }
    }
}

/// number of blocks covered by the committed tree, as recovered on open
pub fn blocks(bits: &Bitfield) -> u64 {
    let max = bits.tree_capacity();
    let mut next = 0u64;
    let mut top = 0u64;
    while flat::right_span(next) < max {
        next = flat::parent(next);
        if bits.tree_get(next) {
            top = next;
        }
    }
    if !bits.tree_get(top) {
        return 0;
    }
    verified_by(bits, top) / 2
}

/// Plan the minimum node set a peer described by `digest` needs to verify
/// `block`. With `include_hash` the leaf node itself is shipped first, for
/// hash-only requests. Returns None when we do not hold the needed nodes.
pub fn proof(bits: &Bitfield, block: u64, digest: Digest, include_hash: bool) -> Option<ProofPlan> {
    let leaf = 2 * block;
    if !bits.tree_get(leaf) {
        return None;
    }
    let mut nodes = SmallVec::new();
    if digest.node {
        // peer can already verify; nothing to prove
        return Some(ProofPlan {
            nodes,
            verified_by: None,
        });
    }
    if include_hash {
        nodes.push(leaf);
    }
    let boundary = verified_by(bits, leaf);
    let roots = flat::full_roots(boundary);
    let mut node = leaf;
    let mut level = 0u32;
    loop {
        if roots.contains(&node) {
            // proof reaches the root set; ship the other roots alongside
            nodes.extend(roots.iter().copied().filter(|r| *r != node));
            return Some(ProofPlan {
                nodes,
                verified_by: Some(boundary),
            });
        }
        if !digest.has_sibling(level) {
            let sib = flat::sibling(node);
            if !bits.tree_get(sib) {
                return None;
            }
            nodes.push(sib);
        }
        if digest.anchor == Some(level) {
            // peer holds the next parent and can compare against it
            return Some(ProofPlan {
                nodes,
                verified_by: None,
            });
        }
        node = flat::parent(node);
        level += 1;
    }
}
