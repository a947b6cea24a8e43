//! Field-level encoding helpers shared by the packet bodies.
//!
//! Every read checks the remaining length first; bodies never panic on
//! truncated input.

use crate::frame::MAX_TREE_DEPTH;
use crate::{PeerId, Tree, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encoded size of one tree vertex without its children
const TREE_VERTEX_SIZE: usize = PeerId::SIZE + 4;

pub(crate) fn put_peer(buf: &mut BytesMut, peer: &PeerId) {
    buf.put_slice(peer.as_bytes());
}

pub(crate) fn get_peer(buf: &mut Bytes) -> Result<PeerId, WireError> {
    if buf.remaining() < PeerId::SIZE {
        return Err(WireError::Incomplete);
    }
    let mut raw = [0u8; PeerId::SIZE];
    buf.copy_to_slice(&mut raw);
    Ok(PeerId::from_bytes(raw))
}

pub(crate) fn get_i32(buf: &mut Bytes) -> Result<i32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Incomplete);
    }
    Ok(buf.get_i32())
}

/// Read an element count and check that `element_size * count` bytes can
/// still follow.
pub(crate) fn get_count(buf: &mut Bytes, element_size: usize) -> Result<usize, WireError> {
    let count = get_i32(buf)?;
    if count < 0 {
        return Err(WireError::Count(count));
    }
    let count = count as usize;
    if count.saturating_mul(element_size) > buf.remaining() {
        return Err(WireError::Incomplete);
    }
    Ok(count)
}

pub(crate) fn put_count(buf: &mut BytesMut, count: usize) {
    buf.put_i32(i32::try_from(count).unwrap_or(i32::MAX));
}

/// Length-prefixed byte string
pub(crate) fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub(crate) fn get_bytes(buf: &mut Bytes) -> Result<Bytes, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Incomplete);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WireError::Incomplete);
    }
    Ok(buf.split_to(len))
}

pub(crate) fn put_tree(buf: &mut BytesMut, tree: &Tree<PeerId>) {
    put_peer(buf, &tree.value);
    put_count(buf, tree.subtrees.len());
    for subtree in &tree.subtrees {
        put_tree(buf, subtree);
    }
}

pub(crate) fn get_tree(buf: &mut Bytes) -> Result<Tree<PeerId>, WireError> {
    get_tree_at_depth(buf, 1)
}

fn get_tree_at_depth(buf: &mut Bytes, depth: usize) -> Result<Tree<PeerId>, WireError> {
    if depth > MAX_TREE_DEPTH {
        return Err(WireError::TreeDepth(MAX_TREE_DEPTH));
    }
    let value = get_peer(buf)?;
    let child_count = get_count(buf, TREE_VERTEX_SIZE)?;
    let mut subtrees = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        subtrees.push(get_tree_at_depth(buf, depth + 1)?);
    }
    Ok(Tree::with_subtrees(value, subtrees))
}

/// Fail if a body has trailing bytes
pub(crate) fn expect_end(buf: &Bytes) -> Result<(), WireError> {
    if buf.has_remaining() {
        Err(WireError::Malformed)
    } else {
        Ok(())
    }
}
