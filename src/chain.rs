//! Intrusive doubly-linked chains over index-addressed arenas.
//!
//! A [`Chain`] stores only head/tail indices; the per-node [`Link`] values
//! are embedded in the arena that owns the nodes and are reached through the
//! [`Links`] accessor trait. All operations are O(1) except
//! [`insert_ordered`] and none of them synchronize internally -- callers
//! supply interrupt-disable or lock discipline.

use core::fmt;

/// Index value that terminates a chain.
pub(crate) const NIL: usize = usize::MAX;

/// Marker stored in `next` while a node is not on any chain.
///
/// Lets wait-queue arbitration test membership in O(1): whichever of two
/// racing sides extracts a node first flips it off-chain, the loser observes
/// that and backs off.
const OFF_CHAIN: usize = usize::MAX - 1;

/// Chain linkage embedded in an arena slot.
#[derive(Clone, Copy)]
pub struct Link {
    prev: usize,
    next: usize,
}

impl Link {
    pub const fn new() -> Link {
        Link {
            prev: NIL,
            next: OFF_CHAIN,
        }
    }

    /// Is this node currently on some chain?
    pub fn is_queued(&self) -> bool {
        self.next != OFF_CHAIN
    }

    fn set_off_chain(&mut self) {
        self.next = OFF_CHAIN;
        self.prev = NIL;
    }
}

impl Default for Link {
    fn default() -> Self {
        Link::new()
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_queued() {
            write!(f, "Link {{ prev={}, next={} }}", self.prev, self.next)
        } else {
            write!(f, "Link {{ off-chain }}")
        }
    }
}

/// Access to the `Link` embedded in arena slot `index`.
pub trait Links {
    fn link(&self, index: usize) -> &Link;
    fn link_mut(&mut self, index: usize) -> &mut Link;
}

/// An intrusive doubly-linked list addressed by arena indices.
#[derive(Debug)]
pub struct Chain {
    first: usize,
    last: usize,
}

impl Chain {
    pub const fn new() -> Chain {
        Chain {
            first: NIL,
            last: NIL,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first == NIL
    }

    pub fn first(&self) -> Option<usize> {
        (self.first != NIL).then_some(self.first)
    }

    pub fn last(&self) -> Option<usize> {
        (self.last != NIL).then_some(self.last)
    }

    /// Successor of `node` on this chain.
    pub fn next<L: Links + ?Sized>(&self, links: &L, node: usize) -> Option<usize> {
        let next = links.link(node).next;
        debug_assert!(next != OFF_CHAIN, "walking an off-chain node");
        (next != NIL).then_some(next)
    }

    /// Appends `node` at the tail. Returns whether the chain was empty.
    pub fn append<L: Links + ?Sized>(&mut self, links: &mut L, node: usize) -> bool {
        debug_assert!(!links.link(node).is_queued(), "node already queued");
        let was_empty = self.is_empty();
        let link = links.link_mut(node);
        link.next = NIL;
        link.prev = self.last;
        if was_empty {
            self.first = node;
        } else {
            links.link_mut(self.last).next = node;
        }
        self.last = node;
        was_empty
    }

    /// Prepends `node` at the head. Returns whether the chain was empty.
    pub fn prepend<L: Links + ?Sized>(&mut self, links: &mut L, node: usize) -> bool {
        debug_assert!(!links.link(node).is_queued(), "node already queued");
        let was_empty = self.is_empty();
        let link = links.link_mut(node);
        link.prev = NIL;
        link.next = self.first;
        if was_empty {
            self.last = node;
        } else {
            links.link_mut(self.first).prev = node;
        }
        self.first = node;
        was_empty
    }

    /// Inserts `node` immediately before `before`, which must be queued.
    pub fn insert_before<L: Links + ?Sized>(&mut self, links: &mut L, before: usize, node: usize) {
        debug_assert!(links.link(before).is_queued());
        debug_assert!(!links.link(node).is_queued(), "node already queued");
        let prev = links.link(before).prev;
        let link = links.link_mut(node);
        link.prev = prev;
        link.next = before;
        links.link_mut(before).prev = node;
        if prev == NIL {
            self.first = node;
        } else {
            links.link_mut(prev).next = node;
        }
    }

    /// Unlinks `node` from the chain. Returns whether the chain is now empty.
    ///
    /// Extracting a node that is not queued is a call-discipline violation;
    /// it is caught by a debug assertion only.
    pub fn extract<L: Links + ?Sized>(&mut self, links: &mut L, node: usize) -> bool {
        debug_assert!(links.link(node).is_queued(), "extracting off-chain node");
        let Link { prev, next } = *links.link(node);
        if prev == NIL {
            self.first = next;
        } else {
            links.link_mut(prev).next = next;
        }
        if next == NIL {
            self.last = prev;
        } else {
            links.link_mut(next).prev = prev;
        }
        links.link_mut(node).set_off_chain();
        self.is_empty()
    }

    /// Removes and returns the head, with whether the chain is now empty.
    pub fn pop_first<L: Links + ?Sized>(&mut self, links: &mut L) -> Option<(usize, bool)> {
        let first = self.first()?;
        let now_empty = self.extract(links, first);
        Some((first, now_empty))
    }
}

impl Default for Chain {
    fn default() -> Self {
        Chain::new()
    }
}

/// Inserts `node` before the first queued node whose key is strictly greater
/// than its own, appending otherwise.
///
/// Equal keys therefore stay FIFO by arrival. The walk is O(length); the two
/// users of this (priority wait queues and the simple SMP scheduler chains)
/// document that cost.
pub fn insert_ordered<L, K>(chain: &mut Chain, links: &mut L, node: usize, key: K)
where
    L: Links + ?Sized,
    K: Fn(&L, usize) -> u64,
{
    let node_key = key(links, node);
    let mut cursor = chain.first();
    while let Some(current) = cursor {
        if key(links, current) > node_key {
            chain.insert_before(links, current, node);
            return;
        }
        cursor = chain.next(links, current);
    }
    chain.append(links, node);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Arena(Vec<Link>);

    impl Arena {
        fn new(n: usize) -> Arena {
            Arena(vec![Link::new(); n])
        }
    }

    impl Links for Arena {
        fn link(&self, index: usize) -> &Link {
            &self.0[index]
        }
        fn link_mut(&mut self, index: usize) -> &mut Link {
            &mut self.0[index]
        }
    }

    fn collect(chain: &Chain, arena: &Arena) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = chain.first();
        while let Some(n) = cursor {
            out.push(n);
            cursor = chain.next(arena, n);
        }
        out
    }

    #[test]
    fn append_extract_roundtrip() {
        let mut arena = Arena::new(4);
        let mut chain = Chain::new();

        assert!(chain.append(&mut arena, 0));
        assert!(!chain.append(&mut arena, 1));
        assert!(!chain.append(&mut arena, 2));
        assert_eq!(collect(&chain, &arena), vec![0, 1, 2]);

        assert!(!chain.extract(&mut arena, 1));
        assert_eq!(collect(&chain, &arena), vec![0, 2]);
        assert!(!arena.link(1).is_queued());

        assert!(!chain.extract(&mut arena, 0));
        assert!(chain.extract(&mut arena, 2));
        assert!(chain.is_empty());
    }

    #[test]
    fn prepend_and_pop() {
        let mut arena = Arena::new(3);
        let mut chain = Chain::new();

        chain.prepend(&mut arena, 0);
        chain.prepend(&mut arena, 1);
        chain.prepend(&mut arena, 2);
        assert_eq!(collect(&chain, &arena), vec![2, 1, 0]);

        assert_eq!(chain.pop_first(&mut arena), Some((2, false)));
        assert_eq!(chain.pop_first(&mut arena), Some((1, false)));
        assert_eq!(chain.pop_first(&mut arena), Some((0, true)));
        assert_eq!(chain.pop_first(&mut arena), None);
    }

    #[test]
    fn ordered_insert_is_fifo_within_key() {
        // Keys by index: 0->5, 1->5, 2->3, 3->9
        let keys = [5u64, 5, 3, 9];
        let mut arena = Arena::new(4);
        let mut chain = Chain::new();
        for node in 0..4 {
            insert_ordered(&mut chain, &mut arena, node, |_, i| keys[i]);
        }
        // 3 first (lowest key), the two 5s in arrival order, 9 last.
        assert_eq!(collect(&chain, &arena), vec![2, 0, 1, 3]);
    }
}
