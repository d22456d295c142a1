//! Vector register bookkeeping for kernel construction.
//!
//! Kernels hand out vector indices from one arena instead of hard-coding
//! them, so accumulator tiles, injector scratch and helper registers can
//! never silently alias. Exhaustion and double-frees are programmer errors
//! and abort construction.

use std::collections::BTreeSet;
use std::ops::Range;

#[derive(Debug)]
pub struct RegisterArena {
    free: BTreeSet<usize>,
    span: Range<usize>,
}

impl RegisterArena {
    /// Arena over the half-open index range `span`.
    pub fn new(span: Range<usize>) -> Self {
        Self { free: span.clone().collect(), span }
    }

    /// Lowest free index. Accumulators and long-lived helpers come from the
    /// low end so the high end stays dense for transient scratch.
    pub fn take_low(&mut self) -> usize {
        match self.free.pop_first() {
            Some(idx) => idx,
            None => panic!("vector register arena exhausted (span {:?})", self.span),
        }
    }

    /// Highest free index.
    pub fn take_high(&mut self) -> usize {
        match self.free.pop_last() {
            Some(idx) => idx,
            None => panic!("vector register arena exhausted (span {:?})", self.span),
        }
    }

    /// Claim a specific index.
    pub fn reserve(&mut self, idx: usize) {
        if !self.free.remove(&idx) {
            panic!("vector register {idx} is not free (span {:?})", self.span);
        }
    }

    pub fn release(&mut self, idx: usize) {
        if !self.span.contains(&idx) {
            panic!("vector register {idx} is outside the arena span {:?}", self.span);
        }
        if !self.free.insert(idx) {
            panic!("vector register {idx} released twice");
        }
    }

    pub fn remaining(&self) -> usize {
        self.free.len()
    }

    pub fn is_free(&self, idx: usize) -> bool {
        self.free.contains(&idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_from_both_ends() {
        let mut arena = RegisterArena::new(0..16);
        assert_eq!(arena.take_low(), 0);
        assert_eq!(arena.take_low(), 1);
        assert_eq!(arena.take_high(), 15);
        assert_eq!(arena.remaining(), 13);
        arena.release(0);
        assert_eq!(arena.take_low(), 0);
    }

    #[test]
    fn reserve_pins_specific_index() {
        let mut arena = RegisterArena::new(0..8);
        arena.reserve(3);
        assert!(!arena.is_free(3));
        assert_eq!(arena.take_low(), 0);
        arena.release(3);
        assert!(arena.is_free(3));
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn exhaustion_is_fatal() {
        let mut arena = RegisterArena::new(0..2);
        arena.take_low();
        arena.take_high();
        arena.take_low();
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_is_fatal() {
        let mut arena = RegisterArena::new(0..4);
        let idx = arena.take_low();
        arena.release(idx);
        arena.release(idx);
    }
}
