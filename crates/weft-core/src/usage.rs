// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Region usages and the pairwise dependence analysis.

use crate::ident::RedopId;

/// Privilege a user holds over the fields it touches.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Privilege {
    /// No access at all; never interferes.
    NoAccess,
    /// Read-only access.
    ReadOnly,
    /// Full read-write access.
    ReadWrite,
    /// Write access that discards prior contents.
    WriteDiscard,
    /// Reduction access under a specific operator.
    Reduce,
}

/// Coherence the user demands relative to other users of the same fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Coherence {
    /// Strict serialization against interfering users.
    Exclusive,
    /// Interfering users serialize through a reservation, not an event.
    Atomic,
    /// Interfering users may run at the same time.
    Simultaneous,
    /// No ordering demanded at all.
    Relaxed,
}

/// Privilege, coherence, and reduction operator of a single user.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionUsage {
    /// Access privilege.
    pub privilege: Privilege,
    /// Demanded coherence.
    pub coherence: Coherence,
    /// Reduction operator; [`RedopId::NONE`] unless `privilege` is reduce.
    pub redop: RedopId,
}

impl RegionUsage {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(privilege: Privilege, coherence: Coherence, redop: RedopId) -> Self {
        Self {
            privilege,
            coherence,
            redop,
        }
    }

    /// Read-only exclusive usage.
    #[must_use]
    pub fn read_only() -> Self {
        Self::new(Privilege::ReadOnly, Coherence::Exclusive, RedopId::NONE)
    }

    /// Read-write exclusive usage.
    #[must_use]
    pub fn read_write() -> Self {
        Self::new(Privilege::ReadWrite, Coherence::Exclusive, RedopId::NONE)
    }

    /// Reducing exclusive usage under `redop`.
    #[must_use]
    pub fn reduce(redop: RedopId) -> Self {
        Self::new(Privilege::Reduce, Coherence::Exclusive, redop)
    }

    /// True for no-access users.
    #[must_use]
    pub fn is_no_access(&self) -> bool {
        self.privilege == Privilege::NoAccess
    }

    /// True for read-only users.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.privilege == Privilege::ReadOnly
    }

    /// True for users that write (including discards), excluding reductions.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self.privilege, Privilege::ReadWrite | Privilege::WriteDiscard)
    }

    /// True for reduction users.
    #[must_use]
    pub fn is_reduce(&self) -> bool {
        self.privilege == Privilege::Reduce
    }

    /// True when the user demands atomic coherence.
    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.coherence == Coherence::Atomic
    }

    /// True when the user demands exclusive coherence.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.coherence == Coherence::Exclusive
    }
}

/// Outcome of the pairwise dependence test.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DependenceKind {
    /// The pair does not interfere.
    None,
    /// Interference downgraded by mutual atomic coherence; a reservation
    /// serializes the pair instead of an event.
    Atomic,
    /// Interference downgraded by simultaneous/relaxed coherence.
    Simultaneous,
    /// Read-after-write or write-after-write ordering is required.
    True,
    /// Write-after-read ordering is required.
    Anti,
}

impl DependenceKind {
    /// True for the two kinds that force an event dependency.
    #[must_use]
    pub fn is_ordering(self) -> bool {
        matches!(self, Self::True | Self::Anti)
    }
}

/// Pairwise dependence of a later user (`next`) on an earlier one (`prev`).
///
/// Only [`DependenceKind::True`] and [`DependenceKind::Anti`] oblige the
/// later user to wait; atomic and simultaneous results mean "interferes, but
/// coherence says events are not the mechanism".
#[must_use]
pub fn check_dependence(prev: &RegionUsage, next: &RegionUsage) -> DependenceKind {
    if prev.is_no_access() || next.is_no_access() {
        return DependenceKind::None;
    }
    if prev.is_read_only() && next.is_read_only() {
        return DependenceKind::None;
    }
    if prev.is_reduce() && next.is_reduce() {
        if prev.redop == next.redop {
            return DependenceKind::None;
        }
        return DependenceKind::True;
    }
    // Interfering pair; coherence decides the flavor. Exclusive on either
    // side wins, then atomic, then simultaneous/relaxed.
    if prev.is_exclusive() || next.is_exclusive() {
        if prev.is_read_only() || prev.is_reduce() {
            return DependenceKind::Anti;
        }
        return DependenceKind::True;
    }
    if prev.is_atomic() && next.is_atomic() {
        return DependenceKind::Atomic;
    }
    DependenceKind::Simultaneous
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(p: Privilege, c: Coherence, r: u32) -> RegionUsage {
        RegionUsage::new(p, c, RedopId(r))
    }

    #[test]
    fn readers_never_interfere() {
        let r = RegionUsage::read_only();
        assert_eq!(check_dependence(&r, &r), DependenceKind::None);
    }

    #[test]
    fn same_op_reducers_never_interfere() {
        let a = RegionUsage::reduce(RedopId(4));
        let b = RegionUsage::reduce(RedopId(4));
        assert_eq!(check_dependence(&a, &b), DependenceKind::None);
        let c = RegionUsage::reduce(RedopId(5));
        assert_eq!(check_dependence(&a, &c), DependenceKind::True);
    }

    #[test]
    fn writer_after_reader_is_anti() {
        let read = RegionUsage::read_only();
        let write = RegionUsage::read_write();
        assert_eq!(check_dependence(&read, &write), DependenceKind::Anti);
        assert_eq!(check_dependence(&write, &read), DependenceKind::True);
        assert_eq!(check_dependence(&write, &write), DependenceKind::True);
    }

    #[test]
    fn reducer_then_writer_is_anti() {
        let red = RegionUsage::reduce(RedopId(2));
        let write = RegionUsage::read_write();
        assert_eq!(check_dependence(&red, &write), DependenceKind::Anti);
    }

    #[test]
    fn coherence_downgrades() {
        let a = usage(Privilege::ReadWrite, Coherence::Atomic, 0);
        assert_eq!(check_dependence(&a, &a), DependenceKind::Atomic);
        let s = usage(Privilege::ReadWrite, Coherence::Simultaneous, 0);
        assert_eq!(check_dependence(&s, &s), DependenceKind::Simultaneous);
        // Exclusive on either side forces a real ordering.
        let e = RegionUsage::read_write();
        assert_eq!(check_dependence(&a, &e), DependenceKind::True);
        // Mixed atomic/simultaneous falls through to simultaneous.
        assert_eq!(check_dependence(&a, &s), DependenceKind::Simultaneous);
    }

    #[test]
    fn no_access_is_inert() {
        let n = usage(Privilege::NoAccess, Coherence::Exclusive, 0);
        let w = RegionUsage::read_write();
        assert_eq!(check_dependence(&n, &w), DependenceKind::None);
        assert_eq!(check_dependence(&w, &n), DependenceKind::None);
    }
}
