// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Interface to the external region tree.
//!
//! The engine never walks region domains itself; it asks the tree the small
//! set of structural questions the analysis needs. Production embeds the
//! real color-addressed tree here; tests use the table-driven tree from
//! `weft-testkit`.

use crate::ident::{ChildColor, RegionHandle};

/// Structural queries over the region tree.
pub trait RegionTree: Send + Sync {
    /// Color of `node` within its parent; invalid for a root.
    fn color_of(&self, node: RegionHandle) -> ChildColor;

    /// Parent of `node`, if any.
    fn parent_of(&self, node: RegionHandle) -> Option<RegionHandle>;

    /// Child of `node` at `color`.
    ///
    /// The caller guarantees the color came from a view of this tree;
    /// unknown colors indicate a protocol bug and may panic in test trees.
    fn child_of(&self, node: RegionHandle, color: ChildColor) -> RegionHandle;

    /// True when the two children of `node` cover disjoint domains.
    fn children_disjoint(&self, node: RegionHandle, a: ChildColor, b: ChildColor) -> bool;

    /// True when every pair of children of `node` is disjoint.
    fn all_children_disjoint(&self, node: RegionHandle) -> bool;

    /// True when `node`'s domain contains all of `other`'s.
    fn dominates(&self, node: RegionHandle, other: RegionHandle) -> bool;

    /// True when the domains of `node` and `other` overlap.
    fn intersects(&self, node: RegionHandle, other: RegionHandle) -> bool;
}
