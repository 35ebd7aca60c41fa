// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! weft-core: field-granularity dependency engine for a distributed task
//! runtime.
//!
//! The engine decides, for every task or copy that touches a region of
//! data, which prior operations it must wait for, and records its
//! completion so later operations can compute their own preconditions. Its
//! unit of state is the *view*: a cluster-replicated, reference-counted
//! object over a physical allocation (or a deferred stand-in for one),
//! carrying per-field, per-event user epochs.
//!
//! # Architecture
//!
//! - [`user`] holds the epoch tables, the primitive everything else is
//!   built on.
//! - [`views`] holds the four view kinds and their analyzers/planners.
//! - [`runtime`] is the per-node directory and wire dispatcher; [`wire`]
//!   the length-checked frame format.
//! - The region tree, allocation manager, and transport are collaborator
//!   traits ([`region::RegionTree`], [`manager::Allocation`],
//!   [`runtime::Transport`]); the engine computes orderings and hands the
//!   manager typed work items, it never moves bytes itself.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::module_name_repetitions
)]

pub mod collect;
pub mod event;
pub mod ident;
pub mod manager;
pub mod mask;
pub mod region;
pub mod runtime;
pub mod usage;
pub mod user;
pub mod views;
pub mod wire;

pub use collect::{RefLedger, ReferenceKind};
pub use event::{compute_event_sets, Event, EventSet, EventTable, UserEvent};
pub use ident::{
    AllocId, ChildColor, ContextId, FieldId, RedopId, RegionHandle, SpaceId, ViewId, ViewKind,
};
pub use manager::{Allocation, CopyField, Reservation, VersionInfo};
pub use mask::{FieldMask, MAX_FIELDS};
pub use region::RegionTree;
pub use runtime::{EngineError, Runtime, Transport};
pub use usage::{check_dependence, Coherence, DependenceKind, Privilege, RegionUsage};
pub use user::{EpochTables, EventUsers, FieldVersions, PhysicalUser};
pub use views::{
    CaptureState, CompositeNode, CompositeView, FillView, LogicalView, MaterializedView,
    ReductionView, Simplified,
};
pub use wire::{Message, UpdatePayload, WireError};
