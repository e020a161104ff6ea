/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Marque keeps a tree of named, URL-bearing items synchronized between a
//! local store and a remote server. The crate is the merge engine in the
//! middle: given the two trees, the identifier mappings recorded by the last
//! successful sync, and the tree that sync left behind, it computes one plan
//! to apply to the server and one to apply locally. Adapters own the I/O on
//! either side; see the `store` module for the seams.

#[macro_use]
extern crate failure_derive;

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
mod test_support;

mod diff;
mod error;
mod id;
mod mapping;
mod merge;
mod reorder;
mod scanner;
mod store;
mod tree;

pub use crate::diff::{Action, ActionKind, Diff};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::id::{ItemId, ROOT_ID};
pub use crate::mapping::{MappingTable, Mappings, SideMappings};
pub use crate::merge::{propose_pairings, Pairing, Plans, ReconcileCounts, Reconciler};
pub use crate::reorder::reconcile_reorderings;
pub use crate::scanner::{never_merge, Scanner};
pub use crate::store::{apply_plan, sync, BulkAssignments, Store, SyncOptions};
pub use crate::tree::{
    Bookmark, Folder, Item, ItemKind, Node, OrderTarget, Subtree, Tree,
};
