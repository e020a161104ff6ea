/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::HashSet;

use crate::diff::{Action, ActionKind, Diff};
use crate::error::{ErrorKind, Result};
use crate::id::ItemId;
use crate::mapping::{Mappings, SideMappings};
use crate::scanner::Scanner;
use crate::tree::{Item, ItemKind, Tree};

/// The two plans a reconciliation produces. Each is a diff whose payloads
/// are expressed for the side it will be applied to, except where an
/// executor resolves ids late (moves and order notes).
#[derive(Clone, Debug, Default)]
pub struct Plans {
    pub server: Diff,
    pub local: Diff,
}

/// A pairing of a local id with its server counterpart, discovered during
/// reconciliation.
pub type Pairing = (ItemKind, ItemId, ItemId);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReconcileCounts {
    /// Concurrent creations recognized as the same item.
    pub merged_creations: u64,
    /// Server moves undone to break a hierarchy reversal.
    pub reverted_moves: u64,
    /// Server moves dropped because the local move wins.
    pub dropped_moves: u64,
    /// Server updates dropped because the local update wins.
    pub dropped_updates: u64,
    /// Removals suppressed on either side.
    pub dropped_removals: u64,
}

/// Turns the two per-side diffs into two plans under a fixed precedence
/// rule: on a content conflict, the local edit wins.
///
/// The reconciler walks the local diff to build the server plan, reading
/// the server diff to detect conflicts, then does the inverse for the local
/// plan. Removals never propagate, since removal policy belongs to a layer
/// above this one, and order notes are left to the reorder pass, which runs
/// once both plans are otherwise final.
///
/// Both trees are borrowed read-only for the whole reconciliation, and the
/// mapping snapshot is immutable; pairings discovered along the way are
/// collected on the side and queued into the store by the caller.
pub struct Reconciler<'t> {
    local_tree: &'t Tree,
    server_tree: &'t Tree,
    mappings: &'t Mappings,
    new_mappings: Vec<Pairing>,
    absorbed_local: HashSet<(ItemKind, ItemId)>,
    absorbed_server: HashSet<(ItemKind, ItemId)>,
    counts: ReconcileCounts,
}

impl<'t> Reconciler<'t> {
    pub fn new(local_tree: &'t Tree, server_tree: &'t Tree, mappings: &'t Mappings) -> Reconciler<'t> {
        Reconciler {
            local_tree,
            server_tree,
            mappings,
            new_mappings: Vec::new(),
            absorbed_local: HashSet::new(),
            absorbed_server: HashSet::new(),
            counts: ReconcileCounts::default(),
        }
    }

    pub fn reconcile(&mut self, local_diff: &Diff, server_diff: &Diff) -> Result<Plans> {
        debug!(
            "Reconciling {} local against {} server actions",
            local_diff.len(),
            server_diff.len()
        );
        let server = self.build_server_plan(local_diff, server_diff)?;
        let local = self.build_local_plan(server_diff, local_diff)?;
        Ok(Plans { server, local })
    }

    /// Pairings discovered by this reconciliation, in the order they were
    /// recorded.
    pub fn new_mappings(&self) -> &[Pairing] {
        &self.new_mappings
    }

    pub fn counts(&self) -> &ReconcileCounts {
        &self.counts
    }

    /// Mirrors local changes into the server plan.
    fn build_server_plan(&mut self, local_diff: &Diff, server_diff: &Diff) -> Result<Diff> {
        let mut plan = Diff::new();
        for action in local_diff.actions() {
            match action {
                Action::Create { payload } => {
                    let key = (payload.kind(), payload.id().clone());
                    if self.absorbed_local.contains(&key) {
                        trace!("Item {} was created on both sides; nothing to mirror", payload);
                        continue;
                    }
                    if let Some(server_item) = self.find_concurrent_creation(payload, server_diff) {
                        debug!(
                            "Items {} and {} are the same concurrent creation; pairing",
                            payload, server_item
                        );
                        self.pair_subtrees(payload, &server_item);
                        continue;
                    }
                    plan.commit(action.clone());
                },
                Action::Move { payload, .. } => {
                    if payload.is_folder() {
                        self.compensate_crossing_moves(payload, local_diff, server_diff, &mut plan)?;
                    }
                    plan.commit(action.clone());
                },
                Action::Update { .. } => plan.commit(action.clone()),
                Action::Remove { payload } => {
                    trace!("Removal of {} stays local; removals don't propagate", payload);
                    self.counts.dropped_removals += 1;
                },
                Action::Reorder { .. } => {},
            }
        }
        Ok(plan)
    }

    /// Mirrors server changes into the local plan. The inverse of
    /// `build_server_plan`, with the precedence rule applied: conflicting
    /// server edits are dropped instead of compensated.
    fn build_local_plan(&mut self, server_diff: &Diff, local_diff: &Diff) -> Result<Diff> {
        let mut plan = Diff::new();
        for action in server_diff.actions() {
            match action {
                Action::Create { payload } => {
                    let key = (payload.kind(), payload.id().clone());
                    if self.absorbed_server.contains(&key) {
                        trace!("Item {} was created on both sides; nothing to mirror", payload);
                        continue;
                    }
                    plan.commit(action.clone());
                },
                Action::Move { payload, .. } => {
                    let crossing = payload.is_folder()
                        && local_diff.actions_of(ActionKind::Move).any(|local_action| {
                            local_action.payload().is_folder()
                                && self.is_hierarchy_reversal(local_action.payload(), payload)
                        });
                    if crossing {
                        debug!("Dropping server move of {}; the local move wins", payload);
                        self.counts.dropped_moves += 1;
                        continue;
                    }
                    if self.moved_locally(payload, local_diff) {
                        debug!(
                            "Dropping server move of {}; the item also moved locally",
                            payload
                        );
                        self.counts.dropped_moves += 1;
                        continue;
                    }
                    plan.commit(action.clone());
                },
                Action::Update { payload, .. } => {
                    if self.updated_locally(payload, local_diff) {
                        debug!(
                            "Dropping server update of {}; the local update wins",
                            payload
                        );
                        self.counts.dropped_updates += 1;
                        continue;
                    }
                    plan.commit(action.clone());
                },
                Action::Remove { payload } => {
                    trace!("Removal of {} stays on the server; removals don't propagate", payload);
                    self.counts.dropped_removals += 1;
                },
                Action::Reorder { .. } => {},
            }
        }
        Ok(plan)
    }

    /// Looks for a server-side creation of the same logical item: one whose
    /// content merges with the local payload's, under the folder paired with
    /// the local payload's parent. Parents created earlier in the same run
    /// count, so concurrently created subtrees chain.
    fn find_concurrent_creation(&self, payload: &Item, server_diff: &Diff) -> Option<Item> {
        let local_parent = payload.parent_id()?;
        for action in server_diff.actions_of(ActionKind::Create) {
            let server_item = action.payload();
            let key = (server_item.kind(), server_item.id().clone());
            if self.absorbed_server.contains(&key) {
                continue;
            }
            if !payload.can_merge_with(server_item) {
                continue;
            }
            let server_parent = match server_item.parent_id() {
                Some(server_parent) => server_parent,
                None => continue,
            };
            match self.local_for(ItemKind::Folder, server_parent) {
                Some(mapped) if &mapped == local_parent => {
                    return Some(server_item.clone());
                },
                _ => {},
            }
        }
        None
    }

    /// Records the pairing of two subtrees believed to be the same, pairing
    /// the two roots unconditionally and descending into children matched by
    /// content. Residual children on either side are left for the next run,
    /// which sees them through the then-persisted pairings.
    fn pair_subtrees(&mut self, local_item: &Item, server_item: &Item) {
        self.record_pairing(local_item.kind(), local_item.id().clone(), server_item.id().clone());
        if !local_item.is_folder() || !server_item.is_folder() {
            return;
        }
        let local_node = self.local_tree.folder_for(local_item.id());
        let server_node = self.server_tree.folder_for(server_item.id());
        let (local_node, server_node) = match (local_node, server_node) {
            (Some(local_node), Some(server_node)) => (local_node, server_node),
            _ => {
                warn!(
                    "Folder pair {} and {} missing from its tree; pairing the roots only",
                    local_item, server_item
                );
                return;
            },
        };
        let mut claimed = HashSet::new();
        for local_child in local_node.children() {
            if self
                .server_for(local_child.kind(), local_child.id())
                .is_some()
            {
                trace!("Not pairing {}; it's already mapped", local_child);
                continue;
            }
            let matched = server_node.children().find(|server_child| {
                !claimed.contains(&(server_child.kind(), server_child.id().clone()))
                    && self.local_for(server_child.kind(), server_child.id()).is_none()
                    && local_child.item().can_merge_with(server_child.item())
            });
            if let Some(server_child) = matched {
                claimed.insert((server_child.kind(), server_child.id().clone()));
                self.pair_subtrees(local_child.item(), server_child.item());
            } else {
                trace!(
                    "Child {} of {} has no counterpart in {}",
                    local_child,
                    local_item,
                    server_item
                );
            }
        }
    }

    fn record_pairing(&mut self, kind: ItemKind, local_id: ItemId, server_id: ItemId) {
        trace!("Pairing {} {} with {}", kind, local_id, server_id);
        self.absorbed_local.insert((kind, local_id.clone()));
        self.absorbed_server.insert((kind, server_id.clone()));
        self.new_mappings.push((kind, local_id, server_id));
        self.counts.merged_creations += 1;
    }

    /// Reverts every server folder move that crosses the given local folder
    /// move, committing a compensating move into the server plan ahead of
    /// the local move it yields to.
    fn compensate_crossing_moves(
        &mut self,
        local_payload: &Item,
        local_diff: &Diff,
        server_diff: &Diff,
        plan: &mut Diff,
    ) -> Result<()> {
        for server_action in server_diff.actions_of(ActionKind::Move) {
            let (server_payload, server_old, server_index, server_old_index) = match server_action {
                Action::Move {
                    payload,
                    old,
                    index,
                    old_index,
                } => (payload, old, *index, *old_index),
                _ => continue,
            };
            if !server_payload.is_folder() {
                continue;
            }
            if !self.is_hierarchy_reversal(local_payload, server_payload) {
                continue;
            }
            let server_id = server_payload.id();
            debug!(
                "Moves of {} and {} would form a cycle together; reverting the server's",
                local_payload, server_payload
            );
            let already_planned = plan
                .actions_of(ActionKind::Move)
                .any(|planned| planned.payload().id() == server_id);
            if already_planned {
                trace!("Server move of {} already reverted", server_payload);
                continue;
            }
            let moved_locally = match self.local_for(ItemKind::Folder, server_id) {
                Some(local_id) => local_diff.actions_of(ActionKind::Move).any(|local_action| {
                    local_action.payload().is_folder() && *local_action.payload().id() == local_id
                }),
                None => false,
            };
            if moved_locally {
                trace!(
                    "Local move of {} already rearranges it; not reverting",
                    server_payload
                );
                continue;
            }
            let restore_parent = match server_old.parent_id() {
                Some(parent_id) => parent_id,
                None => continue,
            };
            if self.server_tree.is_descendant_or_self(restore_parent, server_id) {
                return Err(ErrorKind::HierarchyReversalUnresolvable(
                    local_payload.id().clone(),
                    server_id.clone(),
                )
                .into());
            }
            // The revert puts the folder back where the server had it; its
            // pre-state is the server's move expressed in local ids, so the
            // plan reads as one more local action.
            let mut reverted_old = server_payload.clone_item(false);
            reverted_old.translate(&self.effective_server_to_local());
            plan.commit(Action::Move {
                payload: server_old.clone_item(false),
                old: reverted_old,
                index: server_old_index,
                old_index: server_index,
            });
            self.counts.reverted_moves += 1;
        }
        Ok(())
    }

    /// Two concurrent folder moves form a hierarchy reversal when each one
    /// drags its subject into a subtree the other is relocating: some
    /// ancestor of the local destination maps into the server subject's
    /// subtree, and some ancestor of the server destination maps back into
    /// the local subject's.
    fn is_hierarchy_reversal(&self, local_payload: &Item, server_payload: &Item) -> bool {
        let local_destination = match local_payload.parent_id() {
            Some(parent_id) => parent_id,
            None => return false,
        };
        let server_destination = match server_payload.parent_id() {
            Some(parent_id) => parent_id,
            None => return false,
        };

        let mut outbound = false;
        let mut ancestor = self.local_tree.folder_for(local_destination);
        while let Some(node) = ancestor {
            if let Some(server_id) = self.server_for(ItemKind::Folder, node.id()) {
                if self
                    .server_tree
                    .is_descendant_or_self(&server_id, server_payload.id())
                {
                    outbound = true;
                    break;
                }
            }
            ancestor = node.parent();
        }
        if !outbound {
            return false;
        }

        let mut ancestor = self.server_tree.folder_for(server_destination);
        while let Some(node) = ancestor {
            if let Some(local_id) = self.local_for(ItemKind::Folder, node.id()) {
                if self
                    .local_tree
                    .is_descendant_or_self(&local_id, local_payload.id())
                {
                    return true;
                }
            }
            ancestor = node.parent();
        }
        false
    }

    fn moved_locally(&self, server_payload: &Item, local_diff: &Diff) -> bool {
        let kind = server_payload.kind();
        let local_id = match self.local_for(kind, server_payload.id()) {
            Some(local_id) => local_id,
            None => return false,
        };
        local_diff.actions_of(ActionKind::Move).any(|action| {
            action.payload().kind() == kind && *action.payload().id() == local_id
        })
    }

    fn updated_locally(&self, server_payload: &Item, local_diff: &Diff) -> bool {
        let kind = server_payload.kind();
        let local_id = self
            .local_for(kind, server_payload.id())
            .unwrap_or_else(|| server_payload.id().clone());
        local_diff.actions_of(ActionKind::Update).any(|action| {
            action.payload().kind() == kind && *action.payload().id() == local_id
        })
    }

    fn server_for(&self, kind: ItemKind, local_id: &ItemId) -> Option<ItemId> {
        self.new_mappings
            .iter()
            .rev()
            .find(|(mapped_kind, mapped_local, _)| *mapped_kind == kind && mapped_local == local_id)
            .map(|(_, _, server_id)| server_id.clone())
            .or_else(|| self.mappings.server_id(kind, local_id).cloned())
    }

    fn local_for(&self, kind: ItemKind, server_id: &ItemId) -> Option<ItemId> {
        self.new_mappings
            .iter()
            .rev()
            .find(|(mapped_kind, _, mapped_server)| *mapped_kind == kind && mapped_server == server_id)
            .map(|(_, local_id, _)| local_id.clone())
            .or_else(|| self.mappings.local_id(kind, server_id).cloned())
    }

    fn effective_server_to_local(&self) -> SideMappings {
        let mut side = self.mappings.server_to_local.clone();
        for (kind, local_id, server_id) in &self.new_mappings {
            match kind {
                ItemKind::Folder => side.folders.insert(server_id.clone(), local_id.clone()),
                ItemKind::Bookmark => side.bookmarks.insert(server_id.clone(), local_id.clone()),
            };
        }
        side
    }
}

/// Pairs the two trees of a first sync by content, before any mapping
/// exists. Both directions are scanned with a recording merge predicate; the
/// union prefers the pairing seen first in walk order, and the two roots are
/// always paired. Returns the two diffs the scans produced alongside the
/// accepted pairings.
pub fn propose_pairings(
    local_tree: &Tree,
    server_tree: &Tree,
    preserve_order: bool,
) -> Result<(Diff, Diff, Vec<Pairing>)> {
    let mut outbound = Vec::new();
    let local_diff = Scanner::new(
        server_tree,
        local_tree,
        |old: &Item, new: &Item| {
            if old.can_merge_with(new) {
                outbound.push((new.kind(), new.id().clone(), old.id().clone()));
                true
            } else {
                false
            }
        },
        preserve_order,
        // Hashes never agree across coordinate systems on a first sync.
        false,
    )
    .scan()?;

    let mut inbound = Vec::new();
    let server_diff = Scanner::new(
        local_tree,
        server_tree,
        |old: &Item, new: &Item| {
            if old.can_merge_with(new) {
                inbound.push((old.kind(), old.id().clone(), new.id().clone()));
                true
            } else {
                false
            }
        },
        preserve_order,
        false,
    )
    .scan()?;

    let local_root = local_tree.root().id().clone();
    let server_root = server_tree.root().id().clone();
    let mut claimed_local = HashSet::new();
    let mut claimed_server = HashSet::new();
    claimed_local.insert((ItemKind::Folder, local_root.clone()));
    claimed_server.insert((ItemKind::Folder, server_root.clone()));
    let mut accepted = vec![(ItemKind::Folder, local_root, server_root)];

    for (kind, local_id, server_id) in outbound.into_iter().chain(inbound) {
        if claimed_local.contains(&(kind, local_id.clone()))
            || claimed_server.contains(&(kind, server_id.clone()))
        {
            trace!(
                "Skipping conflicting {} pairing {} ↔ {}; an earlier pairing wins",
                kind,
                local_id,
                server_id
            );
            continue;
        }
        claimed_local.insert((kind, local_id.clone()));
        claimed_server.insert((kind, server_id.clone()));
        accepted.push((kind, local_id, server_id));
    }
    debug!("Accepted {} first-sync pairings", accepted.len());
    Ok((local_diff, server_diff, accepted))
}
