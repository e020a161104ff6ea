/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::{HashMap, HashSet};
use std::mem;

use itertools::{EitherOrBoth, Itertools};

use crate::diff::{Action, Diff};
use crate::error::Result;
use crate::id::ItemId;
use crate::tree::{Item, ItemKind, Node, OrderTarget, Tree};

/// A two-tree differ. The resulting diff, applied in log order to a mutable
/// copy of the old tree, yields a tree structurally equal to the new tree.
///
/// The walk starts at the two roots, which are paired by convention, and
/// recurses through folders paired by id. Children present on only one side
/// of a pair are first offered to the merge predicate, which may pair items
/// whose ids don't relate; whatever stays unpaired becomes a creation or a
/// removal. A second pass folds creations and removals of the same item into
/// moves.
///
/// Emission order: updates, creations and moves in walk order with parents
/// before children; removals afterwards with children before parents, so a
/// folder's removal always trails the move-out of its surviving descendants;
/// order notes last.
pub struct Scanner<'t, F> {
    old_tree: &'t Tree,
    new_tree: &'t Tree,
    merge_item: F,
    preserve_order: bool,
    check_hashes: bool,
    upserts: Vec<Action>,
    removals: Vec<Action>,
    reorders: Vec<Action>,
}

impl<'t, F> Scanner<'t, F>
where
    F: FnMut(&Item, &Item) -> bool,
{
    /// `merge_item(old, new)` decides whether a pair of same-kind items not
    /// related by id is the same logical node. Cached syncs pass a predicate
    /// that always declines; the first-sync merge pairs by content and
    /// records what it paired.
    pub fn new(
        old_tree: &'t Tree,
        new_tree: &'t Tree,
        merge_item: F,
        preserve_order: bool,
        check_hashes: bool,
    ) -> Scanner<'t, F> {
        Scanner {
            old_tree,
            new_tree,
            merge_item,
            preserve_order,
            check_hashes,
            upserts: Vec::new(),
            removals: Vec::new(),
            reorders: Vec::new(),
        }
    }

    pub fn scan(mut self) -> Result<Diff> {
        debug!(
            "Scanning {} old and {} new items",
            self.old_tree.root().count(),
            self.new_tree.root().count()
        );
        let old_root = self.old_tree.root();
        let new_root = self.new_tree.root();
        self.scan_folders(old_root, new_root)?;
        self.fold_moves();

        let mut diff = Diff::new();
        for action in self.upserts {
            diff.commit(action);
        }
        for action in self.removals {
            diff.commit(action);
        }
        for action in self.reorders {
            diff.commit(action);
        }
        Ok(diff)
    }

    /// Walks a pair of folders matched by id, position, or the merge
    /// predicate.
    fn scan_folders(&mut self, old_folder: Node<'t>, new_folder: Node<'t>) -> Result<()> {
        if self.check_hashes && hashes_equal(old_folder.item(), new_folder.item()) {
            trace!("Skipping unchanged subtree of {}", new_folder);
            return Ok(());
        }
        // Roots keep their titles; everything else may be renamed.
        if old_folder.parent().is_some() && old_folder.title() != new_folder.title() {
            trace!("Folder {} retitled as {}", old_folder, new_folder);
            self.upserts.push(Action::Update {
                payload: new_folder.item().clone_item(false),
                old: old_folder.item().clone_item(false),
            });
        }

        let old_children = old_folder.children().collect::<Vec<Node<'t>>>();
        let new_children = new_folder.children().collect::<Vec<Node<'t>>>();

        let new_keys = new_children
            .iter()
            .map(|child| (child.kind(), child.id().clone()))
            .collect::<HashSet<(ItemKind, ItemId)>>();

        // Partition: pairs matched by id, then children only on one side.
        let mut pairs = Vec::new();
        let mut only_new = Vec::new();
        let mut pair_map = HashMap::new();
        for new_child in new_children {
            let matched = old_children.iter().find(|old_child| {
                old_child.kind() == new_child.kind() && old_child.id() == new_child.id()
            });
            match matched {
                Some(old_child) => {
                    pair_map.insert(
                        (new_child.kind(), new_child.id().clone()),
                        new_child.id().clone(),
                    );
                    pairs.push((*old_child, new_child));
                },
                None => only_new.push(new_child),
            }
        }
        let mut only_old = old_children
            .into_iter()
            .filter(|old_child| !new_keys.contains(&(old_child.kind(), old_child.id().clone())))
            .collect::<Vec<Node<'t>>>();

        // Offer unpaired children to the merge predicate before treating
        // them as creations and removals.
        let mut created = Vec::new();
        for new_child in only_new {
            let matched = only_old.iter().position(|old_child| {
                old_child.kind() == new_child.kind()
                    && (self.merge_item)(old_child.item(), new_child.item())
            });
            match matched {
                Some(position) => {
                    let old_child = only_old.remove(position);
                    trace!("Pairing {} with {} by content", old_child, new_child);
                    pair_map.insert(
                        (old_child.kind(), old_child.id().clone()),
                        new_child.id().clone(),
                    );
                    pairs.push((old_child, new_child));
                },
                None => created.push(new_child),
            }
        }

        for (old_child, new_child) in pairs {
            self.scan_pair(old_child, new_child)?;
        }
        for new_child in created {
            self.note_created_subtree(new_child);
        }
        for old_child in only_old {
            self.note_removed_subtree(old_child);
        }

        if self.preserve_order {
            self.note_order_change(old_folder, new_folder, &pair_map);
        }
        Ok(())
    }

    fn scan_pair(&mut self, old_child: Node<'t>, new_child: Node<'t>) -> Result<()> {
        match (old_child.item(), new_child.item()) {
            (Item::Folder(_), Item::Folder(_)) => self.scan_folders(old_child, new_child),
            (Item::Bookmark(old), Item::Bookmark(new)) => {
                if old.title != new.title || old.url != new.url {
                    trace!("Bookmark {} changed to {}", old_child, new_child);
                    self.upserts.push(Action::Update {
                        payload: new_child.item().clone_item(false),
                        old: old_child.item().clone_item(false),
                    });
                }
                Ok(())
            },
            // Pairs are same-kind by construction.
            _ => Ok(()),
        }
    }

    /// Tentatively marks a subtree that only exists in the new tree as
    /// created, parents before children. `fold_moves` rescues the items that
    /// actually moved here.
    fn note_created_subtree(&mut self, node: Node<'t>) {
        trace!("Item {} only exists in the new tree", node);
        self.upserts.push(Action::Create {
            payload: node.item().clone_item(false),
        });
        for child in node.children() {
            self.note_created_subtree(child);
        }
    }

    /// Tentatively marks a subtree that only exists in the old tree as
    /// removed, children before parents.
    fn note_removed_subtree(&mut self, node: Node<'t>) {
        for child in node.children() {
            self.note_removed_subtree(child);
        }
        trace!("Item {} no longer exists in the new tree", node);
        self.removals.push(Action::Remove {
            payload: node.item().clone_item(false),
        });
    }

    /// Matches tentative creations against tentative removals of the same
    /// item. A pair with different parents is a move; a pair with the same
    /// parent sits inside a moved subtree and cancels out, leaving an update
    /// when the item's content changed along the way.
    fn fold_moves(&mut self) {
        let mut removal_keys = HashMap::new();
        for (position, action) in self.removals.iter().enumerate() {
            if let Action::Remove { payload } = action {
                removal_keys.insert((payload.kind(), payload.id().clone()), position);
            }
        }

        let upserts = mem::replace(&mut self.upserts, Vec::new());
        let mut folded = Vec::with_capacity(upserts.len());
        let mut consumed = HashSet::new();
        let mut folder_pairs = Vec::new();
        for action in upserts {
            let payload = match &action {
                Action::Create { payload } => payload,
                _ => {
                    folded.push(action);
                    continue;
                },
            };
            let key = (payload.kind(), payload.id().clone());
            let removal_position = match removal_keys.get(&key) {
                Some(position) => *position,
                None => {
                    folded.push(action);
                    continue;
                },
            };
            let old = match &self.removals[removal_position] {
                Action::Remove { payload } => payload.clone(),
                _ => unreachable!("removal log only holds removals"),
            };
            consumed.insert(removal_position);
            if payload.kind() == ItemKind::Folder {
                folder_pairs.push(key.1.clone());
            }

            let new = payload.clone();
            let changed = match (&old, &new) {
                (Item::Bookmark(old), Item::Bookmark(new)) => {
                    old.title != new.title || old.url != new.url
                },
                _ => old.title() != new.title(),
            };
            if old.parent_id() == new.parent_id() {
                // Same parent on both sides: the containing folder moved, not
                // this item.
                if changed {
                    folded.push(Action::Update { payload: new, old });
                }
            } else {
                trace!("Item {} moved from {}", new, old);
                let index = self.position_of(self.new_tree, &new);
                let old_index = self.position_of(self.old_tree, &old);
                if changed {
                    folded.push(Action::Move {
                        payload: new.clone(),
                        old: old.clone(),
                        index,
                        old_index,
                    });
                    folded.push(Action::Update { payload: new, old });
                } else {
                    folded.push(Action::Move {
                        payload: new,
                        old,
                        index,
                        old_index,
                    });
                }
            }
        }
        self.upserts = folded;
        let removals = mem::replace(&mut self.removals, Vec::new());
        self.removals = removals
            .into_iter()
            .enumerate()
            .filter(|(position, _)| !consumed.contains(position))
            .map(|(_, action)| action)
            .collect();

        // Folders that moved, or rode along inside a moved subtree, never
        // went through the paired walk; their child orders still need
        // comparing.
        if self.preserve_order {
            for folder_id in folder_pairs {
                let old_node = self.old_tree.folder_for(&folder_id);
                let new_node = self.new_tree.folder_for(&folder_id);
                if let (Some(old_node), Some(new_node)) = (old_node, new_node) {
                    let identity = new_node
                        .children()
                        .map(|child| {
                            ((child.kind(), child.id().clone()), child.id().clone())
                        })
                        .collect::<HashMap<(ItemKind, ItemId), ItemId>>();
                    self.note_order_change(old_node, new_node, &identity);
                }
            }
        }
    }

    fn position_of(&self, tree: &Tree, item: &Item) -> Option<usize> {
        let parent = tree.folder_for(item.parent_id()?)?;
        let pos = parent
            .children()
            .position(|child| child.kind() == item.kind() && child.id() == item.id());
        pos
    }

    /// Emits an order note when applying the rest of the diff to the old
    /// folder wouldn't reproduce the new folder's child order. Newly placed
    /// children are appended by application, so the expected order is the
    /// surviving old children followed by the additions.
    fn note_order_change(
        &mut self,
        old_folder: Node<'t>,
        new_folder: Node<'t>,
        pair_map: &HashMap<(ItemKind, ItemId), ItemId>,
    ) {
        let new_keys = new_folder
            .children()
            .map(|child| OrderTarget::new(child.kind(), child.id().clone()))
            .collect::<Vec<OrderTarget>>();
        if new_keys.len() < 2 {
            return;
        }
        let new_set = new_keys.iter().collect::<HashSet<&OrderTarget>>();
        let survivors = old_folder
            .children()
            .filter_map(|child| {
                pair_map
                    .get(&(child.kind(), child.id().clone()))
                    .map(|new_id| OrderTarget::new(child.kind(), new_id.clone()))
            })
            .filter(|target| new_set.contains(target))
            .collect::<Vec<OrderTarget>>();
        let survivor_set = survivors.iter().cloned().collect::<HashSet<OrderTarget>>();
        let additions = new_keys
            .iter()
            .filter(|target| !survivor_set.contains(target));

        let order_changed = survivors
            .iter()
            .chain(additions)
            .zip_longest(new_keys.iter())
            .any(|zipped| match zipped {
                EitherOrBoth::Both(expected, actual) => expected != actual,
                _ => true,
            });
        if order_changed {
            trace!("Folder {} children reordered", new_folder);
            self.reorders.push(Action::Reorder {
                payload: new_folder.item().clone_item(false),
                order: new_keys,
            });
        }
    }
}

fn hashes_equal(old_item: &Item, new_item: &Item) -> bool {
    match (old_item, new_item) {
        (Item::Folder(old), Item::Folder(new)) => match (&old.hash, &new.hash) {
            (Some(old_hash), Some(new_hash)) => old_hash == new_hash,
            _ => false,
        },
        _ => false,
    }
}

/// The merge predicate for cached syncs: ids are authoritative, nothing else
/// pairs.
pub fn never_merge(_old: &Item, _new: &Item) -> bool {
    false
}
