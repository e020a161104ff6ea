/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::HashSet;

use crate::diff::{Action, ActionKind, Diff};
use crate::id::ItemId;
use crate::mapping::SideMappings;
use crate::tree::{ItemKind, OrderTarget, Tree};

/// Commits child-order changes into a plan once it is otherwise final.
///
/// Every folder whose children the plan touches (the destination of a
/// creation or a move) and every folder the source side reordered gets one
/// REORDER carrying the source tree's order for it, with child ids already
/// translated into the target's coordinate system. Entries the mapping can't
/// translate are kept verbatim when the plan itself creates them (an
/// executor resolves those after the creations land) and skipped otherwise,
/// so orders never resurrect items a suppressed removal left behind.
///
/// When both sides reorder the same folder, the local order wins: the
/// server-plan pass runs first, and the folders it reordered are handed to
/// the local-plan pass as `yield_to`, which skips them.
///
/// Returns the source-side ids of the folders that received a REORDER.
pub fn reconcile_reorderings(
    target_plan: &mut Diff,
    source_diff: &Diff,
    source_tree: &Tree,
    source_to_target: &SideMappings,
    yield_to: Option<&HashSet<ItemId>>,
) -> HashSet<ItemId> {
    let mut touched = Vec::new();
    let mut seen = HashSet::new();
    for action in target_plan.actions() {
        let destination = match action {
            Action::Create { payload } | Action::Move { payload, .. } => payload.parent_id(),
            _ => None,
        };
        if let Some(folder_id) = destination {
            if seen.insert(folder_id.clone()) {
                touched.push(folder_id.clone());
            }
        }
    }
    for action in source_diff.actions_of(ActionKind::Reorder) {
        let folder_id = action.payload().id();
        if seen.insert(folder_id.clone()) {
            touched.push(folder_id.clone());
        }
    }

    let removed_folders = target_plan
        .actions_of(ActionKind::Remove)
        .filter(|action| action.payload().is_folder())
        .map(|action| action.payload().id().clone())
        .collect::<HashSet<ItemId>>();
    let created = target_plan
        .actions_of(ActionKind::Create)
        .map(|action| (action.payload().kind(), action.payload().id().clone()))
        .collect::<HashSet<(ItemKind, ItemId)>>();

    let mut reordered = HashSet::new();
    for folder_id in touched {
        if removed_folders.contains(&folder_id) {
            trace!("Not reordering {}; the plan removes it", folder_id);
            continue;
        }
        if let Some(yield_to) = yield_to {
            let counterpart = source_to_target
                .folders
                .get(&folder_id)
                .unwrap_or(&folder_id);
            if yield_to.contains(counterpart) {
                debug!(
                    "Folder {} was reordered on both sides; the other side wins",
                    folder_id
                );
                continue;
            }
        }
        let folder = match source_tree.folder_for(&folder_id) {
            Some(folder) => folder,
            None => {
                trace!("Not reordering {}; it's gone from the source tree", folder_id);
                continue;
            },
        };

        let mut order = Vec::new();
        for child in folder.children() {
            let target = OrderTarget::new(child.kind(), child.id().clone());
            match source_to_target.map_for(target.kind).get(&target.id) {
                Some(mapped) => order.push(OrderTarget::new(target.kind, mapped.clone())),
                None if created.contains(&(target.kind, target.id.clone())) => {
                    // The plan creates this item; its target id doesn't exist
                    // yet, so the entry stays in source coordinates.
                    order.push(target);
                },
                None => {
                    trace!(
                        "Skipping {} in the order for {}; it has no counterpart",
                        target,
                        folder_id
                    );
                },
            }
        }
        if order.len() < 2 {
            continue;
        }

        let mut payload = folder.item().clone_item(false);
        payload.translate(source_to_target);
        trace!("Committing order for {}", folder_id);
        target_plan.commit(Action::Reorder { payload, order });
        reordered.insert(folder_id);
    }
    reordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::before_each;
    use crate::tree::{Bookmark, Item};

    fn side(folders: &[(&str, &str)], bookmarks: &[(&str, &str)]) -> SideMappings {
        let mut side = SideMappings::default();
        for (from, to) in folders {
            side.folders.insert((*from).into(), (*to).into());
        }
        for (from, to) in bookmarks {
            side.bookmarks.insert((*from).into(), (*to).into());
        }
        side
    }

    #[test]
    fn source_reorders_carry_over_translated() {
        before_each();

        let source_tree = nodes!({
            ("1", folder["Menu"], {
                ("2", bookmark["B", "http://b.example/"]),
                ("1", bookmark["A", "http://a.example/"])
            })
        })
        .into_tree()
        .unwrap();

        let mut source_diff = Diff::new();
        source_diff.commit(Action::Reorder {
            payload: source_tree.folder_for(&"1".into()).unwrap().item().clone(),
            order: vec![
                OrderTarget::new(ItemKind::Bookmark, "2".into()),
                OrderTarget::new(ItemKind::Bookmark, "1".into()),
            ],
        });

        let mappings = side(
            &[("1", "sm")],
            &[("1", "s1"), ("2", "s2")],
        );
        let mut plan = Diff::new();
        let reordered =
            reconcile_reorderings(&mut plan, &source_diff, &source_tree, &mappings, None);

        assert_eq!(plan.len(), 1);
        match &plan.actions()[0] {
            Action::Reorder { payload, order } => {
                assert_eq!(payload.id(), &ItemId::from("sm"));
                let ids = order.iter().map(|target| target.id.clone()).collect::<Vec<ItemId>>();
                assert_eq!(ids, vec![ItemId::from("s2"), ItemId::from("s1")]);
            },
            action => panic!("unexpected action {}", action),
        }
        assert!(reordered.contains(&"1".into()));
    }

    #[test]
    fn created_children_keep_source_ids_and_stale_ones_drop_out() {
        before_each();

        let source_tree = nodes!({
            ("1", folder["Menu"], {
                ("9", bookmark["New", "http://new.example/"]),
                ("1", bookmark["A", "http://a.example/"]),
                ("7", bookmark["Ghost", "http://ghost.example/"])
            })
        })
        .into_tree()
        .unwrap();

        let mut plan = Diff::new();
        let mut created = Bookmark::new("9", "New", "http://new.example/");
        created.parent_id = Some("1".into());
        plan.commit(Action::Create {
            payload: Item::Bookmark(created),
        });

        // "7" has no mapping and isn't created by the plan: a suppressed
        // removal left it behind, so the order skips it.
        let mappings = side(&[("1", "sm")], &[("1", "s1")]);
        reconcile_reorderings(&mut plan, &Diff::new(), &source_tree, &mappings, None);

        assert_eq!(plan.len(), 2);
        match &plan.actions()[1] {
            Action::Reorder { order, .. } => {
                let ids = order.iter().map(|target| target.id.clone()).collect::<Vec<ItemId>>();
                assert_eq!(ids, vec![ItemId::from("9"), ItemId::from("s1")]);
            },
            action => panic!("unexpected action {}", action),
        }
    }

    #[test]
    fn the_authoritative_side_wins_a_two_sided_reorder() {
        before_each();

        let source_tree = nodes!({
            ("sm", folder["Menu"], {
                ("s2", bookmark["B", "http://b.example/"]),
                ("s1", bookmark["A", "http://a.example/"])
            })
        })
        .into_tree()
        .unwrap();

        let mut source_diff = Diff::new();
        source_diff.commit(Action::Reorder {
            payload: source_tree.folder_for(&"sm".into()).unwrap().item().clone(),
            order: vec![
                OrderTarget::new(ItemKind::Bookmark, "s2".into()),
                OrderTarget::new(ItemKind::Bookmark, "s1".into()),
            ],
        });

        let mappings = side(
            &[("sm", "1")],
            &[("s1", "1"), ("s2", "2")],
        );
        // The local pass already reordered folder "1".
        let mut yielded = HashSet::new();
        yielded.insert(ItemId::from("1"));

        let mut plan = Diff::new();
        let reordered = reconcile_reorderings(
            &mut plan,
            &source_diff,
            &source_tree,
            &mappings,
            Some(&yielded),
        );
        assert!(plan.is_empty());
        assert!(reordered.is_empty());
    }

    #[test]
    fn orders_for_removed_folders_are_suppressed() {
        before_each();

        let source_tree = nodes!({
            ("1", folder["Menu"], {
                ("1", bookmark["A", "http://a.example/"]),
                ("2", bookmark["B", "http://b.example/"])
            })
        })
        .into_tree()
        .unwrap();

        let mut source_diff = Diff::new();
        source_diff.commit(Action::Reorder {
            payload: source_tree.folder_for(&"1".into()).unwrap().item().clone(),
            order: vec![
                OrderTarget::new(ItemKind::Bookmark, "2".into()),
                OrderTarget::new(ItemKind::Bookmark, "1".into()),
            ],
        });

        let mut plan = Diff::new();
        plan.commit(Action::Remove {
            payload: source_tree.folder_for(&"1".into()).unwrap().item().clone(),
        });

        let mappings = side(&[("1", "sm")], &[("1", "s1"), ("2", "s2")]);
        let reordered =
            reconcile_reorderings(&mut plan, &source_diff, &source_tree, &mappings, None);
        assert_eq!(plan.len(), 1);
        assert!(reordered.is_empty());
    }
}
