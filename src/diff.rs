/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fmt;

use crate::mapping::SideMappings;
use crate::tree::{Item, OrderTarget};

/// A single structural edit on a tree. Payloads are post-state; `old` is the
/// pre-state for the actions that have one. Identity is stable across an
/// action: a MOVE's payload and old item share an id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    Create {
        payload: Item,
    },
    Update {
        payload: Item,
        old: Item,
    },
    Move {
        payload: Item,
        old: Item,
        index: Option<usize>,
        old_index: Option<usize>,
    },
    Remove {
        payload: Item,
    },
    /// The payload is the parent folder; `order` is the authoritative
    /// sequence of its children.
    Reorder {
        payload: Item,
        order: Vec<OrderTarget>,
    },
}

impl Action {
    #[inline]
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create { .. } => ActionKind::Create,
            Action::Update { .. } => ActionKind::Update,
            Action::Move { .. } => ActionKind::Move,
            Action::Remove { .. } => ActionKind::Remove,
            Action::Reorder { .. } => ActionKind::Reorder,
        }
    }

    #[inline]
    pub fn payload(&self) -> &Item {
        match self {
            Action::Create { payload }
            | Action::Update { payload, .. }
            | Action::Move { payload, .. }
            | Action::Remove { payload }
            | Action::Reorder { payload, .. } => payload,
        }
    }

    pub fn old_item(&self) -> Option<&Item> {
        match self {
            Action::Update { old, .. } | Action::Move { old, .. } => Some(old),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::Create { payload } => write!(f, "CREATE {}", payload),
            Action::Update { payload, .. } => write!(f, "UPDATE {}", payload),
            Action::Move { payload, old, .. } => write!(
                f,
                "MOVE {} from {}",
                payload,
                old.parent_id().map(|id| id.as_str()).unwrap_or("?")
            ),
            Action::Remove { payload } => write!(f, "REMOVE {}", payload),
            Action::Reorder { payload, order } => {
                write!(f, "REORDER {} to [", payload)?;
                for (position, target) in order.iter().enumerate() {
                    if position > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", target)?;
                }
                f.write_str("]")
            },
        }
    }
}

/// Action types, used to query a diff.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ActionKind {
    Create,
    Update,
    Move,
    Remove,
    Reorder,
}

/// An ordered, append-only log of actions. A diff read off the scanner is in
/// one side's coordinate system; mapped through `map_ids` it becomes a plan
/// for the other side.
#[derive(Clone, Debug, Default)]
pub struct Diff {
    actions: Vec<Action>,
}

impl Diff {
    pub fn new() -> Diff {
        Diff::default()
    }

    /// Appends an action to the log.
    pub fn commit(&mut self, action: Action) {
        trace!("Committing {}", action);
        self.actions.push(action);
    }

    #[inline]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn actions_of<'d>(&'d self, kind: ActionKind) -> impl Iterator<Item = &'d Action> {
        self.actions.iter().filter(move |action| action.kind() == kind)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Rewrites every identifier in the payloads and pre-states of the
    /// actions selected by `filter` through one direction of a mapping.
    /// Unmapped ids pass through unchanged, which is what lets payloads for
    /// not-yet-created items keep their source-side ids until an executor
    /// can resolve them.
    pub fn map_ids<F>(&mut self, side: &SideMappings, filter: F)
    where
        F: Fn(&Action) -> bool,
    {
        for action in &mut self.actions {
            if !filter(action) {
                continue;
            }
            match action {
                Action::Create { payload } | Action::Remove { payload } => {
                    payload.translate(side);
                },
                Action::Update { payload, old } | Action::Move { payload, old, .. } => {
                    payload.translate(side);
                    old.translate(side);
                },
                Action::Reorder { payload, order } => {
                    payload.translate(side);
                    for target in order {
                        if let Some(mapped) = side.map_for(target.kind).get(&target.id) {
                            target.id = mapped.clone();
                        }
                    }
                },
            }
        }
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (position, action) in self.actions.iter().enumerate() {
            if position > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", action)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ItemId;
    use crate::tree::{Bookmark, Folder, ItemKind};

    #[test]
    fn map_ids_respects_the_filter_and_passes_unmapped_through() {
        let mut side = SideMappings::default();
        side.folders.insert("1".into(), "f1".into());
        side.bookmarks.insert("2".into(), "b2".into());

        let mut diff = Diff::new();
        let mut mapped_bookmark = Bookmark::new("2", "A", "http://a.example/");
        mapped_bookmark.parent_id = Some("1".into());
        diff.commit(Action::Create {
            payload: Item::Bookmark(mapped_bookmark),
        });
        let mut unmapped_folder = Folder::new("9", "New");
        unmapped_folder.parent_id = Some("1".into());
        diff.commit(Action::Move {
            payload: Item::Folder(unmapped_folder),
            old: Item::Folder(Folder::new("9", "New")),
            index: None,
            old_index: None,
        });

        diff.map_ids(&side, |action| action.kind() != ActionKind::Move);

        let created = diff.actions()[0].payload();
        assert_eq!(created.id(), &ItemId::from("b2"));
        assert_eq!(created.parent_id(), Some(&"f1".into()));

        // The move was filtered out and keeps its source ids.
        let moved = diff.actions()[1].payload();
        assert_eq!(moved.id(), &ItemId::from("9"));
        assert_eq!(moved.parent_id(), Some(&"1".into()));
    }

    #[test]
    fn reorder_targets_translate_by_kind() {
        let mut side = SideMappings::default();
        side.folders.insert("1".into(), "f1".into());
        side.bookmarks.insert("1".into(), "b1".into());

        let mut diff = Diff::new();
        diff.commit(Action::Reorder {
            payload: Item::Folder(Folder::new("1", "Menu")),
            order: vec![
                OrderTarget::new(ItemKind::Bookmark, "1".into()),
                OrderTarget::new(ItemKind::Folder, "1".into()),
                OrderTarget::new(ItemKind::Bookmark, "7".into()),
            ],
        });
        diff.map_ids(&side, |_| true);

        match &diff.actions()[0] {
            Action::Reorder { payload, order } => {
                assert_eq!(payload.id(), &ItemId::from("f1"));
                assert_eq!(order[0].id, ItemId::from("b1"));
                assert_eq!(order[1].id, ItemId::from("f1"));
                assert_eq!(order[2].id, ItemId::from("7"));
            },
            action => panic!("unexpected action {}", action),
        }
    }
}
