/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};
use crate::id::ItemId;
use crate::tree::{ItemKind, Tree};

/// One direction of the mapping table: ids on one side keyed to their
/// counterparts on the other, partitioned by kind.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SideMappings {
    pub folders: HashMap<ItemId, ItemId>,
    pub bookmarks: HashMap<ItemId, ItemId>,
}

impl SideMappings {
    pub fn map_for(&self, kind: ItemKind) -> &HashMap<ItemId, ItemId> {
        match kind {
            ItemKind::Folder => &self.folders,
            ItemKind::Bookmark => &self.bookmarks,
        }
    }

    fn map_for_mut(&mut self, kind: ItemKind) -> &mut HashMap<ItemId, ItemId> {
        match kind {
            ItemKind::Folder => &mut self.folders,
            ItemKind::Bookmark => &mut self.bookmarks,
        }
    }

    pub fn get(&self, kind: ItemKind, id: &ItemId) -> Option<&ItemId> {
        self.map_for(kind).get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.bookmarks.is_empty()
    }
}

/// A bidirectional pairing of local and server item ids, partitioned by
/// kind. Both directions always agree; `add` and `remove` maintain that
/// together.
///
/// A deep copy of this structure is the snapshot the reconciler reads;
/// it is also the single record the mapping store persists.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Mappings {
    pub local_to_server: SideMappings,
    pub server_to_local: SideMappings,
}

impl Mappings {
    pub fn is_empty(&self) -> bool {
        self.local_to_server.is_empty() && self.server_to_local.is_empty()
    }

    /// Pairs a local id with a server id. Re-pairing either id silently
    /// replaces its previous pairing, keeping the two directions in
    /// agreement.
    pub fn add(&mut self, kind: ItemKind, local_id: ItemId, server_id: ItemId) {
        if let Some(old_server) = self
            .local_to_server
            .map_for_mut(kind)
            .insert(local_id.clone(), server_id.clone())
        {
            self.server_to_local.map_for_mut(kind).remove(&old_server);
        }
        if let Some(old_local) = self
            .server_to_local
            .map_for_mut(kind)
            .insert(server_id, local_id)
        {
            self.local_to_server.map_for_mut(kind).remove(&old_local);
        }
    }

    /// Unpairs a local id (and its server counterpart).
    pub fn remove_local(&mut self, kind: ItemKind, local_id: &ItemId) {
        if let Some(server_id) = self.local_to_server.map_for_mut(kind).remove(local_id) {
            self.server_to_local.map_for_mut(kind).remove(&server_id);
        }
    }

    pub fn server_id(&self, kind: ItemKind, local_id: &ItemId) -> Option<&ItemId> {
        self.local_to_server.get(kind, local_id)
    }

    pub fn local_id(&self, kind: ItemKind, server_id: &ItemId) -> Option<&ItemId> {
        self.server_to_local.get(kind, server_id)
    }

    /// Drops pairs that refer to items missing from both trees, returning
    /// what was dropped so the persistent store can follow suit. Pairs with
    /// one surviving end stay: a deletion on one side still needs its
    /// mapping while the deletion reconciles.
    pub fn drop_stale(&mut self, local_tree: &Tree, server_tree: &Tree) -> Vec<(ItemKind, ItemId)> {
        let mut dropped = Vec::new();
        for kind in &[ItemKind::Folder, ItemKind::Bookmark] {
            let stale = self
                .local_to_server
                .map_for(*kind)
                .iter()
                .filter(|(local_id, server_id)| {
                    !local_tree.contains(*kind, local_id) && !server_tree.contains(*kind, server_id)
                })
                .map(|(local_id, _)| local_id.clone())
                .collect::<Vec<ItemId>>();
            for local_id in stale {
                warn!("Dropping stale {} mapping for {}", kind, local_id);
                self.remove_local(*kind, &local_id);
                dropped.push((*kind, local_id));
            }
        }
        dropped
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(crate::error::Error::adapter)
    }

    /// Parses a persisted record, verifying that the two directions agree.
    pub fn from_json(json: &str) -> Result<Mappings> {
        let mappings: Mappings = serde_json::from_str(json).map_err(crate::error::Error::adapter)?;
        for kind in &[ItemKind::Folder, ItemKind::Bookmark] {
            for (local_id, server_id) in mappings.local_to_server.map_for(*kind) {
                match mappings.server_to_local.get(*kind, server_id) {
                    Some(back) if back == local_id => {},
                    _ => return Err(ErrorKind::InconsistentMapping(local_id.clone()).into()),
                }
            }
            for (server_id, local_id) in mappings.server_to_local.map_for(*kind) {
                match mappings.local_to_server.get(*kind, local_id) {
                    Some(back) if back == server_id => {},
                    _ => return Err(ErrorKind::InconsistentMapping(server_id.clone()).into()),
                }
            }
        }
        Ok(mappings)
    }
}

/// A queued change to the persistent mapping table.
#[derive(Clone, Debug)]
enum QueuedChange {
    Add {
        kind: ItemKind,
        local_id: ItemId,
        server_id: ItemId,
    },
    RemoveLocal {
        kind: ItemKind,
        local_id: ItemId,
    },
}

/// The mapping store for one sync run.
///
/// Reconciliation reads a snapshot taken up front; everything discovered
/// mid-run is queued and only folded into the persistent record by `flush`,
/// once the owning plan has been applied to its side. The pending view
/// (`pending_server_id` / `pending_local_id`) sees the queue, so the plan
/// executor can resolve ids it assigned moments ago.
#[derive(Clone, Debug, Default)]
pub struct MappingTable {
    persisted: Mappings,
    queue: Vec<QueuedChange>,
}

impl MappingTable {
    pub fn new(persisted: Mappings) -> MappingTable {
        MappingTable {
            persisted,
            queue: Vec::new(),
        }
    }

    /// An immutable deep copy of the persisted record, unaffected by later
    /// queued changes.
    pub fn snapshot(&self) -> Mappings {
        self.persisted.clone()
    }

    pub fn queue_add(&mut self, kind: ItemKind, local_id: ItemId, server_id: ItemId) {
        trace!("Queueing {} mapping {} ↔ {}", kind, local_id, server_id);
        self.queue.push(QueuedChange::Add {
            kind,
            local_id,
            server_id,
        });
    }

    pub fn queue_remove_local(&mut self, kind: ItemKind, local_id: ItemId) {
        trace!("Queueing removal of {} mapping for {}", kind, local_id);
        self.queue.push(QueuedChange::RemoveLocal { kind, local_id });
    }

    /// Resolves a local id through the queue first, then the persisted
    /// record. Later queued additions win, matching flush order.
    pub fn pending_server_id(&self, kind: ItemKind, local_id: &ItemId) -> Option<&ItemId> {
        for change in self.queue.iter().rev() {
            if let QueuedChange::Add {
                kind: queued_kind,
                local_id: queued_local,
                server_id,
            } = change
            {
                if *queued_kind == kind && queued_local == local_id {
                    return Some(server_id);
                }
            }
        }
        self.persisted.server_id(kind, local_id)
    }

    pub fn pending_local_id(&self, kind: ItemKind, server_id: &ItemId) -> Option<&ItemId> {
        for change in self.queue.iter().rev() {
            if let QueuedChange::Add {
                kind: queued_kind,
                local_id,
                server_id: queued_server,
            } = change
            {
                if *queued_kind == kind && queued_server == server_id {
                    return Some(local_id);
                }
            }
        }
        self.persisted.local_id(kind, server_id)
    }

    /// A snapshot with every queued addition applied on top, for plan
    /// translation after reconciliation has recorded new pairings.
    pub fn effective(&self) -> Mappings {
        let mut effective = self.persisted.clone();
        for change in &self.queue {
            match change {
                QueuedChange::Add {
                    kind,
                    local_id,
                    server_id,
                } => effective.add(*kind, local_id.clone(), server_id.clone()),
                QueuedChange::RemoveLocal { kind, local_id } => {
                    effective.remove_local(*kind, local_id)
                },
            }
        }
        effective
    }

    /// Folds the queue into the persistent record, in FIFO order. Duplicate
    /// additions for the same id overwrite silently.
    pub fn flush(&mut self) -> &Mappings {
        for change in self.queue.drain(..) {
            match change {
                QueuedChange::Add {
                    kind,
                    local_id,
                    server_id,
                } => self.persisted.add(kind, local_id, server_id),
                QueuedChange::RemoveLocal { kind, local_id } => {
                    self.persisted.remove_local(kind, &local_id)
                },
            }
        }
        &self.persisted
    }

    pub fn has_queued_changes(&self) -> bool {
        !self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ROOT_ID;
    use crate::tree::{Folder, Item};

    #[test]
    fn add_keeps_both_directions_in_agreement() {
        let mut mappings = Mappings::default();
        mappings.add(ItemKind::Folder, "1".into(), "a".into());
        mappings.add(ItemKind::Bookmark, "1".into(), "b".into());
        assert_eq!(mappings.server_id(ItemKind::Folder, &"1".into()), Some(&"a".into()));
        assert_eq!(mappings.local_id(ItemKind::Folder, &"a".into()), Some(&"1".into()));
        assert_eq!(mappings.server_id(ItemKind::Bookmark, &"1".into()), Some(&"b".into()));

        // Re-pairing the same local id replaces the old pair entirely.
        mappings.add(ItemKind::Folder, "1".into(), "c".into());
        assert_eq!(mappings.local_id(ItemKind::Folder, &"a".into()), None);
        assert_eq!(mappings.local_id(ItemKind::Folder, &"c".into()), Some(&"1".into()));
    }

    #[test]
    fn snapshot_is_unaffected_by_queued_changes() {
        let mut table = MappingTable::default();
        let snapshot = table.snapshot();
        table.queue_add(ItemKind::Bookmark, "5".into(), "s5".into());
        assert!(snapshot.is_empty());
        assert_eq!(
            table.pending_server_id(ItemKind::Bookmark, &"5".into()),
            Some(&"s5".into())
        );

        let flushed = table.flush().clone();
        assert_eq!(flushed.server_id(ItemKind::Bookmark, &"5".into()), Some(&"s5".into()));
        assert!(!table.has_queued_changes());
    }

    #[test]
    fn from_json_rejects_disagreeing_directions() {
        let mut mappings = Mappings::default();
        mappings.add(ItemKind::Folder, "1".into(), "a".into());
        let json = mappings.to_json().unwrap();
        assert_eq!(Mappings::from_json(&json).unwrap(), mappings);

        let broken = json.replace("\"a\":\"1\"", "\"a\":\"2\"");
        let err = Mappings::from_json(&broken).unwrap_err();
        match err.kind() {
            crate::error::ErrorKind::InconsistentMapping(_) => {},
            kind => panic!("unexpected error {:?}", kind),
        }
    }

    #[test]
    fn drop_stale_keeps_half_live_pairs() {
        let mut local = Tree::default();
        local
            .insert(&ROOT_ID, Item::Folder(Folder::new("1", "A")))
            .unwrap();
        let server = Tree::default();

        let mut mappings = Mappings::default();
        // "1" survives locally; "2" is gone from both sides.
        mappings.add(ItemKind::Folder, "1".into(), "a".into());
        mappings.add(ItemKind::Folder, "2".into(), "b".into());
        mappings.drop_stale(&local, &server);

        assert_eq!(mappings.server_id(ItemKind::Folder, &"1".into()), Some(&"a".into()));
        assert_eq!(mappings.server_id(ItemKind::Folder, &"2".into()), None);
    }
}
