/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::diff::{Action, ActionKind, Diff};
use crate::error::{ErrorKind, Result};
use crate::id::{ItemId, ROOT_ID};
use crate::mapping::MappingTable;
use crate::merge::{propose_pairings, Plans, Reconciler};
use crate::reorder::reconcile_reorderings;
use crate::scanner::{never_merge, Scanner};
use crate::tree::{Bookmark, Folder, Item, ItemKind, Node, OrderTarget, Subtree, Tree};

/// Ids an adapter assigned during a bulk import, one entry per imported
/// item: the id the plan knew the item by, and the id the adapter gave it.
pub type BulkAssignments = Vec<(ItemKind, ItemId, ItemId)>;

/// A tree provider for one side of a sync. Implementations wrap a browser's
/// bookmark database, a server's HTTP API, or an in-memory tree for tests;
/// every method is one external I/O call, and any error they raise passes
/// through the engine unchanged.
///
/// Reparenting an item is an update with a new parent id; there is no
/// separate move call.
pub trait Store {
    /// Builds the side's full tree. Server adapters may return a sparse
    /// tree whose folders carry a content hash and `loaded = false`; the
    /// engine fetches those through `load_folder_children` on demand.
    fn fetch_tree(&mut self) -> Result<Tree>;

    /// Fetches the immediate children of a sparse folder.
    fn load_folder_children(&mut self, folder_id: &ItemId) -> Result<Vec<Item>>;

    /// Creates a folder, returning the assigned id.
    fn create_folder(&mut self, folder: &Folder) -> Result<ItemId>;

    fn update_folder(&mut self, folder: &Folder) -> Result<()>;

    fn remove_folder(&mut self, folder_id: &ItemId) -> Result<()>;

    /// Rearranges a folder's children. Entries naming unknown children are
    /// ignored.
    fn order_folder(&mut self, folder_id: &ItemId, order: &[OrderTarget]) -> Result<()>;

    /// Creates a bookmark, returning the assigned id.
    fn create_bookmark(&mut self, bookmark: &Bookmark) -> Result<ItemId>;

    fn update_bookmark(&mut self, bookmark: &Bookmark) -> Result<()>;

    fn remove_bookmark(&mut self, bookmark_id: &ItemId) -> Result<()>;

    /// The largest subtree `bulk_import_folder` accepts, or `None` when the
    /// adapter doesn't support bulk imports.
    fn bulk_import_limit(&self) -> Option<usize> {
        None
    }

    /// Imports a whole folder subtree in one round-trip, returning the
    /// assigned id for every imported item. Must fail when the subtree
    /// exceeds the advertised limit.
    fn bulk_import_folder(&mut self, _parent_id: &ItemId, _subtree: &Subtree) -> Result<BulkAssignments> {
        Err(ErrorKind::Adapter.into())
    }
}

/// Knobs for a sync run.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Mirror child-order changes. When unset, folders keep whatever order
    /// each side already has.
    pub preserve_order: bool,
    /// Trust folder content hashes: subtrees whose hashes agree are neither
    /// fetched nor diffed.
    pub check_hashes: bool,
}

impl Default for SyncOptions {
    fn default() -> SyncOptions {
        SyncOptions {
            preserve_order: true,
            check_hashes: true,
        }
    }
}

/// Runs one sync: loads both trees, diffs each side against the state the
/// last sync recorded, reconciles, and returns the two plans. The caller
/// applies each plan to its side (`apply_plan`) and then flushes the
/// mapping table.
///
/// `cache_tree` is the local tree as the last successful sync left it. With
/// an empty mapping table this is a first sync: the cache is ignored and
/// the two live trees are paired by content instead.
pub fn sync<L: Store, S: Store>(
    local: &mut L,
    server: &mut S,
    cache_tree: Option<&Tree>,
    table: &mut MappingTable,
    options: &SyncOptions,
) -> Result<Plans> {
    let local_tree = local.fetch_tree()?;
    let mut server_tree = server.fetch_tree()?;

    let mut snapshot = table.snapshot();
    for (kind, local_id) in snapshot.drop_stale(&local_tree, &server_tree) {
        table.queue_remove_local(kind, local_id);
    }

    let (local_diff, server_diff, snapshot) = if snapshot.is_empty() {
        debug!("No mappings; merging the two trees by content");
        load_missing_folders(server, &mut server_tree, None, options.check_hashes)?;
        let (local_diff, server_diff, accepted) =
            propose_pairings(&local_tree, &server_tree, options.preserve_order)?;
        let mut enriched = snapshot;
        for (kind, local_id, server_id) in accepted {
            table.queue_add(kind, local_id.clone(), server_id.clone());
            enriched.add(kind, local_id, server_id);
        }
        (local_diff, server_diff, enriched)
    } else {
        let cache_tree = match cache_tree {
            Some(cache_tree) => cache_tree,
            None => {
                warn!("Mappings exist but the prior sync's tree is missing");
                return Err(ErrorKind::InconsistentMapping(ROOT_ID).into());
            },
        };
        let mapped_cache = cache_tree.map_ids(&snapshot.local_to_server);
        load_missing_folders(
            server,
            &mut server_tree,
            Some(&mapped_cache),
            options.check_hashes,
        )?;
        let local_diff = Scanner::new(
            cache_tree,
            &local_tree,
            never_merge,
            options.preserve_order,
            options.check_hashes,
        )
        .scan()?;
        let server_diff = Scanner::new(
            &mapped_cache,
            &server_tree,
            never_merge,
            options.preserve_order,
            options.check_hashes,
        )
        .scan()?;
        (local_diff, server_diff, snapshot)
    };

    let mut reconciler = Reconciler::new(&local_tree, &server_tree, &snapshot);
    let mut plans = reconciler.reconcile(&local_diff, &server_diff)?;
    for (kind, local_id, server_id) in reconciler.new_mappings() {
        table.queue_add(*kind, local_id.clone(), server_id.clone());
    }

    let effective = table.effective();
    let reordered = reconcile_reorderings(
        &mut plans.server,
        &local_diff,
        &local_tree,
        &effective.local_to_server,
        None,
    );
    reconcile_reorderings(
        &mut plans.local,
        &server_diff,
        &server_tree,
        &effective.server_to_local,
        Some(&reordered),
    );

    // Moves and order notes keep source-side ids for late resolution; see
    // `apply_plan`.
    let mapped = |action: &Action| {
        action.kind() != ActionKind::Move && action.kind() != ActionKind::Reorder
    };
    plans.server.map_ids(&effective.local_to_server, mapped);
    plans.local.map_ids(&effective.server_to_local, mapped);

    debug!(
        "Planned {} server and {} local actions",
        plans.server.len(),
        plans.local.len()
    );
    Ok(plans)
}

/// Fetches the children of sparse folders until the tree is complete.
/// Folders whose content hash matches their counterpart in the reference
/// tree stay unloaded when hashes are trusted: the scanner won't descend
/// into them either.
fn load_missing_folders<S: Store>(
    store: &mut S,
    tree: &mut Tree,
    reference: Option<&Tree>,
    check_hashes: bool,
) -> Result<()> {
    loop {
        let pending = collect_unloaded(tree, reference, check_hashes);
        if pending.is_empty() {
            return Ok(());
        }
        for folder_id in pending {
            debug!("Fetching children of sparse folder {}", folder_id);
            let children = store.load_folder_children(&folder_id)?;
            for item in children {
                tree.insert(&folder_id, item)?;
            }
            tree.mark_folder_loaded(&folder_id)?;
        }
    }
}

fn collect_unloaded(tree: &Tree, reference: Option<&Tree>, check_hashes: bool) -> Vec<ItemId> {
    fn walk(
        node: Node<'_>,
        reference: Option<&Tree>,
        check_hashes: bool,
        pending: &mut Vec<ItemId>,
    ) {
        if let Item::Folder(folder) = node.item() {
            if !folder.loaded {
                let unchanged = check_hashes
                    && reference
                        .and_then(|reference| reference.folder_for(&folder.id))
                        .map_or(false, |counterpart| match counterpart.item() {
                            Item::Folder(counterpart) => match (&counterpart.hash, &folder.hash) {
                                (Some(reference_hash), Some(hash)) => reference_hash == hash,
                                _ => false,
                            },
                            _ => false,
                        });
                if unchanged {
                    trace!("Folder {} unchanged by hash; leaving it sparse", node);
                } else {
                    pending.push(folder.id.clone());
                }
                return;
            }
        }
        for child in node.children() {
            walk(child, reference, check_hashes, pending);
        }
    }

    let mut pending = Vec::new();
    walk(tree.root(), reference, check_hashes, &mut pending);
    pending
}

/// Applies a plan to one side, in log order. `to_server` says which side,
/// and therefore which direction of the mapping table resolves the ids that
/// plan mapping left in source coordinates. Every creation queues the
/// adapter-assigned id into the table; the caller flushes once the whole
/// plan has been applied.
///
/// Folder creations followed by their descendants go through the adapter's
/// bulk import when it advertises one big enough.
pub fn apply_plan<S: Store>(
    store: &mut S,
    plan: &Diff,
    table: &mut MappingTable,
    to_server: bool,
) -> Result<()> {
    let actions = plan.actions();
    let mut position = 0;
    while position < actions.len() {
        let action = &actions[position];
        match action {
            Action::Create { payload } => {
                if payload.is_folder() {
                    if let Some(limit) = store.bulk_import_limit() {
                        let run = subtree_run(actions, position);
                        if run > 1 && run <= limit {
                            position += import_subtree(
                                store,
                                &actions[position..position + run],
                                table,
                                to_server,
                            )?;
                            continue;
                        }
                    }
                }
                let mut item = payload.clone();
                resolve_parent(&mut item, table, to_server);
                let assigned = match &item {
                    Item::Folder(folder) => store.create_folder(folder)?,
                    Item::Bookmark(bookmark) => store.create_bookmark(bookmark)?,
                };
                queue_assignment(table, to_server, item.kind(), payload.id().clone(), assigned);
            },
            Action::Update { payload, .. } | Action::Move { payload, .. } => {
                let mut item = payload.clone();
                let id = resolve_id(table, to_server, item.kind(), item.id());
                item.set_id(id);
                resolve_parent(&mut item, table, to_server);
                match &item {
                    Item::Folder(folder) => store.update_folder(folder)?,
                    Item::Bookmark(bookmark) => store.update_bookmark(bookmark)?,
                }
            },
            Action::Remove { payload } => {
                let id = resolve_id(table, to_server, payload.kind(), payload.id());
                match payload.kind() {
                    ItemKind::Folder => store.remove_folder(&id)?,
                    ItemKind::Bookmark => store.remove_bookmark(&id)?,
                }
            },
            Action::Reorder { payload, order } => {
                let folder_id = resolve_id(table, to_server, ItemKind::Folder, payload.id());
                let order = order
                    .iter()
                    .map(|target| {
                        OrderTarget::new(
                            target.kind,
                            resolve_id(table, to_server, target.kind, &target.id),
                        )
                    })
                    .collect::<Vec<OrderTarget>>();
                store.order_folder(&folder_id, &order)?;
            },
        }
        position += 1;
    }
    Ok(())
}

/// Length of the run of creations starting at `start` that forms one
/// self-contained folder subtree, parents first.
fn subtree_run(actions: &[Action], start: usize) -> usize {
    let root = match &actions[start] {
        Action::Create { payload } if payload.is_folder() => payload,
        _ => return 1,
    };
    let mut folder_ids = HashSet::new();
    folder_ids.insert(root.id().clone());
    let mut run = 1;
    for action in &actions[start + 1..] {
        let payload = match action {
            Action::Create { payload } => payload,
            _ => break,
        };
        let inside = payload
            .parent_id()
            .map_or(false, |parent_id| folder_ids.contains(parent_id));
        if !inside {
            break;
        }
        if payload.is_folder() {
            folder_ids.insert(payload.id().clone());
        }
        run += 1;
    }
    run
}

fn import_subtree<S: Store>(
    store: &mut S,
    run: &[Action],
    table: &mut MappingTable,
    to_server: bool,
) -> Result<usize> {
    fn collect(folder_id: &ItemId, run: &[Action]) -> Vec<Subtree> {
        run.iter()
            .filter_map(|action| match action {
                Action::Create { payload } if payload.parent_id() == Some(folder_id) => {
                    Some(Subtree {
                        item: payload.clone(),
                        children: if payload.is_folder() {
                            collect(payload.id(), run)
                        } else {
                            Vec::new()
                        },
                    })
                },
                _ => None,
            })
            .collect()
    }

    let root = run[0].payload();
    let subtree = Subtree {
        item: root.clone(),
        children: collect(root.id(), &run[1..]),
    };
    let parent_id = match root.parent_id() {
        Some(parent_id) => resolve_id(table, to_server, ItemKind::Folder, parent_id),
        None => ROOT_ID,
    };
    debug!(
        "Bulk importing {} items under {}",
        subtree.count(),
        parent_id
    );
    let assignments = store.bulk_import_folder(&parent_id, &subtree)?;
    for (kind, plan_id, assigned) in assignments {
        queue_assignment(table, to_server, kind, plan_id, assigned);
    }
    Ok(run.len())
}

fn resolve_id(table: &MappingTable, to_server: bool, kind: ItemKind, id: &ItemId) -> ItemId {
    let mapped = if to_server {
        table.pending_server_id(kind, id)
    } else {
        table.pending_local_id(kind, id)
    };
    mapped.cloned().unwrap_or_else(|| id.clone())
}

fn resolve_parent(item: &mut Item, table: &MappingTable, to_server: bool) {
    if let Some(parent_id) = item.parent_id() {
        let resolved = resolve_id(table, to_server, ItemKind::Folder, parent_id);
        item.set_parent_id(Some(resolved));
    }
}

fn queue_assignment(
    table: &mut MappingTable,
    to_server: bool,
    kind: ItemKind,
    plan_id: ItemId,
    assigned: ItemId,
) {
    if to_server {
        table.queue_add(kind, plan_id, assigned);
    } else {
        table.queue_add(kind, assigned, plan_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::before_each;

    /// An in-memory adapter. Assigned ids are `<prefix><counter>`, so tests
    /// can tell the two sides' ids apart at a glance.
    struct MemoryStore {
        tree: Tree,
        prefix: &'static str,
        next_id: u64,
        sparse: bool,
        bulk_limit: Option<usize>,
        loads: usize,
        bulk_imports: usize,
    }

    impl MemoryStore {
        fn new(tree: Tree, prefix: &'static str) -> MemoryStore {
            MemoryStore {
                tree,
                prefix,
                next_id: 1,
                sparse: false,
                bulk_limit: None,
                loads: 0,
                bulk_imports: 0,
            }
        }

        fn assign(&mut self) -> ItemId {
            let id = ItemId::new(&format!("{}{}", self.prefix, self.next_id));
            self.next_id += 1;
            id
        }

        fn import(&mut self, parent_id: &ItemId, subtree: &Subtree) -> Result<BulkAssignments> {
            let mut item = subtree.item.clone();
            let assigned = self.assign();
            item.set_id(assigned.clone());
            item.set_parent_id(Some(parent_id.clone()));
            self.tree.insert(parent_id, item)?;
            let mut assignments =
                vec![(subtree.item.kind(), subtree.item.id().clone(), assigned.clone())];
            for child in &subtree.children {
                assignments.extend(self.import(&assigned, child)?);
            }
            Ok(assignments)
        }
    }

    impl Store for MemoryStore {
        fn fetch_tree(&mut self) -> Result<Tree> {
            if !self.sparse {
                return Ok(self.tree.clone());
            }
            // Hand out the root level only; folders below come through
            // `load_folder_children`.
            let root = match self.tree.root().item() {
                Item::Folder(folder) => folder.clone(),
                _ => unreachable!("roots are folders"),
            };
            let mut sparse = Tree::new(root);
            for child in self.tree.root().children() {
                sparse.insert(&ROOT_ID, sparse_item(child))?;
            }
            Ok(sparse)
        }

        fn load_folder_children(&mut self, folder_id: &ItemId) -> Result<Vec<Item>> {
            self.loads += 1;
            let folder = self
                .tree
                .folder_for(folder_id)
                .ok_or_else(|| ErrorKind::InconsistentTree("missing folder", folder_id.clone()))?;
            Ok(folder.children().map(sparse_item).collect())
        }

        fn create_folder(&mut self, folder: &Folder) -> Result<ItemId> {
            let parent_id = folder.parent_id.clone().unwrap_or(ROOT_ID);
            let mut created = folder.clone();
            created.id = self.assign();
            let id = created.id.clone();
            self.tree.insert(&parent_id, Item::Folder(created))?;
            Ok(id)
        }

        fn update_folder(&mut self, folder: &Folder) -> Result<()> {
            let current_parent = self
                .tree
                .folder_for(&folder.id)
                .ok_or_else(|| ErrorKind::InconsistentTree("missing folder", folder.id.clone()))?
                .parent_id()
                .cloned();
            if let (Some(new_parent), Some(current_parent)) = (&folder.parent_id, current_parent) {
                if *new_parent != current_parent {
                    self.tree.move_item(ItemKind::Folder, &folder.id, new_parent)?;
                }
            }
            self.tree.update(&Item::Folder(folder.clone()))
        }

        fn remove_folder(&mut self, folder_id: &ItemId) -> Result<()> {
            self.tree.remove(ItemKind::Folder, folder_id)
        }

        fn order_folder(&mut self, folder_id: &ItemId, order: &[OrderTarget]) -> Result<()> {
            self.tree.reorder_children(folder_id, order)
        }

        fn create_bookmark(&mut self, bookmark: &Bookmark) -> Result<ItemId> {
            let parent_id = bookmark.parent_id.clone().unwrap_or(ROOT_ID);
            let mut created = bookmark.clone();
            created.id = self.assign();
            let id = created.id.clone();
            self.tree.insert(&parent_id, Item::Bookmark(created))?;
            Ok(id)
        }

        fn update_bookmark(&mut self, bookmark: &Bookmark) -> Result<()> {
            let current_parent = self
                .tree
                .bookmark_for(&bookmark.id)
                .ok_or_else(|| {
                    ErrorKind::InconsistentTree("missing bookmark", bookmark.id.clone())
                })?
                .parent_id()
                .cloned();
            if let (Some(new_parent), Some(current_parent)) = (&bookmark.parent_id, current_parent)
            {
                if *new_parent != current_parent {
                    self.tree
                        .move_item(ItemKind::Bookmark, &bookmark.id, new_parent)?;
                }
            }
            self.tree.update(&Item::Bookmark(bookmark.clone()))
        }

        fn remove_bookmark(&mut self, bookmark_id: &ItemId) -> Result<()> {
            self.tree.remove(ItemKind::Bookmark, bookmark_id)
        }

        fn bulk_import_limit(&self) -> Option<usize> {
            self.bulk_limit
        }

        fn bulk_import_folder(
            &mut self,
            parent_id: &ItemId,
            subtree: &Subtree,
        ) -> Result<BulkAssignments> {
            match self.bulk_limit {
                Some(limit) if subtree.count() <= limit => {},
                _ => return Err(ErrorKind::Adapter.into()),
            }
            self.bulk_imports += 1;
            self.import(parent_id, subtree)
        }
    }

    fn sparse_item(node: Node<'_>) -> Item {
        match node.item() {
            Item::Folder(folder) => {
                let mut sparse = folder.clone();
                sparse.loaded = false;
                sparse.parent_id = None;
                Item::Folder(sparse)
            },
            Item::Bookmark(bookmark) => Item::Bookmark(bookmark.clone()),
        }
    }

    fn shared_layout(prefix: &str) -> Tree {
        nodes!({
            (format!("{}f1", prefix).as_str(), folder["Work"], {
                (format!("{}b1", prefix).as_str(), bookmark["Tracker", "http://tracker.example/"]),
                (format!("{}b2", prefix).as_str(), bookmark["Wiki", "http://wiki.example/"])
            }),
            (format!("{}f2", prefix).as_str(), folder["Home"], {
                (format!("{}b3", prefix).as_str(), bookmark["News", "http://news.example/"])
            })
        })
        .into_tree()
        .unwrap()
    }

    #[test]
    fn first_sync_of_identical_layouts_pairs_everything() {
        before_each();

        let mut local = MemoryStore::new(shared_layout("l"), "l");
        let mut server = MemoryStore::new(shared_layout("s"), "s");
        let mut table = MappingTable::default();

        let plans = sync(
            &mut local,
            &mut server,
            None,
            &mut table,
            &SyncOptions::default(),
        )
        .unwrap();
        assert!(plans.server.is_empty());
        assert!(plans.local.is_empty());

        let mappings = table.flush().clone();
        assert_eq!(
            mappings.server_id(ItemKind::Folder, &"lf1".into()),
            Some(&"sf1".into())
        );
        assert_eq!(
            mappings.local_id(ItemKind::Bookmark, &"sb3".into()),
            Some(&"lb3".into())
        );

        // A second run with the recorded mappings has nothing to do.
        let cache = local.fetch_tree().unwrap();
        let plans = sync(
            &mut local,
            &mut server,
            Some(&cache),
            &mut table,
            &SyncOptions::default(),
        )
        .unwrap();
        assert!(plans.server.is_empty());
        assert!(plans.local.is_empty());
    }

    #[test]
    fn edits_on_both_sides_converge_after_two_runs() {
        before_each();

        let mut local = MemoryStore::new(shared_layout("l"), "l");
        let mut server = MemoryStore::new(shared_layout("s"), "s");
        server.bulk_limit = Some(16);
        let mut table = MappingTable::default();
        let options = SyncOptions::default();

        sync(&mut local, &mut server, None, &mut table, &options).unwrap();
        table.flush();
        let cache = local.fetch_tree().unwrap();

        // Locally: a new folder with two bookmarks. On the server: a rename.
        let mut projects = Folder::new("lf3", "Projects");
        projects.parent_id = Some(ROOT_ID);
        local.tree.insert(&ROOT_ID, Item::Folder(projects)).unwrap();
        local
            .tree
            .insert(
                &"lf3".into(),
                Item::Bookmark(Bookmark::new("lb4", "CI", "http://ci.example/")),
            )
            .unwrap();
        local
            .tree
            .insert(
                &"lf3".into(),
                Item::Bookmark(Bookmark::new("lb5", "Repo", "http://repo.example/")),
            )
            .unwrap();
        let mut renamed = Bookmark::new("sb3", "Front page", "http://news.example/");
        renamed.parent_id = Some("sf2".into());
        server.tree.update(&Item::Bookmark(renamed)).unwrap();

        let plans = sync(&mut local, &mut server, Some(&cache), &mut table, &options).unwrap();
        apply_plan(&mut server, &plans.server, &mut table, true).unwrap();
        apply_plan(&mut local, &plans.local, &mut table, false).unwrap();
        table.flush();

        // The new subtree went over in one bulk import.
        assert_eq!(server.bulk_imports, 1);
        assert_eq!(
            local.tree.bookmark_for(&"lb3".into()).unwrap().title(),
            "Front page"
        );
        assert!(server
            .tree
            .bookmark_for(table.snapshot().server_id(ItemKind::Bookmark, &"lb4".into()).unwrap())
            .is_some());

        // The two sides are now the same tree, modulo ids.
        assert_eq!(
            server.tree.map_ids(&table.snapshot().server_to_local),
            local.tree
        );

        // Both sides settled: the next run plans nothing.
        let cache = local.fetch_tree().unwrap();
        let plans = sync(&mut local, &mut server, Some(&cache), &mut table, &options).unwrap();
        assert!(plans.server.is_empty(), "server plan: {}", plans.server);
        assert!(plans.local.is_empty(), "local plan: {}", plans.local);
    }

    #[test]
    fn a_pure_reorder_mirrors_as_one_order_note() {
        before_each();

        let mut local = MemoryStore::new(shared_layout("l"), "l");
        let mut server = MemoryStore::new(shared_layout("s"), "s");
        let mut table = MappingTable::default();
        let options = SyncOptions::default();

        sync(&mut local, &mut server, None, &mut table, &options).unwrap();
        table.flush();
        let cache = local.fetch_tree().unwrap();

        // Swap the two bookmarks inside Work.
        local
            .tree
            .reorder_children(
                &"lf1".into(),
                &[
                    OrderTarget::new(ItemKind::Bookmark, "lb2".into()),
                    OrderTarget::new(ItemKind::Bookmark, "lb1".into()),
                ],
            )
            .unwrap();

        let plans = sync(&mut local, &mut server, Some(&cache), &mut table, &options).unwrap();
        assert!(plans.local.is_empty());
        assert_eq!(plans.server.len(), 1);
        match &plans.server.actions()[0] {
            Action::Reorder { payload, order } => {
                assert_eq!(payload.id(), &ItemId::from("sf1"));
                let ids = order
                    .iter()
                    .map(|target| target.id.clone())
                    .collect::<Vec<ItemId>>();
                assert_eq!(ids, vec![ItemId::from("sb2"), ItemId::from("sb1")]);
            },
            action => panic!("unexpected action {}", action),
        }

        apply_plan(&mut server, &plans.server, &mut table, true).unwrap();
        table.flush();
        let cache = local.fetch_tree().unwrap();
        let plans = sync(&mut local, &mut server, Some(&cache), &mut table, &options).unwrap();
        assert!(plans.server.is_empty(), "server plan: {}", plans.server);
        assert!(plans.local.is_empty(), "local plan: {}", plans.local);
    }

    #[test]
    fn sparse_server_trees_load_on_demand() {
        before_each();

        let mut local = MemoryStore::new(shared_layout("l"), "l");
        let mut server = MemoryStore::new(shared_layout("s"), "s");
        server.sparse = true;
        let mut table = MappingTable::default();

        let plans = sync(
            &mut local,
            &mut server,
            None,
            &mut table,
            &SyncOptions::default(),
        )
        .unwrap();
        assert!(plans.server.is_empty());
        assert!(plans.local.is_empty());
        assert_eq!(server.loads, 2);
    }

    #[test]
    fn hash_matched_sparse_folders_stay_unloaded() {
        before_each();

        let mut cache = Tree::default();
        let mut sealed = Folder::new("lf1", "Archive");
        sealed.hash = Some("2b1a".into());
        cache.insert(&ROOT_ID, Item::Folder(sealed.clone())).unwrap();

        let mut local = MemoryStore::new(cache.clone(), "l");
        let mut server_tree = Tree::default();
        let mut server_sealed = Folder::new("sf1", "Archive");
        server_sealed.hash = Some("2b1a".into());
        server_tree
            .insert(&ROOT_ID, Item::Folder(server_sealed))
            .unwrap();
        let mut server = MemoryStore::new(server_tree, "s");
        server.sparse = true;

        let mut mappings = crate::mapping::Mappings::default();
        mappings.add(ItemKind::Folder, ROOT_ID, ROOT_ID);
        mappings.add(ItemKind::Folder, "lf1".into(), "sf1".into());
        let mut table = MappingTable::new(mappings);

        let plans = sync(
            &mut local,
            &mut server,
            Some(&cache),
            &mut table,
            &SyncOptions::default(),
        )
        .unwrap();
        assert!(plans.server.is_empty());
        assert!(plans.local.is_empty());
        assert_eq!(server.loads, 0);
    }

    #[test]
    fn mappings_without_a_prior_tree_are_inconsistent() {
        before_each();

        let mut local = MemoryStore::new(shared_layout("l"), "l");
        let mut server = MemoryStore::new(shared_layout("s"), "s");
        let mut mappings = crate::mapping::Mappings::default();
        mappings.add(ItemKind::Folder, "lf1".into(), "sf1".into());
        let mut table = MappingTable::new(mappings);

        let err = sync(
            &mut local,
            &mut server,
            None,
            &mut table,
            &SyncOptions::default(),
        )
        .unwrap_err();
        match err.kind() {
            ErrorKind::InconsistentMapping(_) => {},
            kind => panic!("unexpected error {:?}", kind),
        }
    }
}
