/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};
use crate::id::{ItemId, ROOT_ID};
use crate::mapping::SideMappings;

/// A complete, rooted bookmark tree.
///
/// The tree stores items in a vector, and uses indices in the vector to
/// identify parents and children. This makes traversal and lookup very
/// efficient: retrieving a node's parent takes one indexing operation,
/// retrieving children takes one indexing operation per child, and
/// retrieving a node by random id takes one hash map lookup and one indexing
/// operation. Folder and bookmark ids live in separate namespaces, so the
/// tree keeps one index per kind.
#[derive(Clone, Debug)]
pub struct Tree {
    entries: Vec<Entry>,
    folder_index: HashMap<ItemId, usize>,
    bookmark_index: HashMap<ItemId, usize>,
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new(Folder::new(ROOT_ID, ""))
    }
}

impl Tree {
    /// Constructs a new tree rooted at the given folder.
    pub fn new(root: Folder) -> Tree {
        let mut folder_index = HashMap::new();
        folder_index.insert(root.id.clone(), 0);

        let entries = vec![Entry {
            parent_index: None,
            item: Item::Folder(root),
            child_indices: Vec::new(),
        }];

        Tree {
            entries,
            folder_index,
            bookmark_index: HashMap::new(),
        }
    }

    #[inline]
    pub fn root(&self) -> Node<'_> {
        self.node(0)
    }

    pub fn node_for(&self, kind: ItemKind, id: &ItemId) -> Option<Node<'_>> {
        self.index_for(kind).get(id).map(|index| self.node(*index))
    }

    #[inline]
    pub fn folder_for(&self, id: &ItemId) -> Option<Node<'_>> {
        self.node_for(ItemKind::Folder, id)
    }

    #[inline]
    pub fn bookmark_for(&self, id: &ItemId) -> Option<Node<'_>> {
        self.node_for(ItemKind::Bookmark, id)
    }

    #[inline]
    pub fn contains(&self, kind: ItemKind, id: &ItemId) -> bool {
        self.index_for(kind).contains_key(id)
    }

    /// Inserts an item as the last child of the given folder. The item's
    /// parent pointer is rewritten to agree with its position.
    pub fn insert(&mut self, parent_id: &ItemId, mut item: Item) -> Result<()> {
        if self.contains(item.kind(), item.id()) {
            return Err(ErrorKind::InconsistentTree("duplicate id", item.id().clone()).into());
        }
        let parent_index = match self.folder_index.get(parent_id) {
            Some(parent_index) => *parent_index,
            None => {
                return Err(
                    ErrorKind::InconsistentTree("missing parent folder", parent_id.clone()).into(),
                );
            },
        };
        let child_index = self.entries.len();
        item.set_parent_id(Some(parent_id.clone()));
        self.entries[parent_index].child_indices.push(child_index);
        self.index_for_mut(item.kind()).insert(item.id().clone(), child_index);
        self.entries.push(Entry {
            parent_index: Some(parent_index),
            item,
            child_indices: Vec::new(),
        });
        Ok(())
    }

    /// Reparents an item, appending it to the new parent's children. Moving
    /// a folder into itself or one of its descendants is a cycle and fails.
    pub fn move_item(&mut self, kind: ItemKind, id: &ItemId, new_parent_id: &ItemId) -> Result<()> {
        let index = match self.index_for(kind).get(id) {
            Some(index) => *index,
            None => return Err(ErrorKind::InconsistentTree("missing item", id.clone()).into()),
        };
        let new_parent_index = match self.folder_index.get(new_parent_id) {
            Some(parent_index) => *parent_index,
            None => {
                return Err(ErrorKind::InconsistentTree(
                    "missing destination folder",
                    new_parent_id.clone(),
                )
                .into());
            },
        };
        if kind == ItemKind::Folder && self.is_descendant_or_self(new_parent_id, id) {
            return Err(ErrorKind::InconsistentTree("folder cycle", id.clone()).into());
        }
        if let Some(old_parent_index) = self.entries[index].parent_index {
            self.entries[old_parent_index]
                .child_indices
                .retain(|child| *child != index);
        } else {
            return Err(ErrorKind::InconsistentTree("can't move the root", id.clone()).into());
        }
        self.entries[new_parent_index].child_indices.push(index);
        self.entries[index].parent_index = Some(new_parent_index);
        self.entries[index]
            .item
            .set_parent_id(Some(new_parent_id.clone()));
        Ok(())
    }

    /// Detaches an item and its descendants. The entries stay behind in the
    /// arena, but lose their index entries and are no longer reachable from
    /// the root.
    pub fn remove(&mut self, kind: ItemKind, id: &ItemId) -> Result<()> {
        let index = match self.index_for(kind).get(id) {
            Some(index) => *index,
            None => return Err(ErrorKind::InconsistentTree("missing item", id.clone()).into()),
        };
        let parent_index = match self.entries[index].parent_index {
            Some(parent_index) => parent_index,
            None => {
                return Err(ErrorKind::InconsistentTree("can't remove the root", id.clone()).into());
            },
        };
        self.entries[parent_index]
            .child_indices
            .retain(|child| *child != index);

        let mut pending = vec![index];
        while let Some(index) = pending.pop() {
            pending.extend(self.entries[index].child_indices.iter());
            let (kind, id) = {
                let item = &self.entries[index].item;
                (item.kind(), item.id().clone())
            };
            self.index_for_mut(kind).remove(&id);
        }
        Ok(())
    }

    /// Copies the observable fields of the payload onto the matching item.
    pub fn update(&mut self, payload: &Item) -> Result<()> {
        let index = match self.index_for(payload.kind()).get(payload.id()) {
            Some(index) => *index,
            None => {
                return Err(
                    ErrorKind::InconsistentTree("missing item", payload.id().clone()).into(),
                );
            },
        };
        match (&mut self.entries[index].item, payload) {
            (Item::Bookmark(item), Item::Bookmark(payload)) => {
                item.title = payload.title.clone();
                item.url = payload.url.clone();
            },
            (Item::Folder(item), Item::Folder(payload)) => {
                item.title = payload.title.clone();
            },
            _ => unreachable!("index is partitioned by kind"),
        }
        Ok(())
    }

    /// Rearranges a folder's children to match the given ordering. Entries
    /// naming children the folder doesn't have are skipped; children the
    /// ordering doesn't name keep their relative order at the end.
    pub fn reorder_children(&mut self, folder_id: &ItemId, order: &[OrderTarget]) -> Result<()> {
        let folder_index = match self.folder_index.get(folder_id) {
            Some(index) => *index,
            None => {
                return Err(
                    ErrorKind::InconsistentTree("missing folder", folder_id.clone()).into(),
                );
            },
        };
        let current = self.entries[folder_index].child_indices.clone();
        let mut remaining = current;
        let mut arranged = Vec::with_capacity(remaining.len());
        for target in order {
            let position = remaining.iter().position(|index| {
                let item = &self.entries[*index].item;
                item.kind() == target.kind && item.id() == &target.id
            });
            if let Some(position) = position {
                arranged.push(remaining.remove(position));
            } else {
                trace!("Ignoring unknown child {} in ordering for {}", target, folder_id);
            }
        }
        arranged.extend(remaining);
        self.entries[folder_index].child_indices = arranged;
        Ok(())
    }

    /// Flags a sparse folder as fetched.
    pub fn mark_folder_loaded(&mut self, id: &ItemId) -> Result<()> {
        let index = match self.folder_index.get(id) {
            Some(index) => *index,
            None => return Err(ErrorKind::InconsistentTree("missing folder", id.clone()).into()),
        };
        if let Item::Folder(ref mut folder) = self.entries[index].item {
            folder.loaded = true;
        }
        Ok(())
    }

    /// True if the folder `id` is `ancestor` or sits below it.
    pub fn is_descendant_or_self(&self, id: &ItemId, ancestor: &ItemId) -> bool {
        let mut node = match self.folder_for(id) {
            Some(node) => node,
            None => return false,
        };
        loop {
            if node.id() == ancestor {
                return true;
            }
            match node.parent() {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    /// Returns a copy of the tree with every id rewritten through the given
    /// direction of a mapping. Unmapped ids pass through unchanged.
    pub fn map_ids(&self, side: &SideMappings) -> Tree {
        let mut mapped = self.clone();
        for entry in &mut mapped.entries {
            entry.item.translate(side);
        }
        mapped.folder_index = self
            .folder_index
            .iter()
            .map(|(id, index)| (side.folders.get(id).unwrap_or(id).clone(), *index))
            .collect();
        mapped.bookmark_index = self
            .bookmark_index
            .iter()
            .map(|(id, index)| (side.bookmarks.get(id).unwrap_or(id).clone(), *index))
            .collect();
        mapped
    }

    fn node(&self, index: usize) -> Node<'_> {
        Node(self, &self.entries[index])
    }

    fn index_for(&self, kind: ItemKind) -> &HashMap<ItemId, usize> {
        match kind {
            ItemKind::Folder => &self.folder_index,
            ItemKind::Bookmark => &self.bookmark_index,
        }
    }

    fn index_for_mut(&mut self, kind: ItemKind) -> &mut HashMap<ItemId, usize> {
        match kind {
            ItemKind::Folder => &mut self.folder_index,
            ItemKind::Bookmark => &mut self.bookmark_index,
        }
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.root().to_ascii_string())
    }
}

#[cfg(test)]
impl PartialEq for Tree {
    fn eq(&self, other: &Tree) -> bool {
        fn nodes_equal(a: Node<'_>, b: Node<'_>) -> bool {
            if a.item() != b.item() {
                return false;
            }
            let a_children = a.children().collect::<Vec<_>>();
            let b_children = b.children().collect::<Vec<_>>();
            a_children.len() == b_children.len()
                && a_children
                    .into_iter()
                    .zip(b_children)
                    .all(|(a, b)| nodes_equal(a, b))
        }

        self.folder_index.len() == other.folder_index.len()
            && self.bookmark_index.len() == other.bookmark_index.len()
            && nodes_equal(self.root(), other.root())
    }
}

/// An entry wraps a tree item with references to its parent and children,
/// which index into the tree's `entries` vector. This indirection exists
/// because Rust is more strict about ownership of parents and children: we
/// can't have entries own their children without sacrificing fast random
/// lookup, and `Rc`/`Weak` cycles would cost us mutable access during
/// inserts and moves.
#[derive(Clone, Debug)]
struct Entry {
    parent_index: Option<usize>,
    item: Item,
    child_indices: Vec<usize>,
}

/// A convenience wrapper around `Entry` that dereferences to the containing
/// item, and follows indices for parents and children.
#[derive(Clone, Copy, Debug)]
pub struct Node<'t>(&'t Tree, &'t Entry);

impl<'t> Node<'t> {
    pub fn children<'n>(&'n self) -> impl Iterator<Item = Node<'t>> + 'n {
        self.1
            .child_indices
            .iter()
            .map(move |index| self.0.node(*index))
    }

    pub fn parent(&self) -> Option<Node<'t>> {
        self.1.parent_index.map(|index| self.0.node(index))
    }

    #[inline]
    pub fn item(&self) -> &'t Item {
        &self.1.item
    }

    /// Counts the descendants of this node.
    pub fn count(&self) -> usize {
        self.children().map(|child| 1 + child.count()).sum()
    }

    pub fn to_ascii_string(&self) -> String {
        self.to_ascii_fragment("")
    }

    fn to_ascii_fragment(&self, prefix: &str) -> String {
        match &self.1.item {
            Item::Folder(_) => match self.1.child_indices.len() {
                0 => format!("{}📂 {}", prefix, &self.1.item),
                _ => {
                    let children_prefix = format!("{}| ", prefix);
                    let children = self
                        .children()
                        .map(|n| n.to_ascii_fragment(&children_prefix))
                        .collect::<Vec<String>>()
                        .join("\n");
                    format!("{}📂 {}\n{}", prefix, &self.1.item, children)
                },
            },
            Item::Bookmark(_) => format!("{}🔖 {}", prefix, &self.1.item),
        }
    }
}

impl<'t> Deref for Node<'t> {
    type Target = Item;

    fn deref(&self) -> &Item {
        &self.1.item
    }
}

impl<'t> fmt::Display for Node<'t> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.1.item.fmt(f)
    }
}

/// An item in a local or server bookmark tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Item {
    Bookmark(Bookmark),
    Folder(Folder),
}

impl Item {
    #[inline]
    pub fn id(&self) -> &ItemId {
        match self {
            Item::Bookmark(bookmark) => &bookmark.id,
            Item::Folder(folder) => &folder.id,
        }
    }

    #[inline]
    pub fn parent_id(&self) -> Option<&ItemId> {
        match self {
            Item::Bookmark(bookmark) => bookmark.parent_id.as_ref(),
            Item::Folder(folder) => folder.parent_id.as_ref(),
        }
    }

    pub fn set_parent_id(&mut self, parent_id: Option<ItemId>) {
        match self {
            Item::Bookmark(bookmark) => bookmark.parent_id = parent_id,
            Item::Folder(folder) => folder.parent_id = parent_id,
        }
    }

    pub(crate) fn set_id(&mut self, id: ItemId) {
        match self {
            Item::Bookmark(bookmark) => bookmark.id = id,
            Item::Folder(folder) => folder.id = id,
        }
    }

    #[inline]
    pub fn title(&self) -> &str {
        match self {
            Item::Bookmark(bookmark) => &bookmark.title,
            Item::Folder(folder) => &folder.title,
        }
    }

    #[inline]
    pub fn kind(&self) -> ItemKind {
        match self {
            Item::Bookmark(_) => ItemKind::Bookmark,
            Item::Folder(_) => ItemKind::Folder,
        }
    }

    #[inline]
    pub fn is_folder(&self) -> bool {
        self.kind() == ItemKind::Folder
    }

    /// True iff the two items are the same variant with the same
    /// identity-neutral content: equal URLs for bookmarks, equal titles for
    /// folders. Used for heuristic pairing when no mapping relates the two
    /// sides yet.
    pub fn can_merge_with(&self, other: &Item) -> bool {
        match (self, other) {
            (Item::Bookmark(a), Item::Bookmark(b)) => a.url == b.url,
            (Item::Folder(a), Item::Folder(b)) => a.title == b.title,
            _ => false,
        }
    }

    /// Deep copy. The content hash annotation on folders describes the state
    /// the hash was computed against, so it only survives when the caller
    /// asks for it.
    pub fn clone_item(&self, with_hash: bool) -> Item {
        let mut cloned = self.clone();
        if !with_hash {
            if let Item::Folder(ref mut folder) = cloned {
                folder.hash = None;
            }
        }
        cloned
    }

    /// Rewrites this item's id and parent id through one direction of a
    /// mapping. Unmapped ids pass through unchanged.
    pub(crate) fn translate(&mut self, side: &SideMappings) {
        match self {
            Item::Bookmark(bookmark) => {
                if let Some(mapped) = side.bookmarks.get(&bookmark.id) {
                    bookmark.id = mapped.clone();
                }
                if let Some(parent_id) = &bookmark.parent_id {
                    if let Some(mapped) = side.folders.get(parent_id) {
                        bookmark.parent_id = Some(mapped.clone());
                    }
                }
            },
            Item::Folder(folder) => {
                if let Some(mapped) = side.folders.get(&folder.id) {
                    folder.id = mapped.clone();
                }
                if let Some(parent_id) = &folder.parent_id {
                    if let Some(mapped) = side.folders.get(parent_id) {
                        folder.parent_id = Some(mapped.clone());
                    }
                }
            },
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Item::Bookmark(bookmark) => {
                write!(f, "{:?} ({}; {})", bookmark.title, bookmark.id, bookmark.url)
            },
            Item::Folder(folder) => write!(f, "{:?} ({})", folder.title, folder.id),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bookmark {
    pub id: ItemId,
    pub parent_id: Option<ItemId>,
    pub title: String,
    pub url: String,
}

impl Bookmark {
    pub fn new(id: impl Into<ItemId>, title: &str, url: &str) -> Bookmark {
        Bookmark {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            url: url.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Folder {
    pub id: ItemId,
    pub parent_id: Option<ItemId>,
    pub title: String,
    /// Content hash assigned by an adapter; equal hashes mean equal
    /// subtrees, absent hashes mean nothing.
    pub hash: Option<String>,
    /// Sparse trees carry folders whose children haven't been fetched yet.
    pub loaded: bool,
}

impl Folder {
    pub fn new(id: impl Into<ItemId>, title: &str) -> Folder {
        Folder {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            hash: None,
            loaded: true,
        }
    }
}

/// Item kinds. Folder and bookmark ids live in separate namespaces, so most
/// id-keyed structures are partitioned by kind.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Folder,
    Bookmark,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ItemKind::Folder => "folder",
            ItemKind::Bookmark => "bookmark",
        })
    }
}

/// One slot in a folder ordering.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct OrderTarget {
    pub kind: ItemKind,
    pub id: ItemId,
}

impl OrderTarget {
    pub fn new(kind: ItemKind, id: ItemId) -> OrderTarget {
        OrderTarget { kind, id }
    }
}

impl fmt::Display for OrderTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// An owned subtree, detached from any `Tree`. Bulk imports hand these to
/// adapters, and tests inflate them into trees.
#[derive(Clone, Debug)]
pub struct Subtree {
    pub item: Item,
    pub children: Vec<Subtree>,
}

impl Subtree {
    pub fn leaf(item: Item) -> Subtree {
        Subtree {
            item,
            children: Vec::new(),
        }
    }

    /// Counts this node and all its descendants.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Subtree::count).sum::<usize>()
    }

    /// Inflates the subtree into a tree rooted at its top item, which must
    /// be a folder.
    pub fn into_tree(self) -> Result<Tree> {
        fn inflate(tree: &mut Tree, parent_id: &ItemId, subtree: Subtree) -> Result<()> {
            let id = subtree.item.id().clone();
            tree.insert(parent_id, subtree.item)?;
            for child in subtree.children {
                inflate(tree, &id, child)?;
            }
            Ok(())
        }

        let root = match self.item {
            Item::Folder(folder) => folder,
            Item::Bookmark(bookmark) => {
                return Err(
                    ErrorKind::InconsistentTree("subtree root must be a folder", bookmark.id)
                        .into(),
                );
            },
        };
        let root_id = root.id.clone();
        let mut tree = Tree::new(root);
        for child in self.children {
            inflate(&mut tree, &root_id, child)?;
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_duplicates_and_orphans() {
        let mut tree = Tree::default();
        tree.insert(&ROOT_ID, Item::Folder(Folder::new("1", "Toolbar")))
            .unwrap();
        tree.insert(
            &"1".into(),
            Item::Bookmark(Bookmark::new("1", "A", "http://a.example/")),
        )
        .unwrap();

        // A bookmark may share a folder's id; a second folder may not.
        assert!(tree
            .insert(&ROOT_ID, Item::Folder(Folder::new("1", "Dup")))
            .is_err());
        assert!(tree
            .insert(
                &"9".into(),
                Item::Bookmark(Bookmark::new("2", "B", "http://b.example/"))
            )
            .is_err());

        assert_eq!(tree.root().count(), 2);
        assert_eq!(
            tree.bookmark_for(&"1".into()).unwrap().parent_id(),
            Some(&"1".into())
        );
    }

    #[test]
    fn move_item_refuses_cycles() {
        let mut tree = Tree::default();
        tree.insert(&ROOT_ID, Item::Folder(Folder::new("1", "A")))
            .unwrap();
        tree.insert(&"1".into(), Item::Folder(Folder::new("2", "B")))
            .unwrap();

        let err = tree
            .move_item(ItemKind::Folder, &"1".into(), &"2".into())
            .unwrap_err();
        match err.kind() {
            ErrorKind::InconsistentTree(reason, _) => assert_eq!(*reason, "folder cycle"),
            kind => panic!("unexpected error {:?}", kind),
        }

        tree.move_item(ItemKind::Folder, &"2".into(), &ROOT_ID)
            .unwrap();
        assert_eq!(
            tree.folder_for(&"2".into()).unwrap().parent_id(),
            Some(&ROOT_ID)
        );
    }

    #[test]
    fn remove_detaches_the_whole_subtree() {
        let mut tree = Tree::default();
        tree.insert(&ROOT_ID, Item::Folder(Folder::new("1", "A")))
            .unwrap();
        tree.insert(&"1".into(), Item::Folder(Folder::new("2", "B")))
            .unwrap();
        tree.insert(
            &"2".into(),
            Item::Bookmark(Bookmark::new("1", "X", "http://x.example/")),
        )
        .unwrap();

        tree.remove(ItemKind::Folder, &"1".into()).unwrap();
        assert!(tree.folder_for(&"1".into()).is_none());
        assert!(tree.folder_for(&"2".into()).is_none());
        assert!(tree.bookmark_for(&"1".into()).is_none());
        assert_eq!(tree.root().count(), 0);
    }

    #[test]
    fn reorder_skips_unknown_children_and_keeps_leftovers() {
        let mut tree = Tree::default();
        for (id, title) in &[("1", "A"), ("2", "B"), ("3", "C")] {
            tree.insert(&ROOT_ID, Item::Folder(Folder::new(*id, title)))
                .unwrap();
        }
        tree.reorder_children(
            &ROOT_ID,
            &[
                OrderTarget::new(ItemKind::Folder, "3".into()),
                OrderTarget::new(ItemKind::Folder, "7".into()),
                OrderTarget::new(ItemKind::Folder, "1".into()),
            ],
        )
        .unwrap();
        let order = tree
            .root()
            .children()
            .map(|child| child.id().clone())
            .collect::<Vec<ItemId>>();
        assert_eq!(order, vec![ItemId::from("3"), ItemId::from("1"), ItemId::from("2")]);
    }
}
