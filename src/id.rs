/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{fmt, ops, str};

use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

/// An opaque item identifier, unique per kind within one side of a sync.
///
/// Adapters hand out arbitrary ids: short decimal strings, GUIDs, composite
/// strings. Comparisons are always string comparisons, so a numeric id and
/// its decimal rendering are the same id.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemId(Repr);

/// The internal representation of an id. Most ids adapters assign are short,
/// and fit on the stack without a heap allocation; longer ids fall back to a
/// heap-allocated string. Construction always zero-pads the inline buffer, so
/// the derived comparisons are sound.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
enum Repr {
    Inline(u8, [u8; 14]),
    Heap(Box<str>),
}

/// The sentinel id of a tree's root. Roots on both sides share it and are
/// paired by convention.
pub const ROOT_ID: ItemId =
    ItemId(Repr::Inline(2, [b'-', b'1', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]));

impl ItemId {
    pub fn new(s: &str) -> ItemId {
        let repr = if s.len() <= 14 {
            let mut bytes = [0u8; 14];
            bytes[..s.len()].copy_from_slice(s.as_bytes());
            Repr::Inline(s.len() as u8, bytes)
        } else {
            Repr::Heap(s.into())
        };
        ItemId(repr)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        match &self.0 {
            // Only whole `str`s go in, so slicing the written prefix back out
            // is always valid UTF-8.
            Repr::Inline(len, bytes) => {
                str::from_utf8(&bytes[..*len as usize]).unwrap_or_default()
            },
            Repr::Heap(s) => s,
        }
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        *self == ROOT_ID
    }
}

impl<'a> From<&'a str> for ItemId {
    #[inline]
    fn from(s: &'a str) -> ItemId {
        ItemId::new(s)
    }
}

impl From<String> for ItemId {
    #[inline]
    fn from(s: String) -> ItemId {
        ItemId::new(&s)
    }
}

impl From<i64> for ItemId {
    #[inline]
    fn from(n: i64) -> ItemId {
        ItemId::new(&n.to_string())
    }
}

impl AsRef<str> for ItemId {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl ops::Deref for ItemId {
    type Target = str;

    #[inline]
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for ItemId {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<'a> PartialEq<&'a str> for ItemId {
    #[inline]
    fn eq(&self, other: &&'a str) -> bool {
        self.as_str() == *other
    }
}

// The default Debug impl would dump the padded buffer.
impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ItemId({:?})", self.as_str())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}

impl Serialize for ItemId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ItemId, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = ItemId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an item id string")
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<ItemId, E> {
                Ok(ItemId::new(s))
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_and_heap_reprs_compare_by_string() {
        let short = ItemId::new("42");
        let long = ItemId::new("bm-a5c2f0e8-9913-44d1");
        assert_eq!(short, "42");
        assert_eq!(short, ItemId::from(42));
        assert_eq!(long.as_str(), "bm-a5c2f0e8-9913-44d1");
        assert_ne!(short, long);
        assert!(ROOT_ID.is_root());
        assert_eq!(ROOT_ID, ItemId::from(-1));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ItemId::new("7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"7\"");
        let back: ItemId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(back, id);
    }
}
