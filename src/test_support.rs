/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared helpers for the inline test modules.

use std::sync::Once;

/// Builds a `Subtree` literal. The bare `{ ... }` form roots the subtree at
/// a sentinel-id folder, mirroring how adapters hand over whole trees.
///
/// ```ignore
/// let tree = nodes!({
///     ("1", folder["Menu"], {
///         ("1", bookmark["Example", "http://example.com/"])
///     })
/// })
/// .into_tree()?;
/// ```
macro_rules! nodes {
    ({ $(( $($children:tt)+ )),* }) => {
        nodes!("-1", folder[""], { $(( $($children)+ )),* })
    };
    ($id:expr, folder[$title:expr]) => {
        $crate::tree::Subtree::leaf($crate::tree::Item::Folder($crate::tree::Folder::new(
            $id, $title,
        )))
    };
    ($id:expr, folder[$title:expr], { $(( $($children:tt)+ )),* }) => {{
        let mut node = nodes!($id, folder[$title]);
        $( node.children.push(nodes!($($children)+)); )*
        node
    }};
    ($id:expr, bookmark[$title:expr, $url:expr]) => {
        $crate::tree::Subtree::leaf($crate::tree::Item::Bookmark($crate::tree::Bookmark::new(
            $id, $title, $url,
        )))
    };
}

pub fn before_each() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        env_logger::init();
    });
}
