/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{fmt, result};

use failure::{Backtrace, Context, Fail};

use crate::id::ItemId;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub struct Error(Context<ErrorKind>);

impl Fail for Error {
    #[inline]
    fn cause(&self) -> Option<&dyn Fail> {
        self.0.cause()
    }

    #[inline]
    fn backtrace(&self) -> Option<&Backtrace> {
        self.0.backtrace()
    }
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error {
    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        self.0.get_context()
    }

    /// Wraps an error raised by an external collaborator, preserving it as
    /// the cause.
    pub fn adapter<F: Fail>(err: F) -> Error {
        Error(err.context(ErrorKind::Adapter))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Error {
        Error(Context::new(kind))
    }
}

impl From<Context<ErrorKind>> for Error {
    #[inline]
    fn from(inner: Context<ErrorKind>) -> Error {
        Error(inner)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Fail)]
pub enum ErrorKind {
    /// The tree violates a structural invariant: a duplicate id, an orphaned
    /// or misparented item, or a folder cycle. Fatal for the sync run.
    #[fail(display = "inconsistent tree: {} ({})", _1, _0)]
    InconsistentTree(&'static str, ItemId),

    /// The mapping table refers to an item that doesn't exist where it must.
    #[fail(display = "mapping refers to missing item {}", _0)]
    InconsistentMapping(ItemId),

    /// Undoing one of a pair of crossing folder moves would itself create a
    /// cycle, so the conflict can't be broken.
    #[fail(display = "can't untangle crossing moves of {} and {}", _0, _1)]
    HierarchyReversalUnresolvable(ItemId, ItemId),

    /// An error surfaced by a tree provider or the mapping persistence.
    #[fail(display = "adapter error")]
    Adapter,
}
