// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

/// A generated device identifier: a prefix followed by its ordinal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot {
    pub ordinal: usize,
    pub name: String,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Hands out `<prefix>0`, `<prefix>1`, ... within a single pass.
///
/// An ordinal is never handed out twice, even if the device it was
/// allocated for could not be set up.
#[derive(Debug)]
pub struct OrdinalAllocator {
    prefix: String,
    next: usize,
}

impl OrdinalAllocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), next: 0 }
    }

    pub fn next_slot(&mut self) -> Slot {
        let ordinal = self.next;
        self.next += 1;
        Slot { ordinal, name: format!("{}{}", self.prefix, ordinal) }
    }

    /// Number of slots handed out so far.
    pub fn allocated(&self) -> usize {
        self.next
    }
}
