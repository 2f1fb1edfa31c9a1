// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address-space introspection for the calling context. Pure queries: no
//! faults, no side effects, safe to call from inside a fault handler.

use std::ops::Range;

use axon::{PageAttrs, SysResult};

use crate::env::Env;

impl Env<'_> {
    /// Mapping covering `va`, if any.
    pub fn page_attrs(&self, va: usize) -> SysResult<Option<PageAttrs>> {
        self.kernel().page_attrs(self.id(), va)
    }

    /// Whether the page containing `va` is present.
    pub fn is_mapped(&self, va: usize) -> SysResult<bool> {
        Ok(self.page_attrs(va)?.is_some_and(|attrs| attrs.is_present()))
    }

    /// Whether the page containing `va` has been written since it was last (re)mapped.
    pub fn is_dirty(&self, va: usize) -> SysResult<bool> {
        Ok(self.page_attrs(va)?.is_some_and(|attrs| attrs.is_dirty()))
    }

    /// Whether the page containing `va` is marked copy-on-write.
    pub fn is_cow(&self, va: usize) -> SysResult<bool> {
        Ok(self.page_attrs(va)?.is_some_and(|attrs| attrs.is_cow()))
    }

    /// Mappings in `range`, in address order.
    pub fn mapped_pages(&self, range: Range<usize>) -> SysResult<Vec<(usize, PageAttrs)>> {
        self.kernel().mapped_pages(self.id(), range)
    }
}
