use std::collections::HashMap;

use tracing::debug;

use crate::{DocumentId, PageContent};

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PageLookup<'a> {
    /// Extraction is outstanding; render a placeholder and wait for `ContentReady`.
    Pending,
    Ready(&'a PageContent),
}

impl<'a> PageLookup<'a> {
    pub fn ready(self) -> Option<&'a PageContent> {
        match self {
            PageLookup::Ready(content) => Some(content),
            PageLookup::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, PageLookup::Pending)
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    Ready(PageContent),
}

/// Extracted page content for the current document, keyed by 1-based page number.
///
/// Entries live until the document changes. With a capacity set, ready entries furthest
/// from the reference page are evicted first; pending entries are kept.
#[derive(Debug, Default)]
pub struct PageContentCache {
    document: Option<DocumentId>,
    entries: HashMap<usize, Slot>,
    capacity: Option<usize>,
}

impl PageContentCache {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            document: None,
            entries: HashMap::new(),
            capacity: capacity.filter(|&c| c > 0),
        }
    }

    pub fn document(&self) -> Option<DocumentId> {
        self.document
    }

    /// Clears every entry and scopes the cache to `document`.
    pub fn reset(&mut self, document: Option<DocumentId>) {
        if !self.entries.is_empty() {
            debug!(entries = self.entries.len(), "clearing page content cache");
        }
        self.entries.clear();
        self.document = document;
    }

    pub fn lookup(&self, page: usize) -> Option<PageLookup<'_>> {
        self.entries.get(&page).map(|slot| match slot {
            Slot::Pending => PageLookup::Pending,
            Slot::Ready(content) => PageLookup::Ready(content),
        })
    }

    /// Records that an extraction for `page` has started. Returns false when the page is
    /// already pending or ready.
    pub fn mark_pending(&mut self, page: usize) -> bool {
        if self.entries.contains_key(&page) {
            return false;
        }
        self.entries.insert(page, Slot::Pending);
        true
    }

    /// Stores extracted content. Completions for another document are dropped.
    pub fn fill(
        &mut self,
        document: DocumentId,
        page: usize,
        content: PageContent,
        reference_page: usize,
    ) -> bool {
        if self.document != Some(document) {
            debug!(page, "dropping content for a superseded document");
            return false;
        }
        self.entries.insert(page, Slot::Ready(content));
        self.evict_around(reference_page);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ready_pages(&self) -> Vec<usize> {
        let mut pages: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(page, _)| *page)
            .collect();
        pages.sort_unstable();
        pages
    }

    fn evict_around(&mut self, reference_page: usize) {
        let Some(capacity) = self.capacity else {
            return;
        };
        let mut ready = self.ready_pages();
        if ready.len() <= capacity {
            return;
        }
        ready.sort_by_key(|page| (page.abs_diff(reference_page), *page));
        for stale in ready.into_iter().skip(capacity) {
            debug!(page = stale, reference_page, "evicting cached page content");
            self.entries.remove(&stale);
        }
    }
}
