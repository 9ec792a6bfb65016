use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::KiraError;
use crate::store::Store;

/// One offset-addressed page of a paginated endpoint.
pub trait PageSource: Send + Sync {
    fn fetch_page(&self, offset: u64, page_size: u64) -> Result<Vec<Value>, KiraError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub offset: u64,
    pub records: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FetchSummary {
    pub start_offset: u64,
    pub pages: usize,
    pub records: usize,
    /// Offset of the empty page that ended the fetch.
    pub terminal_offset: u64,
}

/// Sequential offset pagination with one cooled-down retry per page.
///
/// Offsets advance by exactly `page_size`. A zero-record page ends the
/// sequence; a page that fails twice ends it with `KiraError::PageFetch`
/// carrying the offset, and no later page is requested.
pub struct PagedFetcher<'a, S: PageSource + ?Sized> {
    source: &'a S,
    page_size: u64,
    next_offset: u64,
    cooldown: Duration,
    finished: bool,
}

impl<'a, S: PageSource + ?Sized> PagedFetcher<'a, S> {
    pub fn new(source: &'a S, start_offset: u64, page_size: u64, cooldown: Duration) -> Self {
        Self {
            source,
            page_size,
            next_offset: start_offset,
            cooldown,
            finished: false,
        }
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    fn fetch_with_retry(&self, offset: u64) -> Result<Vec<Value>, KiraError> {
        match self.source.fetch_page(offset, self.page_size) {
            Ok(records) => Ok(records),
            Err(first) => {
                warn!(offset, error = %first, cooldown_secs = self.cooldown.as_secs(), "page fetch failed; retrying once");
                thread::sleep(self.cooldown);
                self.source
                    .fetch_page(offset, self.page_size)
                    .map_err(|second| KiraError::PageFetch {
                        offset,
                        message: second.to_string(),
                    })
            }
        }
    }

    /// Drains the fetcher, persisting each non-empty page under `store`
    /// before the next one is requested.
    pub fn fetch_all(mut self, store: &Store) -> Result<FetchSummary, KiraError> {
        let start_offset = self.next_offset;
        let mut pages = 0usize;
        let mut records = 0usize;
        while let Some(page) = self.next() {
            let page = page?;
            Store::write_json(&store.page_path(page.offset), &page.records)?;
            pages += 1;
            records += page.records.len();
            info!(offset = page.offset, records = page.records.len(), "page persisted");
        }
        Ok(FetchSummary {
            start_offset,
            pages,
            records,
            terminal_offset: self.next_offset,
        })
    }
}

impl<S: PageSource + ?Sized> Iterator for PagedFetcher<'_, S> {
    type Item = Result<Page, KiraError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let offset = self.next_offset;
        match self.fetch_with_retry(offset) {
            Ok(records) if records.is_empty() => {
                self.finished = true;
                None
            }
            Ok(records) => {
                self.next_offset = offset + self.page_size;
                Some(Ok(Page { offset, records }))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Loads persisted pages in offset order.
pub fn load_pages(store: &Store) -> Result<Vec<Page>, KiraError> {
    store
        .list_pages()?
        .into_iter()
        .map(|(offset, path)| {
            let records: Vec<Value> = Store::read_json(&path)?;
            Ok(Page { offset, records })
        })
        .collect()
}
