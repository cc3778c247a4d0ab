//! Cursor pagination over list endpoints.
//!
//! List endpoints accept `limit`, `order`, `after` and `before`, and return
//! `{data, first_id, last_id, has_more}`. [`CursorWalker`] turns that into a
//! lazy, forward-only sequence. The platform gives no snapshot isolation, so
//! concurrent mutation during a walk may produce duplicates or skip items;
//! callers must tolerate both. A walker is never restarted: start a new one.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One page from a list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorPage<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub first_id: Option<String>,
    #[serde(default)]
    pub last_id: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Which cursor to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Follow `last_id` via `after`.
    #[default]
    Forward,
    /// Follow `first_id` via `before`.
    Backward,
}

/// Sort order requested from the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Query parameters shared by every page of a walk.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub order: Option<Order>,
    pub direction: Direction,
    /// Endpoint-specific filters (e.g. `purpose`, `emails`).
    pub params: Vec<(String, String)>,
}

impl ListQuery {
    /// Create a forward query with endpoint defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the sort order.
    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    /// Walk backwards using `before`.
    pub fn backward(mut self) -> Self {
        self.direction = Direction::Backward;
        self
    }

    /// Add an endpoint-specific filter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Query pairs for a page request at `cursor`.
    pub fn to_pairs(&self, cursor: Option<&str>) -> Vec<(String, String)> {
        let mut pairs = self.params.clone();
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(order) = self.order {
            pairs.push(("order".to_string(), order.as_str().to_string()));
        }
        if let Some(cursor) = cursor {
            let key = match self.direction {
                Direction::Forward => "after",
                Direction::Backward => "before",
            };
            pairs.push((key.to_string(), cursor.to_string()));
        }
        pairs
    }
}

/// Lazy iterator over every item of a cursor-paginated collection.
///
/// `fetch` receives the query pairs for one page. The walker is fused: it
/// stops after `has_more = false`, an empty page, a page without a cursor,
/// or the first error.
pub struct CursorWalker<T, F>
where
    F: FnMut(&[(String, String)]) -> Result<CursorPage<T>>,
{
    fetch: F,
    query: ListQuery,
    cursor: Option<String>,
    buffer: VecDeque<T>,
    finished: bool,
    pages: usize,
}

impl<T, F> CursorWalker<T, F>
where
    F: FnMut(&[(String, String)]) -> Result<CursorPage<T>>,
{
    /// Create a walker starting at the beginning of the collection.
    pub fn new(query: ListQuery, fetch: F) -> Self {
        Self {
            fetch,
            query,
            cursor: None,
            buffer: VecDeque::new(),
            finished: false,
            pages: 0,
        }
    }

    /// Fetch the next page directly.
    ///
    /// Items buffered by the iterator interface are not included; use one
    /// interface per walker.
    pub fn next_page(&mut self) -> Option<Result<CursorPage<T>>> {
        if self.finished {
            return None;
        }

        let pairs = self.query.to_pairs(self.cursor.as_deref());
        let page = match (self.fetch)(&pairs) {
            Ok(page) => page,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        self.pages += 1;

        let next = match self.query.direction {
            Direction::Forward => page.last_id.clone(),
            Direction::Backward => page.first_id.clone(),
        };

        match next {
            Some(cursor) if page.has_more && !page.data.is_empty() => {
                self.cursor = Some(cursor);
            }
            _ => self.finished = true,
        }

        Some(Ok(page))
    }

    /// Number of pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Drain the walk into a vector, stopping at the first error.
    pub fn collect_all(self) -> Result<Vec<T>> {
        self.collect()
    }
}

impl<T, F> Iterator for CursorWalker<T, F>
where
    F: FnMut(&[(String, String)]) -> Result<CursorPage<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            match self.next_page()? {
                Ok(page) => self.buffer.extend(page.data),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
