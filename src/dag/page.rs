// src/dag/page.rs

//! Truncated listings for large fan-out.

use serde::Serialize;

/// The first `items.len()` entries of a listing plus how many exist in total.
///
/// Collaborators render this as "first N of M"; ordering is always the
/// insertion order of the underlying relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn truncate<I>(iter: I, limit: usize) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut items = Vec::new();
        let mut total = 0;
        for item in iter {
            if total < limit {
                items.push(item);
            }
            total += 1;
        }
        Self { items, total }
    }

    /// Whether entries were left out.
    pub fn is_truncated(&self) -> bool {
        self.items.len() < self.total
    }

    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
        }
    }
}
