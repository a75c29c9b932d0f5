use crate::types::{FeedEntry, Pagination};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

pub fn page_size(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Slice one 0-based page out of already-ordered entries. Pages past the end
/// are empty with `has_more == false`.
pub fn page(
    entries: &[FeedEntry],
    page_index: usize,
    page_size: usize,
) -> (Vec<FeedEntry>, Pagination) {
    let total = entries.len();
    let start = page_index.saturating_mul(page_size).min(total);
    let end = start.saturating_add(page_size).min(total);

    (
        entries[start..end].to_vec(),
        Pagination {
            page: page_index,
            page_size,
            total,
            has_more: end < total,
        },
    )
}
