//! Page arithmetic shared by every paged query.
//!
//! Callers pass a 0-based page; responses carry it 1-based. A page past the
//! end clamps to the last page instead of failing.

use serde::{Deserialize, Serialize};

use blockdex_core::constants::MAX_ITEMS_ON_PAGE;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Paging {
    /// 1-based.
    pub page: i64,
    /// `-1` when the total is unknown.
    pub total_pages: i64,
    pub items_on_page: i64,
}

/// Result of [`compute_paging`]: the paging block and the `from..to` slice of
/// the item list, plus the 0-based page actually served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlice {
    pub paging: Paging,
    pub from: usize,
    pub to: usize,
    pub page: usize,
}

/// Clamp a requested page size to `1..=MAX_ITEMS_ON_PAGE`.
pub fn sanitize_items_on_page(items: i64) -> i64 {
    items.clamp(1, MAX_ITEMS_ON_PAGE)
}

/// Split `count` items into pages of `items_on_page` and select `page`.
pub fn compute_paging(count: usize, page: i64, items_on_page: i64) -> PageSlice {
    let items = sanitize_items_on_page(items_on_page) as usize;
    let mut page = page.max(0) as usize;
    let total_pages = count.saturating_sub(1) / items;
    if page.saturating_mul(items) >= count {
        page = total_pages;
    }
    let from = page.saturating_mul(items);
    let to = (page + 1).saturating_mul(items).min(count);
    PageSlice {
        paging: Paging { page: page as i64 + 1, total_pages: total_pages as i64 + 1, items_on_page: items as i64 },
        from: from.min(to),
        to,
        page,
    }
}

/// Convert a 1-based page from a request into the 0-based form above.
pub fn zero_based(page: i64) -> i64 {
    (page - 1).max(0)
}
