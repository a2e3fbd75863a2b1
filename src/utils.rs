use crate::api::MAX_RESULT_WINDOW;

/// return the number of pages needed to cover `total` results, pages being 1-based
pub fn page_count(total: u64, per_page: u32) -> u32 {
    if per_page == 0 {
        return 0;
    }
    total.div_ceil(per_page as u64) as u32
}

/// highest page the API will serve at this page size; the whole page must
/// fit inside the result window
pub fn max_reachable_page(per_page: u32) -> u32 {
    if per_page == 0 {
        return 0;
    }
    (MAX_RESULT_WINDOW / per_page as u64) as u32
}
