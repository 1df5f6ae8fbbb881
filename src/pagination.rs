use crate::error::{CurationError, CurationResult};
use crate::trace_store::{CellId, TraceSet};

/// Number of pages for `total_items`; an empty list still has one (empty) page.
pub fn page_count(total_items: usize, page_size: usize) -> usize {
    if page_size == 0 {
        return 1;
    }
    total_items.div_ceil(page_size).max(1)
}

pub fn page(traces: &TraceSet, page_index: usize, page_size: usize) -> CurationResult<Vec<CellId>> {
    if page_size == 0 {
        return Err(CurationError::range("page size must be positive"));
    }
    let count = page_count(traces.len(), page_size);
    if page_index >= count {
        return Err(CurationError::range(format!(
            "page {page_index} out of range, {count} page(s) available"
        )));
    }
    let start = page_index * page_size;
    Ok(traces.cell_ids_in(start, start + page_size))
}

pub fn page_containing(traces: &TraceSet, cell_id: &CellId, page_size: usize) -> CurationResult<usize> {
    if page_size == 0 {
        return Err(CurationError::range("page size must be positive"));
    }
    traces
        .index_of(cell_id)
        .map(|i| i / page_size)
        .ok_or_else(|| CurationError::not_found(format!("no trace for cell {cell_id}")))
}

/// Page cursor shared by the list and chart views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pager {
    page_size: usize,
    current: usize,
}

impl Pager {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            current: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }

    pub fn count(&self, traces: &TraceSet) -> usize {
        page_count(traces.len(), self.page_size)
    }

    pub fn set(&mut self, traces: &TraceSet, page_index: usize) -> CurationResult<()> {
        let count = self.count(traces);
        if page_index >= count {
            return Err(CurationError::range(format!(
                "page {page_index} out of range, {count} page(s) available"
            )));
        }
        self.current = page_index;
        Ok(())
    }

    /// Moves by `delta` pages, stopping at the first and last page.
    pub fn advance(&mut self, traces: &TraceSet, delta: isize) -> usize {
        let last = self.count(traces) - 1;
        self.current = self.current.saturating_add_signed(delta).min(last);
        self.current
    }

    pub fn jump_to(&mut self, traces: &TraceSet, cell_id: &CellId) -> CurationResult<usize> {
        self.current = page_containing(traces, cell_id, self.page_size)?;
        Ok(self.current)
    }

    pub fn cells(&self, traces: &TraceSet) -> Vec<CellId> {
        page(traces, self.current, self.page_size).unwrap_or_default()
    }
}
