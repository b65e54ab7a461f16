//! Lock resource keys across the granularities spec §3 names: database,
//! table, page, row, and index gap ranges.

use serde::{Deserialize, Serialize};

use crate::page::{PageId, RowId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKey {
    Database,
    Table(u32),
    Page(u32, PageId),
    Row(u32, RowId),
    /// `(index_id, low, high)` — conflict is evaluated by [`crate::lock::gap`],
    /// not by key equality; this variant only identifies the index whose
    /// wait queue/graph a gap request participates in.
    Gap(u32),
}
