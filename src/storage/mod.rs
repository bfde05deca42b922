//! # Storage Layer
//!
//! The bottom of the engine: a paged file, the page cache that bounds how
//! much of it stays materialised, and the pager that ties both to the
//! changeset discipline the transaction layer relies on.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                  Pager                     │
//! │  fetch / alloc / free / mark_dirty /       │
//! │  flush_changeset / purge                   │
//! ├──────────────┬──────────────┬──────────────┤
//! │    Cache     │  Changeset   │  PagedFile   │
//! │ buckets +    │ ordered      │ positioned   │
//! │ totallist    │ dirty set    │ page I/O     │
//! └──────────────┴──────────────┴──────────────┘
//! ```
//!
//! Pages hand out [`page::PageHandle`]s (`Arc<RwLock<PageBuf>>`); an
//! outstanding handle pins its page in the cache. All on-disk integers are
//! little-endian via `zerocopy` wrapper types.

mod cache;
mod changeset;
mod file;
mod page;
mod pager;

pub use cache::Cache;
pub use changeset::Changeset;
pub use file::PagedFile;
pub use page::{new_handle, PageBuf, PageHandle, PageId, PageKind, PersistedPageHeader};
pub use pager::Pager;
