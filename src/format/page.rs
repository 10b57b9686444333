//! Page directory entries

use serde::{Deserialize, Serialize};

/// Page identifier within a shard
pub type PageId = u64;

/// Page type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    /// Opaque record payloads
    Blob,
    /// Self-describing label records
    Raw,
}

/// One page directory entry as recorded in the shard header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// Page ID within the shard
    pub page_id: PageId,
    /// Page type
    pub page_type: PageType,
    /// Ordinal of this page among pages of the same type in its shard;
    /// for BLOB pages this is the row group id
    pub page_type_id: u64,
    /// First logical row stored in this page
    pub start_row_id: u64,
    /// One past the last logical row stored in this page
    pub end_row_id: u64,
    /// Bytes in use within the fixed-size page slot
    pub page_size: u64,
}

impl Page {
    pub fn is_blob(&self) -> bool {
        self.page_type == PageType::Blob
    }

    /// Number of rows in the page, or `None` when the recorded range is
    /// inverted (a corrupt directory entry).
    pub fn row_count(&self) -> Option<u64> {
        self.end_row_id.checked_sub(self.start_row_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_count() {
        let page = Page {
            page_id: 0,
            page_type: PageType::Blob,
            page_type_id: 0,
            start_row_id: 4,
            end_row_id: 9,
            page_size: 128,
        };
        assert!(page.is_blob());
        assert_eq!(page.row_count(), Some(5));
    }

    #[test]
    fn test_inverted_range() {
        let page = Page {
            page_id: 1,
            page_type: PageType::Raw,
            page_type_id: 0,
            start_row_id: 9,
            end_row_id: 4,
            page_size: 0,
        };
        assert!(!page.is_blob());
        assert_eq!(page.row_count(), None);
    }
}
