//! Page-based pagination.
//!
//! ```rust
//! use mongo_template::pagination::{PageInput, PageOutput};
//!
//! // Page 3 with 25 items per page
//! let input = PageInput::new(3, 25);
//! assert_eq!(input.skip(), 50);
//!
//! // Page 0 is read as the first page
//! let first = PageInput::new(0, 10);
//! assert_eq!(first.skip(), 0);
//!
//! let output = PageOutput::new(first, 25, vec!["a"; 10]);
//! assert_eq!(output.page_total, 3);
//! ```

use serde::{Deserialize, Serialize};

/// A requested page. Pages are 1-indexed; `0` is read as `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInput {
    /// Page number.
    pub page: u64,
    /// Documents per page.
    pub page_size: u64,
}

impl PageInput {
    /// Create a page request.
    pub fn new(page: u64, page_size: u64) -> Self {
        Self { page, page_size }
    }

    /// The page number with `0` normalized to `1`.
    pub fn page(&self) -> u64 {
        self.page.max(1)
    }

    /// Documents to skip to reach this page.
    pub fn skip(&self) -> u64 {
        (self.page() - 1).saturating_mul(self.page_size)
    }

    /// Documents to read for this page, `None` when the page size is unbounded.
    pub fn limit(&self) -> Option<u64> {
        (self.page_size > 0).then_some(self.page_size)
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageOutput<T> {
    /// Page number, as requested.
    pub page: u64,
    /// Documents per page, as requested.
    pub page_size: u64,
    /// Number of pages.
    pub page_total: u64,
    /// Documents matching the filter across all pages.
    pub total: u64,
    /// Documents of this page.
    pub content: Vec<T>,
}

impl<T> PageOutput<T> {
    /// Build a page from the request, the total match count, and the content.
    ///
    /// `page_total` is `ceil(total / page_size)`. It is `0` when nothing
    /// matched, and `1` when the page size is zero but content was found.
    pub fn new(input: PageInput, total: u64, content: Vec<T>) -> Self {
        let page_total = if input.page_size == 0 {
            u64::from(total > 0 || !content.is_empty())
        } else {
            total.div_ceil(input.page_size)
        };

        Self {
            page: input.page,
            page_size: input.page_size,
            page_total,
            total,
            content,
        }
    }

    /// Whether a page follows this one.
    pub fn has_next(&self) -> bool {
        self.page.max(1) < self.page_total
    }

    /// Map the content, keeping the counters.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PageOutput<U> {
        PageOutput {
            page: self.page,
            page_size: self.page_size,
            page_total: self.page_total,
            total: self.total,
            content: self.content.into_iter().map(f).collect(),
        }
    }

    /// Number of documents on this page.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether this page holds no documents.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl<T> IntoIterator for PageOutput<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.content.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_input_skip() {
        assert_eq!(PageInput::new(1, 20).skip(), 0);
        assert_eq!(PageInput::new(2, 20).skip(), 20);
        assert_eq!(PageInput::new(0, 20).skip(), 0);
        assert_eq!(PageInput::new(0, 20).page(), 1);
    }

    #[test]
    fn test_page_input_limit() {
        assert_eq!(PageInput::new(1, 20).limit(), Some(20));
        assert_eq!(PageInput::new(1, 0).limit(), None);
    }

    #[test]
    fn test_page_total_rounds_up() {
        let output = PageOutput::new(PageInput::new(0, 10), 25, vec![0; 10]);
        assert_eq!(output.page_total, 3);
        assert_eq!(output.page, 0);
        assert!(output.has_next());

        let exact = PageOutput::new(PageInput::new(2, 10), 20, vec![0; 10]);
        assert_eq!(exact.page_total, 2);
        assert!(!exact.has_next());
    }

    #[test]
    fn test_page_total_empty() {
        let output: PageOutput<i32> = PageOutput::new(PageInput::new(1, 10), 0, vec![]);
        assert_eq!(output.page_total, 0);
        assert!(output.is_empty());
        assert!(!output.has_next());
    }

    #[test]
    fn test_page_total_without_page_size() {
        let output = PageOutput::new(PageInput::new(1, 0), 4, vec![1, 2, 3, 4]);
        assert_eq!(output.page_total, 1);
    }

    #[test]
    fn test_page_output_json_shape() {
        let output = PageOutput::new(PageInput::new(1, 10), 1, vec!["a"]);
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["pageTotal"], 1);
        assert_eq!(json["pageSize"], 10);
        assert_eq!(json["content"][0], "a");
    }

    #[test]
    fn test_map_keeps_counters() {
        let output = PageOutput::new(PageInput::new(1, 2), 3, vec![1, 2]).map(|n| n * 10);
        assert_eq!(output.content, vec![10, 20]);
        assert_eq!(output.total, 3);
        assert_eq!(output.page_total, 2);
    }
}
