//! Record listing parameters.

use super::Record;
use crate::engine::SortDirection;
use serde_json::Value as JsonValue;

/// Page used when none (or zero) is given.
pub const DEFAULT_PAGE: u64 = 1;

/// Page size used when none (or zero) is given.
pub const DEFAULT_PAGE_SIZE: u64 = 10;

/// Sort column used when the requested one is not a resolved column.
pub const DEFAULT_SORT_COLUMN: &str = "created_at";

/// A filter on one column.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFilter {
    /// Column equals the value after coercion to the column's type.
    Eq(String, JsonValue),
    /// Column's text form contains the substring.
    Contains(String, String),
}

impl QueryFilter {
    /// Filtered column.
    pub fn column(&self) -> &str {
        match self {
            QueryFilter::Eq(c, _) | QueryFilter::Contains(c, _) => c,
        }
    }
}

/// Filters, sort and pagination for a record listing.
///
/// Filters and the sort column are checked against the resolved schema at
/// execution time: filters on unknown columns are ignored and an unknown
/// sort column falls back to `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    /// Conjunctive filters.
    pub filters: Vec<QueryFilter>,
    /// Requested sort column.
    pub sort_column: Option<String>,
    /// Sort direction.
    pub direction: SortDirection,
    /// 1-based page.
    pub page: u64,
    /// Records per page.
    pub page_size: u64,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            sort_column: None,
            direction: SortDirection::Desc,
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl RecordQuery {
    /// First page, newest first.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality filter.
    pub fn filter_eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.filters.push(QueryFilter::Eq(column.into(), value.into()));
        self
    }

    /// Add a substring filter. Blank needles are ignored.
    pub fn filter_contains(mut self, column: impl Into<String>, needle: impl Into<String>) -> Self {
        let needle = needle.into();
        if !needle.trim().is_empty() {
            self.filters.push(QueryFilter::Contains(column.into(), needle));
        }
        self
    }

    /// Add substring filters from a JSON object of `column -> value`.
    ///
    /// Null and blank values are skipped; non-string scalars match on their
    /// text form.
    pub fn filter_object(mut self, filters: &Record) -> Self {
        for (column, value) in filters {
            let needle = match value {
                JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => continue,
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            self = self.filter_contains(column.clone(), needle);
        }
        self
    }

    /// Sort by a column.
    pub fn sort_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.sort_column = Some(column.into());
        self.direction = direction;
        self
    }

    /// Sort using request parameters: `"ascend"` sorts ascending, anything
    /// else descending.
    pub fn sort_params(mut self, column: Option<&str>, order: Option<&str>) -> Self {
        self.sort_column = column
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        self.direction = match order {
            Some("ascend") => SortDirection::Asc,
            _ => SortDirection::Desc,
        };
        self
    }

    /// Select a page. Zero falls back to the defaults.
    pub fn paginate(mut self, page: u64, page_size: u64) -> Self {
        self.page = if page > 0 { page } else { DEFAULT_PAGE };
        self.page_size = if page_size > 0 {
            page_size
        } else {
            DEFAULT_PAGE_SIZE
        };
        self
    }

    /// Rows to skip.
    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

/// One page of records.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPage {
    /// Records on this page.
    pub records: Vec<Record>,
    /// Matching records across all pages.
    pub total: u64,
    /// 1-based page.
    pub page: u64,
    /// Requested page size.
    pub page_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let query = RecordQuery::new();
        assert_eq!(query.page, 1);
        assert_eq!(query.page_size, 10);
        assert_eq!(query.offset(), 0);
        assert_eq!(query.direction, SortDirection::Desc);
    }

    #[test]
    fn test_paginate() {
        let query = RecordQuery::new().paginate(3, 25);
        assert_eq!(query.offset(), 50);

        let query = RecordQuery::new().paginate(0, 0);
        assert_eq!((query.page, query.page_size), (1, 10));
    }

    #[test]
    fn test_sort_params() {
        let query = RecordQuery::new().sort_params(Some("name"), Some("ascend"));
        assert_eq!(query.sort_column.as_deref(), Some("name"));
        assert_eq!(query.direction, SortDirection::Asc);

        let query = RecordQuery::new().sort_params(Some(" "), Some("descend"));
        assert_eq!(query.sort_column, None);
        assert_eq!(query.direction, SortDirection::Desc);
    }

    #[test]
    fn test_filter_object() {
        let filters = json!({"name": "ann", "age": 4, "note": "", "x": null});
        let query = RecordQuery::new().filter_object(filters.as_object().unwrap());
        assert_eq!(
            query.filters,
            vec![
                QueryFilter::Contains("age".into(), "4".into()),
                QueryFilter::Contains("name".into(), "ann".into()),
            ]
        );
    }
}
