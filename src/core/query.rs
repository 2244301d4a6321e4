//! List parameters, ordering and pagination

use super::entity::{DeletedState, Entity};
use super::error::{CrudError, FieldErrors};
use super::filter::{FilterMap, FilterPolicy};
use crate::config::PaginationConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Query-string keys that are never treated as filters
pub const RESERVED_PARAMS: [&str; 5] =
    ["page", "per_page", "sort_by", "deleted_state", "include_soft_deleted"];

/// One ordering key; `-field` sorts descending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }

    /// Parse `"name"` or `"-created_at"`
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw.strip_prefix('-') {
            Some("") => None,
            Some(field) => Some(Self::desc(field)),
            None if raw.is_empty() => None,
            None => Some(Self::asc(raw)),
        }
    }

    /// Parse a comma-separated `sort_by` value
    pub fn parse_list(raw: &str) -> Vec<Self> {
        raw.split(',').filter_map(Self::parse).collect()
    }
}

/// Parameters of a paginated listing
/// Page size used when a listing does not ask for one
pub const DEFAULT_PER_PAGE: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ListParams {
    pub page: usize,
    pub per_page: usize,
    pub filters: FilterMap,
    pub order_by: Vec<OrderBy>,
    pub deleted_state: DeletedState,
    /// Overrides the repository's filter policy for this listing
    pub policy: Option<FilterPolicy>,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
            filters: FilterMap::new(),
            order_by: Vec::new(),
            deleted_state: DeletedState::Active,
            policy: None,
        }
    }
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    pub fn per_page(mut self, per_page: usize) -> Self {
        self.per_page = per_page;
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn order_by(mut self, sort_by: &str) -> Self {
        self.order_by = OrderBy::parse_list(sort_by);
        self
    }

    pub fn deleted_state(mut self, state: DeletedState) -> Self {
        self.deleted_state = state;
        self
    }

    pub fn policy(mut self, policy: FilterPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build list parameters from decoded query data.
    ///
    /// Reserved keys are consumed and validated; everything else becomes a
    /// filter.
    pub fn from_query(mut data: FilterMap, limits: &PaginationConfig) -> Result<Self, CrudError> {
        let mut errors = FieldErrors::new();

        let page = match data.shift_remove("page") {
            None => 1,
            Some(value) => match as_integer(&value) {
                Some(page) if page >= 1 => page as usize,
                _ => {
                    errors.add("page", "Must be greater than or equal to 1.");
                    1
                }
            },
        };

        let per_page = match data.shift_remove("per_page") {
            None => limits.default_per_page,
            Some(value) => match as_integer(&value) {
                Some(n) if n >= 1 && n as usize <= limits.max_per_page => n as usize,
                _ => {
                    errors.add(
                        "per_page",
                        format!("Must be between 1 and {}.", limits.max_per_page),
                    );
                    limits.default_per_page
                }
            },
        };

        let order_by = match data.shift_remove("sort_by") {
            Some(Value::String(raw)) => OrderBy::parse_list(&raw),
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                errors.add("sort_by", "Not a valid string.");
                Vec::new()
            }
        };

        let include_soft_deleted = data.shift_remove("include_soft_deleted");
        let deleted_state = match data.shift_remove("deleted_state") {
            Some(Value::String(raw)) => raw.parse().unwrap_or_else(|reason: String| {
                errors.add("deleted_state", reason);
                DeletedState::Active
            }),
            Some(_) => {
                errors.add("deleted_state", "Not a valid string.");
                DeletedState::Active
            }
            None => match include_soft_deleted.as_ref().map(as_bool) {
                Some(Some(true)) => DeletedState::All,
                Some(None) => {
                    errors.add("include_soft_deleted", "Not a valid boolean.");
                    DeletedState::Active
                }
                _ => DeletedState::Active,
            },
        };

        if !errors.is_empty() {
            return Err(CrudError::ValidationFailed(errors));
        }

        Ok(Self {
            page,
            per_page,
            filters: data,
            order_by,
            deleted_state,
            policy: None,
        })
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Sort entities by registered fields. Unknown fields are ignored.
///
/// The sort is stable, so ties keep storage order.
pub fn sort_entities<M: Entity>(items: &mut [M], order: &[OrderBy]) {
    let registry = M::fields();
    let keys: Vec<_> = order
        .iter()
        .filter_map(|key| match registry.get(&key.field) {
            Some(def) => Some((def, key.descending)),
            None => {
                tracing::warn!(field = %key.field, "Ignoring unknown sort field");
                None
            }
        })
        .collect();
    if keys.is_empty() {
        return;
    }

    items.sort_by(|a, b| {
        for (def, descending) in &keys {
            let ordering = def.get(a).sort_cmp(&def.get(b));
            let ordering = if *descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// One page of results plus the counts it was cut from
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationResult<T> {
    items: Vec<T>,
    meta: PaginationMeta,
}

impl<T> PaginationResult<T> {
    pub fn new(items: Vec<T>, total: usize, page: usize, per_page: usize) -> Self {
        Self {
            items,
            meta: PaginationMeta::new(page, per_page, total),
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn meta(&self) -> &PaginationMeta {
        &self.meta
    }

    pub fn total(&self) -> usize {
        self.meta.total
    }

    pub fn page(&self) -> usize {
        self.meta.page
    }

    pub fn per_page(&self) -> usize {
        self.meta.per_page
    }

    pub fn total_pages(&self) -> usize {
        self.meta.total_pages
    }

    pub fn has_next(&self) -> bool {
        self.meta.has_next
    }

    pub fn has_prev(&self) -> bool {
        self.meta.has_prev
    }

    /// Transform the items, keeping the counts
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PaginationResult<U> {
        PaginationResult {
            items: self.items.into_iter().map(f).collect(),
            meta: self.meta,
        }
    }

    /// Fallible [`map`](Self::map)
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<PaginationResult<U>, E> {
        Ok(PaginationResult {
            items: self.items.into_iter().map(f).collect::<Result<_, _>>()?,
            meta: self.meta,
        })
    }

    /// The wire envelope
    pub fn into_response(self) -> PaginatedResponse<T> {
        PaginatedResponse {
            items: self.items,
            pagination: self.meta,
        }
    }
}

/// Paginated response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    /// The page's items
    pub items: Vec<T>,

    /// Pagination metadata
    pub pagination: PaginationMeta,
}

/// Pagination metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
    /// Total number of items (after filters)
    pub total: usize,

    /// Current page number (starts at 1)
    pub page: usize,

    /// Number of items per page
    pub per_page: usize,

    /// Total number of pages
    pub total_pages: usize,

    /// Whether there is a next page
    pub has_next: bool,

    /// Whether there is a previous page
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(page: usize, per_page: usize, total: usize) -> Self {
        let per_page = per_page.max(1);
        let total_pages = if total == 0 { 0 } else { total.div_ceil(per_page) };

        Self {
            total,
            page,
            per_page,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(value: serde_json::Value) -> FilterMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_default_page_size_matches_http_default() {
        let params = ListParams::default();
        assert_eq!(params.per_page, DEFAULT_PER_PAGE);
        assert_eq!(params.per_page, PaginationConfig::default().default_per_page);
    }

    #[test]
    fn test_pagination_meta() {
        let meta = PaginationMeta::new(1, 20, 145);
        assert_eq!(meta.total, 145);
        assert_eq!(meta.total_pages, 8);
        assert!(!meta.has_prev);
        assert!(meta.has_next);
    }

    #[test]
    fn test_pagination_invariant_holds_everywhere() {
        for total in 0..60usize {
            for per_page in 1..12usize {
                for page in 1..10usize {
                    let meta = PaginationMeta::new(page, per_page, total);
                    let expected = if total == 0 {
                        0
                    } else {
                        (total + per_page - 1) / per_page
                    };
                    assert_eq!(meta.total_pages, expected);
                    assert_eq!(meta.has_next, page < expected);
                    assert_eq!(meta.has_prev, page > 1);
                }
            }
        }
    }

    #[test]
    fn test_order_by_parse() {
        assert_eq!(
            OrderBy::parse_list("name, -price,,-"),
            vec![OrderBy::asc("name"), OrderBy::desc("price")]
        );
    }

    #[test]
    fn test_from_query_consumes_reserved_keys() {
        let params = ListParams::from_query(
            query(json!({
                "page": "2",
                "per_page": "5",
                "sort_by": "-price",
                "deleted_state": "all",
                "name": "ilike__book"
            })),
            &PaginationConfig::default(),
        )
        .unwrap();

        assert_eq!(params.page, 2);
        assert_eq!(params.per_page, 5);
        assert_eq!(params.order_by, vec![OrderBy::desc("price")]);
        assert_eq!(params.deleted_state, DeletedState::All);
        assert_eq!(params.filters.len(), 1);
        assert_eq!(params.filters["name"], json!("ilike__book"));
    }

    #[test]
    fn test_from_query_defaults() {
        let params = ListParams::from_query(FilterMap::new(), &PaginationConfig::default()).unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.per_page, 10);
        assert_eq!(params.deleted_state, DeletedState::Active);
    }

    #[test]
    fn test_include_soft_deleted_alias() {
        let params = ListParams::from_query(
            query(json!({ "include_soft_deleted": "true" })),
            &PaginationConfig::default(),
        )
        .unwrap();
        assert_eq!(params.deleted_state, DeletedState::All);
    }

    #[test]
    fn test_from_query_rejects_out_of_range_values() {
        let Err(CrudError::ValidationFailed(errors)) = ListParams::from_query(
            query(json!({ "page": "0", "per_page": "500", "deleted_state": "gone" })),
            &PaginationConfig::default(),
        ) else {
            panic!("expected validation failure");
        };
        assert!(errors.get("page").is_some());
        assert!(errors.get("per_page").is_some());
        assert!(errors.get("deleted_state").is_some());
    }
}
