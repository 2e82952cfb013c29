//! Query description and in-memory evaluation
//!
//! A [`Query`] carries a Mongo-style filter document plus sort, paging and
//! field projection. The same value drives remote requests (through
//! [`Query::to_params`]) and local evaluation (through [`apply`]), so the
//! local store and the remote service agree on what "matches" means.

mod filter;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::models::{Entity, ACL_FIELD, ID_FIELD, METADATA_FIELD};

pub use filter::{compare_values, matches};

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One sort key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

/// A collection query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub filter: Map<String, Value>,
    #[serde(default)]
    pub sort: Vec<SortField>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl Query {
    /// Query matching every entity of a collection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Query from a raw filter document
    #[must_use]
    pub fn from_filter(filter: Map<String, Value>) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Query matching exactly the given ids
    #[must_use]
    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = ids
            .into_iter()
            .map(|id| Value::String(id.into()))
            .collect::<Vec<_>>();
        Self::new().contained_in(ID_FIELD, ids)
    }

    fn with_condition(mut self, field: &str, operator: &str, value: Value) -> Self {
        let entry = self
            .filter
            .entry(field.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(conditions) = entry {
            conditions.insert(operator.to_string(), value);
        }
        self
    }

    #[must_use]
    pub fn equal_to(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter.insert(field.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn not_equal_to(self, field: &str, value: impl Into<Value>) -> Self {
        self.with_condition(field, "$ne", value.into())
    }

    #[must_use]
    pub fn greater_than(self, field: &str, value: impl Into<Value>) -> Self {
        self.with_condition(field, "$gt", value.into())
    }

    #[must_use]
    pub fn greater_than_or_equal_to(self, field: &str, value: impl Into<Value>) -> Self {
        self.with_condition(field, "$gte", value.into())
    }

    #[must_use]
    pub fn less_than(self, field: &str, value: impl Into<Value>) -> Self {
        self.with_condition(field, "$lt", value.into())
    }

    #[must_use]
    pub fn less_than_or_equal_to(self, field: &str, value: impl Into<Value>) -> Self {
        self.with_condition(field, "$lte", value.into())
    }

    #[must_use]
    pub fn contained_in(self, field: &str, values: Vec<Value>) -> Self {
        self.with_condition(field, "$in", Value::Array(values))
    }

    #[must_use]
    pub fn not_contained_in(self, field: &str, values: Vec<Value>) -> Self {
        self.with_condition(field, "$nin", Value::Array(values))
    }

    #[must_use]
    pub fn exists(self, field: &str, flag: bool) -> Self {
        self.with_condition(field, "$exists", Value::Bool(flag))
    }

    /// Regular expression match; the pattern must be anchored with `^`.
    #[must_use]
    pub fn matches_pattern(self, field: &str, pattern: &str) -> Self {
        self.with_condition(field, "$regex", Value::String(pattern.to_string()))
    }

    #[must_use]
    pub fn ascending(mut self, field: &str) -> Self {
        self.sort.push(SortField {
            field: field.to_string(),
            order: SortOrder::Ascending,
        });
        self
    }

    #[must_use]
    pub fn descending(mut self, field: &str) -> Self {
        self.sort.push(SortField {
            field: field.to_string(),
            order: SortOrder::Descending,
        });
        self
    }

    #[must_use]
    pub const fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// True when skip or limit restrict the result window
    #[must_use]
    pub const fn is_paged(&self) -> bool {
        self.skip.is_some() || self.limit.is_some()
    }

    /// Same filter and sort, without paging or projection
    #[must_use]
    pub fn unpaged(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            ..Self::default()
        }
    }

    /// Stable key identifying this query in the local caches.
    ///
    /// `serde_json::Map` keeps keys ordered, so equal queries always produce
    /// the same signature regardless of how their filters were built.
    #[must_use]
    pub fn signature(&self) -> String {
        json!({
            "filter": self.filter,
            "sort": self.sort_param(),
            "skip": self.skip,
            "limit": self.limit,
            "fields": self.fields,
        })
        .to_string()
    }

    /// Sort keys encoded as `field,-other` (leading `-` = descending)
    #[must_use]
    pub fn sort_param(&self) -> Option<String> {
        if self.sort.is_empty() {
            return None;
        }
        Some(
            self.sort
                .iter()
                .map(|key| match key.order {
                    SortOrder::Ascending => key.field.clone(),
                    SortOrder::Descending => format!("-{}", key.field),
                })
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Query-string parameters understood by the remote collection endpoint
    #[must_use]
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if !self.filter.is_empty() {
            params.push((
                "query".to_string(),
                Value::Object(self.filter.clone()).to_string(),
            ));
        }
        if let Some(sort) = self.sort_param() {
            params.push(("sort".to_string(), sort));
        }
        if let Some(skip) = self.skip {
            params.push(("skip".to_string(), skip.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        if !self.fields.is_empty() {
            params.push(("fields".to_string(), self.fields.join(",")));
        }
        params
    }

    /// Rebuild a query from the parameters produced by [`Query::to_params`]
    pub fn from_params<'a, I>(params: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut query = Self::new();
        for (key, value) in params {
            match key {
                "query" => match serde_json::from_str(value)? {
                    Value::Object(filter) => query.filter = filter,
                    other => {
                        return Err(crate::Error::InvalidInput(format!(
                            "query must be a JSON object, got {other}"
                        )))
                    }
                },
                "sort" => {
                    for field in value.split(',').filter(|field| !field.is_empty()) {
                        query = match field.strip_prefix('-') {
                            Some(name) => query.descending(name),
                            None => query.ascending(field),
                        };
                    }
                }
                "skip" => query.skip = Some(parse_count(key, value)?),
                "limit" => query.limit = Some(parse_count(key, value)?),
                "fields" => {
                    query.fields = value
                        .split(',')
                        .filter(|field| !field.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {}
            }
        }
        Ok(query)
    }
}

fn parse_count(key: &str, value: &str) -> crate::Result<usize> {
    value
        .parse()
        .map_err(|_| crate::Error::InvalidInput(format!("{key} must be a non-negative integer")))
}

/// Filter, sort, page and project a set of entities.
#[must_use]
pub fn apply(items: Vec<Entity>, query: &Query) -> Vec<Entity> {
    let mut selected = items
        .into_iter()
        .filter(|entity| matches(entity, &query.filter))
        .collect::<Vec<_>>();

    sort_entities(&mut selected, &query.sort);

    let skip = query.skip.unwrap_or(0);
    let limit = query.limit.unwrap_or(usize::MAX);
    selected
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(|entity| project(entity, &query.fields))
        .collect()
}

/// Stable sort by the given keys; missing values order first.
pub fn sort_entities(items: &mut [Entity], sort: &[SortField]) {
    if sort.is_empty() {
        return;
    }
    items.sort_by(|left, right| {
        for key in sort {
            let ordering = match (left.get(&key.field), right.get(&key.field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
            };
            let ordering = match key.order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn project(entity: Entity, fields: &[String]) -> Entity {
    if fields.is_empty() {
        return entity;
    }
    let source = entity.as_map();
    let mut projected = Map::new();
    for field in [ID_FIELD, METADATA_FIELD, ACL_FIELD] {
        if let Some(value) = source.get(field) {
            projected.insert(field.to_string(), value.clone());
        }
    }
    for field in fields {
        let top = field.split('.').next().unwrap_or(field);
        if let Some(value) = source.get(top) {
            projected.insert(top.to_string(), value.clone());
        }
    }
    Entity::from_value(Value::Object(projected)).unwrap_or_default()
}
