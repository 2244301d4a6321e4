//! Wire schemas: validate inbound payloads and shape outbound ones

use super::error::{CrudError, FieldErrors};
use super::filter::FilterMap;
use super::query::ListParams;
use crate::config::PaginationConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use validator::Validate;

/// Converts between wire JSON and the data the service layer consumes
pub trait Schema: Send + Sync {
    /// Validate and normalize an inbound payload.
    ///
    /// With `partial`, fields missing from the payload are not required and
    /// are left out of the result.
    fn load(&self, value: Value, partial: bool) -> Result<Value, CrudError>;

    /// Shape an outbound value
    fn dump(&self, value: Value) -> Result<Value, CrudError>;
}

/// Schema backed by a serde type, validated with `validator`
pub struct TypedSchema<T> {
    _type: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T>
where
    T: DeserializeOwned + Serialize + Validate + 'static,
{
    pub fn new() -> Self {
        Self { _type: PhantomData }
    }

    pub fn shared() -> Arc<dyn Schema> {
        Arc::new(Self::new())
    }
}

impl<T> Default for TypedSchema<T>
where
    T: DeserializeOwned + Serialize + Validate + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TypedSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedSchema<{}>", std::any::type_name::<T>())
    }
}

impl<T> Schema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize + Validate + 'static,
{
    fn load(&self, value: Value, partial: bool) -> Result<Value, CrudError> {
        let present: HashSet<String> = match &value {
            Value::Object(map) => map.keys().cloned().collect(),
            Value::Null => HashSet::new(),
            _ => return Err(CrudError::invalid("_schema", "Invalid input type.")),
        };
        let value = if value.is_null() { json!({}) } else { value };

        let typed: T = serde_json::from_value(value).map_err(|e| decode_error(&e))?;
        typed.validate()?;

        let mut loaded = to_object(&typed)?;
        if partial {
            loaded.retain(|key, _| present.contains(key));
        }
        Ok(Value::Object(loaded))
    }

    fn dump(&self, value: Value) -> Result<Value, CrudError> {
        let typed: T = serde_json::from_value(value)
            .map_err(|e| CrudError::Internal(format!("cannot dump {}: {}", std::any::type_name::<T>(), e)))?;
        serde_json::to_value(&typed).map_err(|e| CrudError::Internal(e.to_string()))
    }
}

/// Accepts any JSON object unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSchema;

impl Schema for PassthroughSchema {
    fn load(&self, value: Value, _partial: bool) -> Result<Value, CrudError> {
        match value {
            Value::Object(_) => Ok(value),
            Value::Null => Ok(json!({})),
            _ => Err(CrudError::invalid("_schema", "Invalid input type.")),
        }
    }

    fn dump(&self, value: Value) -> Result<Value, CrudError> {
        Ok(value)
    }
}

/// Validates list query strings: pagination, sorting, deleted state, and
/// passes every other key through as a filter
#[derive(Debug, Clone, Default)]
pub struct ListQuerySchema {
    limits: PaginationConfig,
}

impl ListQuerySchema {
    pub fn new(limits: PaginationConfig) -> Self {
        Self { limits }
    }

    /// Parse already-loaded query data into list parameters
    pub fn params(&self, value: Value) -> Result<ListParams, CrudError> {
        let data: FilterMap = match value {
            Value::Object(map) => map.into_iter().collect(),
            Value::Null => FilterMap::new(),
            _ => return Err(CrudError::invalid("_schema", "Invalid input type.")),
        };
        ListParams::from_query(data, &self.limits)
    }
}

impl Schema for ListQuerySchema {
    fn load(&self, value: Value, _partial: bool) -> Result<Value, CrudError> {
        let params = self.params(value)?;

        let mut loaded = Map::new();
        loaded.insert("page".into(), json!(params.page));
        loaded.insert("per_page".into(), json!(params.per_page));
        if !params.order_by.is_empty() {
            let sort_by: Vec<String> = params
                .order_by
                .iter()
                .map(|o| {
                    if o.descending {
                        format!("-{}", o.field)
                    } else {
                        o.field.clone()
                    }
                })
                .collect();
            loaded.insert("sort_by".into(), json!(sort_by.join(",")));
        }
        loaded.insert("deleted_state".into(), json!(params.deleted_state));
        loaded.extend(params.filters);
        Ok(Value::Object(loaded))
    }

    fn dump(&self, value: Value) -> Result<Value, CrudError> {
        Ok(value)
    }
}

/// The schema set a CRUD route group works with
#[derive(Clone)]
pub struct CrudSchemas {
    /// Output of every single-entity response and of list items
    pub main: Arc<dyn Schema>,
    /// Create payloads
    pub input: Arc<dyn Schema>,
    /// Update payloads, loaded as partial
    pub update: Arc<dyn Schema>,
    /// List query strings; `None` validates with the configured pagination
    /// limits
    pub query: Option<Arc<dyn Schema>>,
}

impl CrudSchemas {
    /// Typed schemas for output, create and update
    pub fn typed<Out, In, Upd>() -> Self
    where
        Out: DeserializeOwned + Serialize + Validate + 'static,
        In: DeserializeOwned + Serialize + Validate + 'static,
        Upd: DeserializeOwned + Serialize + Validate + 'static,
    {
        Self {
            main: TypedSchema::<Out>::shared(),
            input: TypedSchema::<In>::shared(),
            update: TypedSchema::<Upd>::shared(),
            query: None,
        }
    }

    /// Accept and return payloads unchanged
    pub fn passthrough() -> Self {
        Self {
            main: Arc::new(PassthroughSchema),
            input: Arc::new(PassthroughSchema),
            update: Arc::new(PassthroughSchema),
            query: None,
        }
    }

    pub fn with_query(mut self, query: Arc<dyn Schema>) -> Self {
        self.query = Some(query);
        self
    }
}

impl Default for CrudSchemas {
    fn default() -> Self {
        Self::passthrough()
    }
}

/// Where an input schema reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLocation {
    Json,
    Query,
    Path,
}

impl InputLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputLocation::Json => "json",
            InputLocation::Query => "query",
            InputLocation::Path => "path",
        }
    }
}

/// One schema applied to one part of the request
#[derive(Clone)]
pub struct InputSpec {
    pub schema: Arc<dyn Schema>,
    pub location: InputLocation,
    /// Key the loaded value is stored under; defaults to `<location>_data`
    pub arg: Option<String>,
    pub partial: bool,
}

impl InputSpec {
    pub fn new(schema: Arc<dyn Schema>, location: InputLocation) -> Self {
        Self {
            schema,
            location,
            arg: None,
            partial: false,
        }
    }

    pub fn json(schema: Arc<dyn Schema>) -> Self {
        Self::new(schema, InputLocation::Json)
    }

    pub fn query(schema: Arc<dyn Schema>) -> Self {
        Self::new(schema, InputLocation::Query)
    }

    pub fn path(schema: Arc<dyn Schema>) -> Self {
        Self::new(schema, InputLocation::Path)
    }

    pub fn named(mut self, arg: impl Into<String>) -> Self {
        self.arg = Some(arg.into());
        self
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn key(&self) -> String {
        self.arg
            .clone()
            .unwrap_or_else(|| format!("{}_data", self.location.as_str()))
    }
}

impl fmt::Debug for InputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSpec")
            .field("location", &self.location)
            .field("key", &self.key())
            .field("partial", &self.partial)
            .finish()
    }
}

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>, CrudError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CrudError::Internal("schema type does not serialize to an object".into())),
        Err(e) => Err(CrudError::Internal(e.to_string())),
    }
}

/// Map a serde decoding failure onto field errors
fn decode_error(err: &serde_json::Error) -> CrudError {
    let message = err.to_string();
    if let Some(field) = between(&message, "missing field `", "`") {
        return CrudError::ValidationFailed(FieldErrors::single(
            field,
            "Missing data for required field.",
        ));
    }
    if let Some(field) = between(&message, "unknown field `", "`") {
        return CrudError::ValidationFailed(FieldErrors::single(field, "Unknown field."));
    }
    CrudError::invalid("_schema", message)
}

fn between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let rest = &haystack[haystack.find(start)? + start.len()..];
    rest.find(end).map(|i| &rest[..i])
}
