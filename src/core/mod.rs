//! Core module containing the model contract, the data layer and the
//! service layer

pub mod archive;
pub mod auth;
pub mod change;
pub mod entity;
pub mod error;
pub mod field;
pub mod filter;
pub mod query;
pub mod repository;
pub mod schema;
pub mod service;
pub mod uow;

pub use archive::ArchivedRecord;
pub use auth::{Claims, JwtIssuer, JwtVerifier, TokenType, TokenVerifier};
pub use change::{ChangeAction, ChangeEvent, ChangeRecorder, NoopRecorder};
pub use entity::{DeletedState, Entity, EntityRef, IdField, TableSchema};
pub use error::{CrudError, ErrorResponse, FieldErrors};
pub use field::{FieldRegistry, FieldValue};
pub use filter::{FilterMap, FilterPolicy, Operator};
pub use query::{ListParams, OrderBy, PaginatedResponse, PaginationResult};
pub use repository::Repository;
pub use schema::{CrudSchemas, InputSpec, PassthroughSchema, Schema, TypedSchema};
pub use service::{CrudService, DefaultHooks, ServiceHooks};
pub use uow::UnitOfWork;
