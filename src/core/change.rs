//! Change recording hook used by the repository
//!
//! The repository reports every write to a [`ChangeRecorder`] inside the same
//! unit of work, so an audit implementation can persist its own rows
//! atomically with the change. The default recorder does nothing.

use super::error::CrudError;
use super::uow::UnitOfWork;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of write reported to a recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    SoftDelete,
    Restore,
    Delete,
    ForceDelete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::SoftDelete => "soft_delete",
            ChangeAction::Restore => "restore",
            ChangeAction::Delete => "delete",
            ChangeAction::ForceDelete => "force_delete",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded write: the row before and after
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub table: &'static str,
    pub pk: i64,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl ChangeEvent {
    pub fn new(
        action: ChangeAction,
        table: &'static str,
        pk: i64,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Self {
        Self {
            action,
            table,
            pk,
            old,
            new,
        }
    }
}

/// Receives every write made by a repository
#[async_trait]
pub trait ChangeRecorder: Send + Sync {
    async fn record(&self, uow: &mut UnitOfWork, event: ChangeEvent) -> Result<(), CrudError>;
}

/// Recorder that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

#[async_trait]
impl ChangeRecorder for NoopRecorder {
    async fn record(&self, _uow: &mut UnitOfWork, _event: ChangeEvent) -> Result<(), CrudError> {
        Ok(())
    }
}
