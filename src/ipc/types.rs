use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::states::PlanState;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One open monthly-plan edit: the snapshot loaded at `plan.editBegin`,
/// the working copy the operator mutates, and the per-post versions used
/// to detect concurrent saves. Nothing is persisted until `plan.editSave`.
pub struct PlanEditSession {
    pub installation_id: String,
    pub year: i32,
    pub month: u32,
    pub days_in_month: u32,
    pub post_ids: Vec<String>,
    /// post_id -> plan version seen at editBegin.
    pub base_versions: HashMap<String, i64>,
    /// (post_id, day) -> state as loaded. Unset days carry no key.
    pub snapshot: HashMap<(String, u32), PlanState>,
    pub working: HashMap<(String, u32), PlanState>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub plan_sessions: HashMap<String, PlanEditSession>,
}

impl AppState {
    pub fn new() -> Self {
        AppState {
            workspace: None,
            db: None,
            plan_sessions: HashMap::new(),
        }
    }
}
