use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::{
    millis_to_dt, opt_millis_to_dt, CreateRequestInput, ResearchRequest, StateTransition,
    WorkflowState,
};

const REQUEST_COLUMNS: &str = "id, researcher_name, researcher_email, department, initial_request, \
     current_state, state_history, context, last_error, created_at, updated_at, completed_at";

#[derive(Clone)]
pub struct RequestStore {
    db: Database,
}

impl RequestStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: CreateRequestInput) -> Result<ResearchRequest, ServerError> {
        if input.initial_request.trim().is_empty() {
            return Err(ServerError::BadRequest("initialRequest must not be empty".to_string()));
        }
        let mut request = ResearchRequest::new(
            Uuid::new_v4().to_string(),
            input.researcher_name,
            input.researcher_email,
            input.department,
            input.initial_request,
        );
        if let Some(requirements) = input.requirements {
            request
                .context
                .insert("requirements".to_string(), requirements);
        }
        self.save(&request).await?;
        Ok(request)
    }

    pub async fn save(&self, request: &ResearchRequest) -> Result<(), ServerError> {
        let r = request.clone();
        let history = serde_json::to_string(&r.state_history)?;
        let context = serde_json::to_string(&r.context)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO research_requests (id, researcher_name, researcher_email, department, initial_request,
                        current_state, state_history, context, last_error, created_at, updated_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(id) DO UPDATE SET
                       current_state = excluded.current_state,
                       state_history = excluded.state_history,
                       context = excluded.context,
                       last_error = excluded.last_error,
                       updated_at = excluded.updated_at,
                       completed_at = excluded.completed_at",
                    rusqlite::params![
                        r.id,
                        r.researcher_name,
                        r.researcher_email,
                        r.department,
                        r.initial_request,
                        r.current_state.as_str(),
                        history,
                        context,
                        r.last_error,
                        r.created_at.timestamp_millis(),
                        r.updated_at.timestamp_millis(),
                        r.completed_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ResearchRequest>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM research_requests WHERE id = ?1", REQUEST_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_request(row)),
                )
                .optional()
            })
            .await
    }

    /// Fetch a request or fail with `NotFound`.
    pub async fn require(&self, id: &str) -> Result<ResearchRequest, ServerError> {
        self.get(id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Research request {} not found", id)))
    }

    pub async fn list(&self, state: Option<WorkflowState>) -> Result<Vec<ResearchRequest>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let rows = match state {
                    Some(state) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM research_requests WHERE current_state = ?1 ORDER BY created_at DESC",
                            REQUEST_COLUMNS
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![state.as_str()], |row| Ok(row_to_request(row)))?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM research_requests ORDER BY created_at DESC",
                            REQUEST_COLUMNS
                        ))?;
                        let rows = stmt
                            .query_map([], |row| Ok(row_to_request(row)))?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }

    /// Move a request to `to`, appending to the state history.
    ///
    /// Terminal states are final; `completed_at` is stamped the first time
    /// one is entered.
    pub async fn transition(
        &self,
        id: &str,
        to: WorkflowState,
        reason: &str,
    ) -> Result<ResearchRequest, ServerError> {
        let mut request = self.require(id).await?;
        let from = request.current_state;
        if from.is_terminal() {
            return Err(ServerError::Conflict(format!(
                "Request {} is already in terminal state {}",
                id, from
            )));
        }

        let now = Utc::now();
        request.state_history.push(StateTransition {
            from,
            to,
            reason: reason.to_string(),
            at: now,
        });
        request.current_state = to;
        request.updated_at = now;
        if to.is_terminal() && request.completed_at.is_none() {
            request.completed_at = Some(now);
        }
        self.save(&request).await?;

        tracing::info!("[RequestStore] {} : {} → {} ({})", id, from, to, reason);
        Ok(request)
    }

    pub async fn update_context(
        &self,
        id: &str,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ServerError> {
        let id = id.to_string();
        let context = serde_json::to_string(&context)?;
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE research_requests SET context = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, context, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_error(&self, id: &str, error: Option<String>) -> Result<(), ServerError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE research_requests SET last_error = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, error, now],
                )?;
                Ok(())
            })
            .await
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> ResearchRequest {
    let state: String = row.get(5).unwrap_or_default();
    let history: String = row.get(6).unwrap_or_else(|_| "[]".to_string());
    let context: String = row.get(7).unwrap_or_else(|_| "{}".to_string());

    ResearchRequest {
        id: row.get(0).unwrap_or_default(),
        researcher_name: row.get(1).unwrap_or_default(),
        researcher_email: row.get(2).unwrap_or_default(),
        department: row.get(3).unwrap_or(None),
        initial_request: row.get(4).unwrap_or_default(),
        current_state: WorkflowState::from_str(&state).unwrap_or(WorkflowState::HumanReview),
        state_history: serde_json::from_str(&history).unwrap_or_default(),
        context: serde_json::from_str(&context).unwrap_or_default(),
        last_error: row.get(8).unwrap_or(None),
        created_at: millis_to_dt(row.get(9).unwrap_or(0)),
        updated_at: millis_to_dt(row.get(10).unwrap_or(0)),
        completed_at: opt_millis_to_dt(row.get(11).unwrap_or(None)),
    }
}
