//! Persisted task records

use super::{Database, Result, StorageError};
use crate::tasks::{TaskRecord, TaskStatus};
use chrono::{TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};

fn task_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, String, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_task(
    (task_id, task_type, status, history, extra, created_at, modified_at): (
        String,
        String,
        String,
        String,
        String,
        i64,
        i64,
    ),
) -> Result<TaskRecord> {
    let task_type = task_type
        .parse()
        .map_err(|_| StorageError::Invalid(format!("task type {}", task_type)))?;
    let status = status
        .parse()
        .map_err(|_| StorageError::Invalid(format!("task status {}", status)))?;

    Ok(TaskRecord {
        task_id,
        task_type,
        status,
        history: serde_json::from_str(&history)?,
        extra: serde_json::from_str(&extra)?,
        created_at: Utc
            .timestamp_millis_opt(created_at)
            .single()
            .unwrap_or_default(),
        modified_at: Utc
            .timestamp_millis_opt(modified_at)
            .single()
            .unwrap_or_default(),
    })
}

const SELECT_TASK: &str =
    "SELECT task_id, task_type, status, history, extra, created_at, modified_at FROM tasks";

impl Database {
    /// Insert a new task record
    pub async fn insert_task(&self, task: &TaskRecord) -> Result<()> {
        let history = serde_json::to_string(&task.history)?;
        let extra = serde_json::to_string(&task.extra)?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO tasks (task_id, task_type, status, history, extra, created_at, modified_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                task.task_id,
                task.task_type.as_str(),
                task.status.as_str(),
                history,
                extra,
                task.created_at.timestamp_millis(),
                task.modified_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Load a task by id
    pub async fn load_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!("{} WHERE task_id = ?", SELECT_TASK),
                params![task_id],
                task_row,
            )
            .optional()?;
        drop(conn);

        row.map(decode_task).transpose()
    }

    /// Overwrite a task's mutable fields, but only while it is not terminal.
    /// Returns false when the stored task was already terminal or missing.
    pub async fn update_task(&self, task: &TaskRecord) -> Result<bool> {
        let history = serde_json::to_string(&task.history)?;
        let extra = serde_json::to_string(&task.extra)?;
        let conn = self.conn().await;
        let updated = conn.execute(
            "UPDATE tasks SET status = ?, history = ?, extra = ?, modified_at = ?
             WHERE task_id = ? AND status NOT IN (?, ?)",
            params![
                task.status.as_str(),
                history,
                extra,
                task.modified_at.timestamp_millis(),
                task.task_id,
                TaskStatus::Success.as_str(),
                TaskStatus::Failure.as_str()
            ],
        )?;
        Ok(updated > 0)
    }

    /// Replace only the extra payload of a running task
    pub async fn save_task_extra(&self, task_id: &str, extra: &serde_json::Value) -> Result<()> {
        let extra = serde_json::to_string(extra)?;
        let conn = self.conn().await;
        conn.execute(
            "UPDATE tasks SET extra = ?, modified_at = ? WHERE task_id = ?",
            params![extra, Utc::now().timestamp_millis(), task_id],
        )?;
        Ok(())
    }

    /// Tasks that have not reached a terminal status, oldest first
    pub async fn pending_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.query_tasks(
            &format!(
                "{} WHERE status NOT IN ('{}', '{}') ORDER BY created_at",
                SELECT_TASK,
                TaskStatus::Success.as_str(),
                TaskStatus::Failure.as_str()
            ),
        )
        .await
    }

    /// Every task, newest first
    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.query_tasks(&format!("{} ORDER BY created_at DESC", SELECT_TASK))
            .await
    }

    /// Delete a task record
    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let conn = self.conn().await;
        let removed = conn.execute("DELETE FROM tasks WHERE task_id = ?", params![task_id])?;
        Ok(removed > 0)
    }

    async fn query_tasks(&self, sql: &str) -> Result<Vec<TaskRecord>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], task_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        rows.into_iter().map(decode_task).collect()
    }
}
