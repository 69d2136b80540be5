//! # Database — PostgreSQL storage layer
//!
//! All durable platform state lives here, behind a `Database` handle
//! wrapping a `sqlx::PgPool`.
//!
//! ## Schema
//!
//! - `job_statuses`: one row per long-running job, keyed by job id
//! - `ownership`: one row per user-visible business object
//! - `user_groups`: group membership and viewer lists
//! - `users`: lazily-created user records
//! - `notifications`: durable inbox entries for offline users
//! - `connect_tokens`: short-lived single-use socket tokens
//! - `job_handlers`: per-job handler election records
//! - `quant_summaries`: quantification metadata and terminal status
//! - `rois`: region-of-interest index lists
//!
//! ## Module structure
//!
//! Operations are split into submodules by domain:
//!
//! - [`jobs`] — job status rows and change-feed publication
//! - [`ownership`] — access checks and group expansion
//! - [`users`] — user records
//! - [`notifications`] — inbox CRUD
//! - [`tokens`] — connect-token lifecycle
//! - [`elections`] — handler election upserts
//! - [`quants`] — quantification summaries
//! - [`rois`] — ROI lookup

mod elections;
mod jobs;
mod notifications;
pub mod ownership;
mod quants;
mod rois;
mod tokens;
mod users;

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

pub use ownership::{make_owner_for_write, OwnershipItem, UserAndGroupIds, UserGroupRecord};
pub use quants::{QuantSummary, QUANT_OBJECT_TYPE};
pub use rois::RoiRecord;
pub use tokens::ConnectTokenRecord;
pub use users::UserRecord;

/// Postgres NOTIFY channel carrying job-status change events.
pub const JOB_CHANGE_CHANNEL: &str = "job_status";

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check: execute `SELECT 1` to verify connectivity. Backs the
    /// `/readyz` probe.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Create any missing tables. Safe to run on every startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS job_statuses (
                job_id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                job_item_id TEXT NOT NULL DEFAULT '',
                requestor_user_id TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL DEFAULT '',
                elements JSONB NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                start_unix_sec BIGINT NOT NULL,
                last_update_unix_sec BIGINT NOT NULL,
                end_unix_sec BIGINT NOT NULL DEFAULT 0,
                output_file_path TEXT NOT NULL DEFAULT '',
                log_id TEXT NOT NULL DEFAULT '',
                other_log_files JSONB NOT NULL DEFAULT '[]'
            )",
            "CREATE TABLE IF NOT EXISTS ownership (
                id TEXT PRIMARY KEY,
                object_type TEXT NOT NULL,
                creator_user_id TEXT NOT NULL,
                created_unix_sec BIGINT NOT NULL,
                viewer_user_ids JSONB NOT NULL DEFAULT '[]',
                viewer_group_ids JSONB NOT NULL DEFAULT '[]',
                editor_user_ids JSONB NOT NULL DEFAULT '[]',
                editor_group_ids JSONB NOT NULL DEFAULT '[]'
            )",
            "CREATE TABLE IF NOT EXISTS user_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_by TEXT NOT NULL DEFAULT '',
                admin_user_ids JSONB NOT NULL DEFAULT '[]',
                member_user_ids JSONB NOT NULL DEFAULT '[]',
                member_group_ids JSONB NOT NULL DEFAULT '[]',
                viewer_user_ids JSONB NOT NULL DEFAULT '[]',
                viewer_group_ids JSONB NOT NULL DEFAULT '[]',
                joinable BOOLEAN NOT NULL DEFAULT FALSE,
                created_unix_sec BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                created_unix_sec BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                dest_user_id TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                contents TEXT NOT NULL DEFAULT '',
                from_name TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL DEFAULT '',
                notification_type TEXT NOT NULL DEFAULT '',
                timestamp_unix_sec BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS connect_tokens (
                id TEXT PRIMARY KEY,
                expiry_unix_sec BIGINT NOT NULL,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                permissions JSONB NOT NULL DEFAULT '[]'
            )",
            "CREATE TABLE IF NOT EXISTS job_handlers (
                job_id TEXT PRIMARY KEY,
                handler_instance_id TEXT NOT NULL,
                timestamp_unix_sec BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS quant_summaries (
                id TEXT PRIMARY KEY,
                scan_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                requestor_user_id TEXT NOT NULL DEFAULT '',
                elements JSONB NOT NULL DEFAULT '[]',
                status JSONB NOT NULL,
                params JSONB NOT NULL DEFAULT '{}'
            )",
            "CREATE TABLE IF NOT EXISTS rois (
                id TEXT PRIMARY KEY,
                scan_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                scan_entry_indexes_encoded JSONB NOT NULL DEFAULT '[]'
            )",
            "CREATE INDEX IF NOT EXISTS idx_quant_summaries_scan
                 ON quant_summaries (scan_id)",
            "CREATE INDEX IF NOT EXISTS idx_notifications_dest
                 ON notifications (dest_user_id)",
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}
