//! Quantification summaries.
//!
//! A summary row and its ownership row are written in one transaction;
//! no reader can observe one without the other. Deletion mirrors the
//! insert.

use super::ownership::{delete_ownership_tx, insert_ownership_tx, OwnershipItem};
use super::Database;
use crate::wire::{JobStatusMsg, QuantParams, QuantSummaryMsg};
use anyhow::Result;
use serde::{Deserialize, Serialize};

pub const QUANT_OBJECT_TYPE: &str = "quant";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantSummary {
    pub id: String,
    pub scan_id: String,
    pub name: String,
    pub requestor_user_id: String,
    pub elements: Vec<String>,
    pub status: JobStatusMsg,
    pub params: QuantParams,
}

impl QuantSummary {
    pub fn into_msg(self) -> QuantSummaryMsg {
        QuantSummaryMsg {
            id: self.id,
            scan_id: self.scan_id,
            name: self.name,
            elements: self.elements,
            status: self.status,
            params: self.params,
        }
    }
}

#[derive(sqlx::FromRow)]
struct QuantRow {
    id: String,
    scan_id: String,
    name: String,
    requestor_user_id: String,
    elements: serde_json::Value,
    status: serde_json::Value,
    params: serde_json::Value,
}

impl QuantRow {
    fn into_summary(self) -> Result<QuantSummary> {
        Ok(QuantSummary {
            id: self.id,
            scan_id: self.scan_id,
            name: self.name,
            requestor_user_id: self.requestor_user_id,
            elements: serde_json::from_value(self.elements).unwrap_or_default(),
            status: serde_json::from_value(self.status)?,
            params: serde_json::from_value(self.params)?,
        })
    }
}

const QUANT_COLUMNS: &str =
    "id, scan_id, name, requestor_user_id, elements, status, params";

impl Database {
    /// Atomic insert of the summary and its ownership row.
    pub async fn insert_quant_with_ownership(
        &self,
        summary: &QuantSummary,
        ownership: &OwnershipItem,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO quant_summaries (id, scan_id, name, requestor_user_id, elements,
                 status, params)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&summary.id)
        .bind(&summary.scan_id)
        .bind(&summary.name)
        .bind(&summary.requestor_user_id)
        .bind(serde_json::json!(summary.elements))
        .bind(serde_json::to_value(&summary.status)?)
        .bind(serde_json::to_value(&summary.params)?)
        .execute(&mut *tx)
        .await?;
        insert_ownership_tx(&mut tx, ownership).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_quant(&self, quant_id: &str) -> Result<Option<QuantSummary>> {
        let row = sqlx::query_as::<_, QuantRow>(&format!(
            "SELECT {} FROM quant_summaries WHERE id = $1",
            QUANT_COLUMNS
        ))
        .bind(quant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(QuantRow::into_summary).transpose()
    }

    pub async fn get_quants_by_ids(&self, ids: &[String]) -> Result<Vec<QuantSummary>> {
        let rows = sqlx::query_as::<_, QuantRow>(&format!(
            "SELECT {} FROM quant_summaries WHERE id = ANY($1)",
            QUANT_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QuantRow::into_summary).collect()
    }

    pub async fn list_quants_for_scan(&self, scan_id: &str) -> Result<Vec<QuantSummary>> {
        let rows = sqlx::query_as::<_, QuantRow>(&format!(
            "SELECT {} FROM quant_summaries WHERE scan_id = $1 ORDER BY id",
            QUANT_COLUMNS
        ))
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QuantRow::into_summary).collect()
    }

    /// Duplicate-name guard per (requestor, scan).
    pub async fn quant_name_exists(
        &self,
        requestor_user_id: &str,
        scan_id: &str,
        name: &str,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM quant_summaries
             WHERE requestor_user_id = $1 AND scan_id = $2 AND name = $3",
        )
        .bind(requestor_user_id)
        .bind(scan_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Atomic delete of the summary and its ownership row.
    pub async fn delete_quant(&self, quant_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM quant_summaries WHERE id = $1")
            .bind(quant_id)
            .execute(&mut *tx)
            .await?;
        delete_ownership_tx(&mut tx, quant_id).await?;
        tx.commit().await?;
        Ok(())
    }
}
