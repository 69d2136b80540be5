//! Region-of-interest rows. ROI CRUD proper lives upstream; the
//! orchestrator only needs the encoded index list per ROI.

use super::Database;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiRecord {
    pub id: String,
    pub scan_id: String,
    pub name: String,
    pub scan_entry_indexes_encoded: Vec<i32>,
}

#[derive(sqlx::FromRow)]
struct RoiRow {
    id: String,
    scan_id: String,
    name: String,
    scan_entry_indexes_encoded: serde_json::Value,
}

impl Database {
    pub async fn get_roi(&self, roi_id: &str) -> Result<Option<RoiRecord>> {
        let row = sqlx::query_as::<_, RoiRow>(
            "SELECT id, scan_id, name, scan_entry_indexes_encoded FROM rois WHERE id = $1",
        )
        .bind(roi_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| RoiRecord {
            id: r.id,
            scan_id: r.scan_id,
            name: r.name,
            scan_entry_indexes_encoded: serde_json::from_value(r.scan_entry_indexes_encoded)
                .unwrap_or_default(),
        }))
    }

    pub async fn insert_roi(&self, roi: &RoiRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO rois (id, scan_id, name, scan_entry_indexes_encoded)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                 scan_id = EXCLUDED.scan_id,
                 name = EXCLUDED.name,
                 scan_entry_indexes_encoded = EXCLUDED.scan_entry_indexes_encoded",
        )
        .bind(&roi.id)
        .bind(&roi.scan_id)
        .bind(&roi.name)
        .bind(serde_json::json!(roi.scan_entry_indexes_encoded))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
