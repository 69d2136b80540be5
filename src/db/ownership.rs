//! Ownership rows and access checks.
//!
//! Every user-visible business object has exactly one ownership row.
//! A read intent needs viewer-or-editor rights; an edit intent needs
//! editor rights; the creator is implicitly an editor. Group grants
//! expand transitively: viewer rights flow through group members and
//! group viewers, editor rights only through group members.

use super::Database;
use crate::error::ApiError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAndGroupIds {
    pub user_ids: Vec<String>,
    pub group_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipItem {
    pub id: String,
    pub object_type: String,
    pub creator_user_id: String,
    pub created_unix_sec: i64,
    pub viewers: UserAndGroupIds,
    pub editors: UserAndGroupIds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserGroupRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub admin_user_ids: Vec<String>,
    pub member_user_ids: Vec<String>,
    pub member_group_ids: Vec<String>,
    pub viewer_user_ids: Vec<String>,
    pub viewer_group_ids: Vec<String>,
    pub joinable: bool,
    pub created_unix_sec: i64,
}

/// Initial ownership row for a newly created object: the creator is the
/// sole editor.
pub fn make_owner_for_write(
    object_id: &str,
    object_type: &str,
    creator_user_id: &str,
    now_unix: i64,
) -> OwnershipItem {
    OwnershipItem {
        id: object_id.to_string(),
        object_type: object_type.to_string(),
        creator_user_id: creator_user_id.to_string(),
        created_unix_sec: now_unix,
        viewers: UserAndGroupIds::default(),
        editors: UserAndGroupIds {
            user_ids: vec![creator_user_id.to_string()],
            group_ids: Vec::new(),
        },
    }
}

/// All users reachable from `group_id` through member links, and
/// optionally viewer links. Cycle-safe.
fn expand_group(
    group_id: &str,
    groups: &HashMap<String, UserGroupRecord>,
    include_viewers: bool,
    seen: &mut HashSet<String>,
    out: &mut HashSet<String>,
) {
    if !seen.insert(group_id.to_string()) {
        return;
    }
    let Some(group) = groups.get(group_id) else {
        return;
    };
    out.extend(group.member_user_ids.iter().cloned());
    for sub in &group.member_group_ids {
        expand_group(sub, groups, include_viewers, seen, out);
    }
    if include_viewers {
        out.extend(group.viewer_user_ids.iter().cloned());
        for sub in &group.viewer_group_ids {
            expand_group(sub, groups, include_viewers, seen, out);
        }
    }
}

fn groups_grant(
    user_id: &str,
    group_ids: &[String],
    groups: &HashMap<String, UserGroupRecord>,
    include_viewers: bool,
) -> bool {
    let mut users = HashSet::new();
    let mut seen = HashSet::new();
    for gid in group_ids {
        expand_group(gid, groups, include_viewers, &mut seen, &mut users);
    }
    users.contains(user_id)
}

pub fn user_is_editor(
    user_id: &str,
    item: &OwnershipItem,
    groups: &HashMap<String, UserGroupRecord>,
) -> bool {
    user_id == item.creator_user_id
        || item.editors.user_ids.iter().any(|u| u == user_id)
        || groups_grant(user_id, &item.editors.group_ids, groups, false)
}

pub fn user_is_viewer(
    user_id: &str,
    item: &OwnershipItem,
    groups: &HashMap<String, UserGroupRecord>,
) -> bool {
    user_is_editor(user_id, item, groups)
        || item.viewers.user_ids.iter().any(|u| u == user_id)
        || groups_grant(user_id, &item.viewers.group_ids, groups, true)
}

/// All groups the user belongs to, transitively upward through member
/// and viewer containment. Used to push access filtering into SQL.
pub fn groups_of_user(user_id: &str, groups: &HashMap<String, UserGroupRecord>) -> Vec<String> {
    let mut mine: HashSet<String> = groups
        .values()
        .filter(|g| {
            g.member_user_ids.iter().any(|u| u == user_id)
                || g.viewer_user_ids.iter().any(|u| u == user_id)
        })
        .map(|g| g.id.clone())
        .collect();
    loop {
        let added: Vec<String> = groups
            .values()
            .filter(|g| !mine.contains(&g.id))
            .filter(|g| {
                g.member_group_ids.iter().any(|s| mine.contains(s))
                    || g.viewer_group_ids.iter().any(|s| mine.contains(s))
            })
            .map(|g| g.id.clone())
            .collect();
        if added.is_empty() {
            break;
        }
        mine.extend(added);
    }
    mine.into_iter().collect()
}

#[derive(sqlx::FromRow)]
struct OwnershipRow {
    id: String,
    object_type: String,
    creator_user_id: String,
    created_unix_sec: i64,
    viewer_user_ids: serde_json::Value,
    viewer_group_ids: serde_json::Value,
    editor_user_ids: serde_json::Value,
    editor_group_ids: serde_json::Value,
}

fn ids(v: serde_json::Value) -> Vec<String> {
    serde_json::from_value(v).unwrap_or_default()
}

impl OwnershipRow {
    fn into_item(self) -> OwnershipItem {
        OwnershipItem {
            id: self.id,
            object_type: self.object_type,
            creator_user_id: self.creator_user_id,
            created_unix_sec: self.created_unix_sec,
            viewers: UserAndGroupIds {
                user_ids: ids(self.viewer_user_ids),
                group_ids: ids(self.viewer_group_ids),
            },
            editors: UserAndGroupIds {
                user_ids: ids(self.editor_user_ids),
                group_ids: ids(self.editor_group_ids),
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: String,
    name: String,
    description: String,
    created_by: String,
    admin_user_ids: serde_json::Value,
    member_user_ids: serde_json::Value,
    member_group_ids: serde_json::Value,
    viewer_user_ids: serde_json::Value,
    viewer_group_ids: serde_json::Value,
    joinable: bool,
    created_unix_sec: i64,
}

impl GroupRow {
    fn into_record(self) -> UserGroupRecord {
        UserGroupRecord {
            id: self.id,
            name: self.name,
            description: self.description,
            created_by: self.created_by,
            admin_user_ids: ids(self.admin_user_ids),
            member_user_ids: ids(self.member_user_ids),
            member_group_ids: ids(self.member_group_ids),
            viewer_user_ids: ids(self.viewer_user_ids),
            viewer_group_ids: ids(self.viewer_group_ids),
            joinable: self.joinable,
            created_unix_sec: self.created_unix_sec,
        }
    }
}

const OWNERSHIP_COLUMNS: &str = "id, object_type, creator_user_id, created_unix_sec,
     viewer_user_ids, viewer_group_ids, editor_user_ids, editor_group_ids";

/// Insert an ownership row inside a caller-owned transaction, so the
/// business object and its ownership land atomically.
pub async fn insert_ownership_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    item: &OwnershipItem,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO ownership (id, object_type, creator_user_id, created_unix_sec,
             viewer_user_ids, viewer_group_ids, editor_user_ids, editor_group_ids)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&item.id)
    .bind(&item.object_type)
    .bind(&item.creator_user_id)
    .bind(item.created_unix_sec)
    .bind(serde_json::json!(item.viewers.user_ids))
    .bind(serde_json::json!(item.viewers.group_ids))
    .bind(serde_json::json!(item.editors.user_ids))
    .bind(serde_json::json!(item.editors.group_ids))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn delete_ownership_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    object_id: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM ownership WHERE id = $1")
        .bind(object_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

impl Database {
    pub async fn get_ownership(&self, object_id: &str) -> Result<Option<OwnershipItem>> {
        let row = sqlx::query_as::<_, OwnershipRow>(&format!(
            "SELECT {} FROM ownership WHERE id = $1",
            OWNERSHIP_COLUMNS
        ))
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(OwnershipRow::into_item))
    }

    pub async fn get_all_groups(&self) -> Result<HashMap<String, UserGroupRecord>> {
        let rows = sqlx::query_as::<_, GroupRow>(
            "SELECT id, name, description, created_by, admin_user_ids, member_user_ids,
                    member_group_ids, viewer_user_ids, viewer_group_ids, joinable,
                    created_unix_sec
             FROM user_groups",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.id.clone(), r.into_record()))
            .collect())
    }

    pub async fn create_group(&self, group: &UserGroupRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_groups (id, name, description, created_by, admin_user_ids,
                 member_user_ids, member_group_ids, viewer_user_ids, viewer_group_ids,
                 joinable, created_unix_sec)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(&group.created_by)
        .bind(serde_json::json!(group.admin_user_ids))
        .bind(serde_json::json!(group.member_user_ids))
        .bind(serde_json::json!(group.member_group_ids))
        .bind(serde_json::json!(group.viewer_user_ids))
        .bind(serde_json::json!(group.viewer_group_ids))
        .bind(group.joinable)
        .bind(group.created_unix_sec)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A group may not be deleted while any ownership row grants through it.
    pub async fn delete_group(&self, group_id: &str) -> Result<(), ApiError> {
        let in_use: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ownership
             WHERE viewer_group_ids ? $1 OR editor_group_ids ? $1",
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;
        if in_use > 0 {
            return Err(ApiError::BadRequest(format!(
                "group {} is referenced by {} ownership records",
                group_id, in_use
            )));
        }
        let result = sqlx::query("DELETE FROM user_groups WHERE id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound(format!("group {}", group_id)));
        }
        Ok(())
    }

    /// Resolve `(user, object, intent)` to the ownership item, or a
    /// not-found / no-permission error.
    pub async fn check_access(
        &self,
        user_id: &str,
        object_id: &str,
        edit: bool,
    ) -> Result<OwnershipItem, ApiError> {
        let item = self
            .get_ownership(object_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("object {}", object_id)))?;
        let groups = self.get_all_groups().await?;
        let allowed = if edit {
            user_is_editor(user_id, &item, &groups)
        } else {
            user_is_viewer(user_id, &item, &groups)
        };
        if !allowed {
            return Err(ApiError::NoPermission(format!(
                "user {} on object {}",
                user_id, object_id
            )));
        }
        Ok(item)
    }

    /// Object ids of `object_type` where the user has at least viewer
    /// rights, with their ownership rows for detail rendering.
    pub async fn list_accessible_ids(
        &self,
        user_id: &str,
        object_type: &str,
    ) -> Result<HashMap<String, OwnershipItem>> {
        let groups = self.get_all_groups().await?;
        let group_ids = groups_of_user(user_id, &groups);
        let rows = sqlx::query_as::<_, OwnershipRow>(&format!(
            "SELECT {} FROM ownership
             WHERE object_type = $1
               AND (creator_user_id = $2
                    OR viewer_user_ids ? $2
                    OR editor_user_ids ? $2
                    OR viewer_group_ids ?| $3
                    OR editor_group_ids ?| $3)",
            OWNERSHIP_COLUMNS
        ))
        .bind(object_type)
        .bind(user_id)
        .bind(&group_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.id.clone(), r.into_item()))
            .collect())
    }
}
