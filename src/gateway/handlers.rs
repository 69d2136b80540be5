//! Request dispatch for the session channel.
//!
//! One typed handler per request variant. Handlers return `ApiResult`;
//! the dispatch table maps each error class to a transport status and
//! attaches the display text, so the socket loop only ever sees a
//! well-formed [`Response`].

use crate::db::QUANT_OBJECT_TYPE;
use crate::error::{ApiError, ApiResult};
use crate::quant::{create, multiquant, QuantContext};
use crate::sessions::Principal;
use crate::wire::{
    Request, RequestBody, Response, ResponseBody, ResponseStatus,
};
use tracing::debug;

pub(super) async fn dispatch(
    ctx: &QuantContext,
    session_id: &str,
    user: &Principal,
    req: Request,
) -> Response {
    debug!(session_id, msg_id = req.msg_id, "dispatching request");
    let result = handle(ctx, session_id, user, req.body).await;
    match result {
        Ok(body) => Response {
            msg_id: req.msg_id,
            status: ResponseStatus::Ok,
            error_text: String::new(),
            body: Some(body),
        },
        Err(e) => Response {
            msg_id: req.msg_id,
            status: e.status(),
            error_text: e.to_string(),
            body: None,
        },
    }
}

async fn handle(
    ctx: &QuantContext,
    session_id: &str,
    user: &Principal,
    body: RequestBody,
) -> ApiResult<ResponseBody> {
    match body {
        RequestBody::QuantCreate(params) => {
            let job = create::create_quant(ctx, user, params).await?;
            Ok(ResponseBody::QuantCreate { job })
        }
        RequestBody::QuantGet { quant_id } => {
            ctx.db.check_access(&user.user_id, &quant_id, false).await?;
            let summary = ctx
                .db
                .get_quant(&quant_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("quant {}", quant_id)))?;
            Ok(ResponseBody::QuantGet {
                summary: summary.into_msg(),
            })
        }
        RequestBody::QuantList { scan_id } => {
            let accessible = ctx
                .db
                .list_accessible_ids(&user.user_id, QUANT_OBJECT_TYPE)
                .await?;
            let summaries = ctx
                .db
                .list_quants_for_scan(&scan_id)
                .await?
                .into_iter()
                .filter(|s| accessible.contains_key(&s.id))
                .map(|s| s.into_msg())
                .collect();
            Ok(ResponseBody::QuantList { summaries })
        }
        RequestBody::MultiQuantCombine(params) => {
            let job = multiquant::combine(ctx, user, params).await?;
            Ok(ResponseBody::MultiQuantCombine { job })
        }
        RequestBody::MultiQuantCompare {
            scan_id,
            roi_id,
            quant_ids,
        } => {
            let tables = multiquant::compare(ctx, user, &scan_id, &roi_id, &quant_ids).await?;
            Ok(ResponseBody::MultiQuantCompare { tables })
        }
        RequestBody::NotificationSubscribe => {
            ctx.notifier
                .subscribe_session(session_id, &user.user_id)
                .await?;
            Ok(ResponseBody::NotificationSubscribe)
        }
        RequestBody::NotificationDismiss { id } => {
            ctx.notifier.dismiss(&id).await?;
            Ok(ResponseBody::NotificationDismiss)
        }
    }
}
