//! Route handlers.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use tracing::info;

use flowswap_core::engine::events::EngineEvent;
use flowswap_core::types::ChainId;
use flowswap_core::{InitSwapRequest, RoutingMode, SwapState};

use super::error::ApiError;
use super::types::*;
use crate::context::AppContext;

type Ctx = web::Data<Arc<AppContext>>;

/// Admin endpoints accept loopback connections only.
fn require_loopback(req: &HttpRequest) -> Result<(), ApiError> {
    let loopback = req
        .peer_addr()
        .map(|addr| addr.ip().is_loopback())
        .unwrap_or(false);
    if loopback {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

pub async fn init(ctx: Ctx, body: web::Json<InitRequest>) -> Result<HttpResponse, ApiError> {
    let h_user = body.h_user().map_err(ApiError::BadRequest)?;
    let swap = ctx
        .engine
        .init_swap(InitSwapRequest {
            direction: body.direction,
            routing: RoutingMode::SingleLp,
            from_amount: body.from_amount,
            quote: body.quote(),
            h_user,
            h_lp1: None,
            h_lp2: None,
            user_refund_address: body.user_refund_address.clone(),
            user_payout_address: body.user_payout_address.clone(),
            user_btc_pubkey: body.user_btc_pubkey.clone(),
            peer_m1_pubkey: None,
        })
        .await?;
    Ok(HttpResponse::Ok().json(SwapResponse::from(swap)))
}

pub async fn init_leg(ctx: Ctx, body: web::Json<InitLegRequest>) -> Result<HttpResponse, ApiError> {
    let h_user = body.init.h_user().map_err(ApiError::BadRequest)?;
    let h_lp1 = body.h_lp1().map_err(ApiError::BadRequest)?;
    let h_lp2 = body.h_lp2().map_err(ApiError::BadRequest)?;
    let swap = ctx
        .engine
        .init_swap(InitSwapRequest {
            direction: body.init.direction,
            routing: RoutingMode::PerLeg {
                role: body.role,
                peer_url: body.peer_url.clone(),
            },
            from_amount: body.init.from_amount,
            quote: body.init.quote(),
            h_user,
            h_lp1,
            h_lp2,
            user_refund_address: body.init.user_refund_address.clone(),
            user_payout_address: body.init.user_payout_address.clone(),
            user_btc_pubkey: body.init.user_btc_pubkey.clone(),
            peer_m1_pubkey: Some(body.peer_m1_pubkey.clone()),
        })
        .await?;
    Ok(HttpResponse::Ok().json(SwapResponse::from(swap)))
}

pub async fn get_swap(ctx: Ctx, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let swap_id = path.into_inner();
    let swap = ctx
        .store
        .get(&swap_id)
        .await
        .ok_or(flowswap_core::EngineError::UnknownSwap(swap_id))?;
    Ok(HttpResponse::Ok().json(SwapResponse::from(swap)))
}

pub async fn list_swaps(ctx: Ctx, query: web::Query<ListQuery>) -> Result<HttpResponse, ApiError> {
    let state = match query.state.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            serde_json::from_value::<SwapState>(serde_json::Value::String(raw.to_string()))
                .map_err(|_| ApiError::BadRequest(format!("unknown state {raw}")))?,
        ),
    };
    let limit = query.limit.unwrap_or(100).min(1_000);
    let swaps = ctx.store.list(state, limit).await;
    let out: Vec<SwapResponse> = swaps.into_iter().map(SwapResponse::from).collect();
    Ok(HttpResponse::Ok().json(out))
}

pub async fn btc_funded(ctx: Ctx, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let swap_id = path.into_inner();
    ctx.engine
        .handle_event(&swap_id, EngineEvent::FundingHint { chain: ChainId::Btc })
        .await?;
    Ok(HttpResponse::Accepted().finish())
}

pub async fn usdc_funded(ctx: Ctx, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let swap_id = path.into_inner();
    ctx.engine
        .handle_event(&swap_id, EngineEvent::FundingHint { chain: ChainId::Evm })
        .await?;
    Ok(HttpResponse::Accepted().finish())
}

/// Peer LP_IN tells us (LP_OUT) its M1 HTLC confirmed.
pub async fn m1_locked(
    ctx: Ctx,
    path: web::Path<String>,
    body: web::Json<M1LockedRequest>,
) -> Result<HttpResponse, ApiError> {
    let swap_id = path.into_inner();
    ctx.engine
        .handle_event(
            &swap_id,
            EngineEvent::PeerM1Locked {
                outpoint: body.outpoint.clone(),
                amount_sats: body.amount_sats,
                expiry_height: body.expiry_height,
            },
        )
        .await?;
    Ok(HttpResponse::Accepted().finish())
}

/// Peer LP_OUT hands us (LP_IN) the revealed preimages.
pub async fn btc_claimed(
    ctx: Ctx,
    path: web::Path<String>,
    body: web::Json<BtcClaimedRequest>,
) -> Result<HttpResponse, ApiError> {
    let swap_id = path.into_inner();
    let preimages = body.preimages().map_err(ApiError::BadRequest)?;
    ctx.engine
        .handle_event(
            &swap_id,
            EngineEvent::PeerSecrets {
                claim_txid: body.claim_txid.clone(),
                preimages,
            },
        )
        .await?;
    Ok(HttpResponse::Accepted().finish())
}

pub async fn force_fail(
    ctx: Ctx,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_loopback(&req)?;
    let swap_id = path.into_inner();
    let swap = ctx.engine.force_fail(&swap_id, "operator force-fail").await?;
    info!(%swap_id, "operator force-failed swap");
    Ok(HttpResponse::Ok().json(SwapResponse::from(swap)))
}

pub async fn cleanup_terminal(
    ctx: Ctx,
    req: HttpRequest,
    query: web::Query<CleanupQuery>,
) -> Result<HttpResponse, ApiError> {
    require_loopback(&req)?;
    let hours = query
        .max_age_hours
        .unwrap_or(ctx.config.store.archive_grace_hours);
    let archived = ctx.engine.archive_terminal(hours * 3600).await?;
    Ok(HttpResponse::Ok().json(CleanupResponse { archived }))
}

pub async fn health(ctx: Ctx) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        lp_id: ctx.config.identity.lp_id.clone(),
        btc_degraded: ctx.health.is_degraded(ChainId::Btc),
        m1_degraded: ctx.health.is_degraded(ChainId::M1),
        evm_degraded: ctx.health.is_degraded(ChainId::Evm),
    })
}
