//! Billing endpoints: checkout creation and the entitlement gate

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use shopfront_billing::{
    entitlement, BillingStore, Business, CheckoutRedirect, EntitlementDecision,
};
use shopfront_shared::types::{Feature, SubscriptionStatus, Tier};
use shopfront_shared::RateLimiter;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub business_id: Uuid,
    pub tier: Tier,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutRedirect>> {
    let business = state
        .billing
        .store
        .find_by_id(request.business_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("business {}", request.business_id)))?;

    let key = RateLimiter::make_key(&business.slug, "checkout", &addr.ip().to_string());
    if !state.checkout_limiter.check(&key).await.allowed {
        return Err(ApiError::RateLimited);
    }

    let redirect = state
        .billing
        .checkout
        .create_session(&business, request.tier)
        .await?;

    Ok(Json(redirect))
}

#[derive(Debug, Deserialize)]
pub struct EntitlementQuery {
    /// When present, the response enforces this single feature: denial
    /// becomes a 402/403 instead of a field in the summary.
    pub feature: Option<Feature>,
}

#[derive(Debug, Serialize)]
pub struct FeatureAccess {
    pub feature: Feature,
    pub allowed: bool,
}

#[derive(Debug, Serialize)]
pub struct EntitlementSummary {
    pub business_id: Uuid,
    pub tier: Tier,
    pub subscription_status: Option<SubscriptionStatus>,
    pub payment_healthy: bool,
    pub features: Vec<FeatureAccess>,
}

pub async fn entitlement(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(query): Query<EntitlementQuery>,
) -> ApiResult<Json<EntitlementSummary>> {
    let business = load_account(&state, business_id).await?;
    let now = OffsetDateTime::now_utc();

    if let Some(feature) = query.feature {
        if let EntitlementDecision::Deny { reason } = entitlement::check(&business, feature, now) {
            return Err(ApiError::Denied(reason));
        }
    }

    let features = Feature::ALL
        .iter()
        .map(|&feature| FeatureAccess {
            feature,
            allowed: entitlement::check(&business, feature, now).is_allowed(),
        })
        .collect();

    Ok(Json(EntitlementSummary {
        business_id: business.id,
        tier: business.tier,
        subscription_status: business.subscription_status,
        payment_healthy: entitlement::payment_healthy(&business, now),
        features,
    }))
}

/// Account lookup through the short-TTL cache; decisions stay time-bound
/// because only the record is cached, never the verdict.
async fn load_account(state: &AppState, business_id: Uuid) -> ApiResult<Business> {
    if let Some(cached) = state.entitlement_cache.get(&business_id).await {
        return Ok(cached);
    }

    let business = state
        .billing
        .store
        .find_by_id(business_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("business {business_id}")))?;

    state
        .entitlement_cache
        .insert(business_id, business.clone())
        .await;

    Ok(business)
}
