//! JSON API for the panel. Mutating endpoints funnel into the same app layer
//! the CLI uses, so they queue on the apply mutex like everyone else.

pub mod types;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};

use crate::{
    app::{SiteAddRequest, normalize_domain},
    apply::ApplyRequest,
    error::ApiError,
    state::AppState,
};
use types::*;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sites", get(list_sites).post(upsert_site))
        .route("/api/sites/{domain}", get(get_site))
        .route("/api/sites/{domain}/disable", post(disable_site))
        .route("/api/sites/{domain}/enable", post(enable_site))
        .route("/api/apply", post(trigger_apply))
        .route("/api/certs", get(list_certs))
        .route("/api/certs/{domain}", get(get_cert))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn require_token(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if presented.is_empty() {
        return Err(ApiError::unauthorized());
    }
    if !state.app.cfg.api.tokens.iter().any(|t| t == presented) {
        return Err(ApiError::unauthorized());
    }
    Ok(())
}

fn map_internal(e: anyhow::Error) -> ApiError {
    ApiError::internal(format!("{e:#}"))
}

async fn list_sites(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListSitesResponse>, ApiError> {
    require_token(&state, &headers)?;
    let sites = state.app.site_list().await.map_err(map_internal)?;
    Ok(Json(ListSitesResponse {
        sites: sites.into_iter().map(SiteResponse::from).collect(),
    }))
}

async fn get_site(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Result<Json<SiteResponse>, ApiError> {
    require_token(&state, &headers)?;
    let site = state
        .app
        .db
        .get_site_by_domain(&normalize_domain(&domain))
        .await
        .map_err(map_internal)?;
    let Some(site) = site else {
        return Err(ApiError::not_found("site not found"));
    };
    Ok(Json(site.into()))
}

async fn upsert_site(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<UpsertSiteRequest>,
) -> Result<(StatusCode, Json<UpsertSiteResponse>), ApiError> {
    require_token(&state, &headers)?;

    if req.user.trim().is_empty() {
        return Err(ApiError::invalid_argument("user must not be empty"));
    }
    if req.domain.trim().is_empty() {
        return Err(ApiError::invalid_argument("domain must not be empty"));
    }

    let res = state
        .app
        .site_add(SiteAddRequest {
            user: req.user,
            domain: req.domain,
            mode: req.mode,
            php_version: req.php_version,
            webroot: req.webroot,
            http3: req.http3,
            provision: req.provision,
            skip_cert: req.skip_cert,
            apply_now: req.apply_now,
            proxy_targets: req.proxy_targets,
        })
        .await
        .map_err(|e| ApiError::invalid_argument(format!("{e:#}")))?;

    Ok((
        StatusCode::CREATED,
        Json(UpsertSiteResponse {
            site: res.site.into(),
            warnings: res.warnings,
        }),
    ))
}

async fn disable_site(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Result<Json<SiteResponse>, ApiError> {
    require_token(&state, &headers)?;
    state
        .app
        .site_disable(&domain)
        .await
        .map_err(|e| ApiError::not_found(format!("{e:#}")))?;
    let site = state.app.site_get(&domain).await.map_err(map_internal)?;
    Ok(Json(site.into()))
}

async fn enable_site(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Result<Json<SiteResponse>, ApiError> {
    require_token(&state, &headers)?;
    state
        .app
        .site_enable(&domain)
        .await
        .map_err(|e| ApiError::not_found(format!("{e:#}")))?;
    let site = state.app.site_get(&domain).await.map_err(map_internal)?;
    Ok(Json(site.into()))
}

async fn trigger_apply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ApplyBody>,
) -> Result<Json<crate::apply::ApplyResult>, ApiError> {
    require_token(&state, &headers)?;
    let res = state
        .app
        .apply(ApplyRequest {
            domain: body.domain,
            all: body.all,
            dry_run: body.dry_run,
            limit: body.limit,
        })
        .await
        .map_err(map_internal)?;
    Ok(Json(res))
}

async fn list_certs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListCertsResponse>, ApiError> {
    require_token(&state, &headers)?;
    let certs = state.app.cert_list().map_err(map_internal)?;
    Ok(Json(ListCertsResponse {
        certs: certs.into_iter().map(CertResponse::from).collect(),
    }))
}

async fn get_cert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Result<Json<CertResponse>, ApiError> {
    require_token(&state, &headers)?;
    let info = state.app.cert_info(&domain).map_err(map_internal)?;
    Ok(Json(info.into()))
}
