// src/routes/ad_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, OkData},
    policy::Role,
    rotation::{self, AD_STATUS_ACTIVE, AD_STATUS_INACTIVE},
};

fn is_sponsor(auth: &AuthContext) -> bool {
    auth.role == Role::Sponsor
}

fn ensure_publish(auth: &AuthContext) -> Result<(), ApiError> {
    if is_sponsor(auth) || auth.role.is_staff_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("Only sponsors or admin/office_manager can manage ads"))
    }
}

fn validate_title(title: &str) -> Result<(), ApiError> {
    let t = title.trim();
    if t.is_empty() {
        return Err(ApiError::validation("title is required"));
    }
    if t.len() > 160 {
        return Err(ApiError::validation("title is too long (max 160)"));
    }
    Ok(())
}

fn validate_status(status: i16) -> Result<(), ApiError> {
    if status == AD_STATUS_ACTIVE || status == AD_STATUS_INACTIVE {
        Ok(())
    } else {
        Err(ApiError::validation("status must be 0 (inactive) or 1 (active)"))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ads", post(create_ad))
        .route("/ads/eligible", get(list_eligible))
        .route("/ads/current", get(current_ad))
        .route("/ads/{ad_id}", patch(update_ad))
        .route("/ads/{ad_id}/impression", post(record_impression))
        .route("/ads/{ad_id}/click", post(record_click))
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AdRow {
    pub ad_id: Uuid,
    pub sponsor_user_id: Uuid,
    pub title: String,
    pub body: Option<String>,
    pub link_url: Option<String>,
    pub status: i16,
    pub expires_at: DateTime<Utc>,
    pub impressions: i64,
    pub clicks: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct EligibleAdsDto {
    pub ads: Vec<AdRow>,
    pub rotation_interval_secs: i64,
}

#[derive(Debug, Serialize)]
pub struct CurrentAdDto {
    pub ad: Option<AdRow>,
    pub index: usize,
    pub eligible_count: usize,
    pub rotation_interval_secs: i64,
}

/// Active ads ordered stably, then narrowed by the strict-expiry rule.
async fn load_eligible(state: &AppState, now: DateTime<Utc>) -> Result<Vec<AdRow>, ApiError> {
    let rows = sqlx::query_as::<_, AdRow>(
        r#"
        SELECT ad_id, sponsor_user_id, title, body, link_url, status,
               expires_at, impressions, clicks, created_at
        FROM sponsor_ad
        WHERE status = $1
        ORDER BY created_at ASC, ad_id ASC
        "#,
    )
    .bind(AD_STATUS_ACTIVE)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(rows
        .into_iter()
        .filter(|a| rotation::is_eligible(a.status, a.expires_at, now))
        .collect())
}

/* ============================================================
   GET /ads/eligible
   ============================================================ */

pub async fn list_eligible(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<EligibleAdsDto>>, ApiError> {
    let ads = load_eligible(&state, Utc::now()).await?;
    Ok(Json(ApiOk {
        data: EligibleAdsDto {
            ads,
            rotation_interval_secs: state.ad_rotation_secs,
        },
    }))
}

/* ============================================================
   GET /ads/current
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CurrentAdQuery {
    /// When the viewer's carousel started; defaults to "just now".
    pub started_at: Option<DateTime<Utc>>,
}

pub async fn current_ad(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<CurrentAdQuery>,
) -> Result<Json<ApiOk<CurrentAdDto>>, ApiError> {
    let now = Utc::now();
    let mut ads = load_eligible(&state, now).await?;

    let elapsed_secs = q
        .started_at
        .map(|s| (now - s).num_seconds())
        .unwrap_or(0);
    let ticks = rotation::ticks_elapsed(elapsed_secs, state.ad_rotation_secs);
    let index = rotation::index_after_ticks(ads.len(), ticks);

    let eligible_count = ads.len();
    let ad = if ads.is_empty() {
        None
    } else {
        Some(ads.swap_remove(index))
    };

    Ok(Json(ApiOk {
        data: CurrentAdDto {
            ad,
            index,
            eligible_count,
            rotation_interval_secs: state.ad_rotation_secs,
        },
    }))
}

/* ============================================================
   POST /ads
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateAdRequest {
    pub title: String,
    pub body: Option<String>,
    pub link_url: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub status: Option<i16>, // default active
}

pub async fn create_ad(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAdRequest>,
) -> Result<Json<ApiOk<AdRow>>, ApiError> {
    ensure_publish(&auth)?;
    validate_title(&req.title)?;
    let status = req.status.unwrap_or(AD_STATUS_ACTIVE);
    validate_status(status)?;
    if req.expires_at <= Utc::now() {
        return Err(ApiError::validation("expires_at must be in the future"));
    }

    let ad = sqlx::query_as::<_, AdRow>(
        r#"
        INSERT INTO sponsor_ad (sponsor_user_id, title, body, link_url, status, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING ad_id, sponsor_user_id, title, body, link_url, status,
                  expires_at, impressions, clicks, created_at
        "#,
    )
    .bind(auth.user_id)
    .bind(req.title.trim())
    .bind(req.body)
    .bind(req.link_url)
    .bind(status)
    .bind(req.expires_at)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("AD_CREATE_FAILED", format!("{e}")))?;

    Ok(Json(ApiOk { data: ad }))
}

/* ============================================================
   PATCH /ads/{id}
   ============================================================ */

/// Omitted (or null) fields are left unchanged.
#[derive(Debug, Deserialize)]
pub struct UpdateAdRequest {
    pub title: Option<String>,
    pub body: Option<String>,
    pub link_url: Option<String>,
    pub status: Option<i16>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn update_ad(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(ad_id): Path<Uuid>,
    Json(req): Json<UpdateAdRequest>,
) -> Result<Json<ApiOk<AdRow>>, ApiError> {
    ensure_publish(&auth)?;
    if let Some(t) = &req.title {
        validate_title(t)?;
    }
    if let Some(s) = req.status {
        validate_status(s)?;
    }

    // A sponsor may only touch their own ads; staff may touch any.
    let owner: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT sponsor_user_id
        FROM sponsor_ad
        WHERE ad_id = $1
        "#,
    )
    .bind(ad_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(owner) = owner else {
        return Err(ApiError::not_found("ad"));
    };
    if is_sponsor(&auth) && owner != auth.user_id {
        return Err(ApiError::forbidden("Sponsors can only edit their own ads"));
    }

    let ad = sqlx::query_as::<_, AdRow>(
        r#"
        UPDATE sponsor_ad
        SET
          title      = COALESCE($2, title),
          body       = COALESCE($3, body),
          link_url   = COALESCE($4, link_url),
          status     = COALESCE($5, status),
          expires_at = COALESCE($6, expires_at),
          updated_at = now()
        WHERE ad_id = $1
        RETURNING ad_id, sponsor_user_id, title, body, link_url, status,
                  expires_at, impressions, clicks, created_at
        "#,
    )
    .bind(ad_id)
    .bind(req.title.as_deref().map(str::trim))
    .bind(req.body)
    .bind(req.link_url)
    .bind(req.status)
    .bind(req.expires_at)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("AD_UPDATE_FAILED", format!("{e}")))?
    .ok_or_else(|| ApiError::not_found("ad"))?;

    Ok(Json(ApiOk { data: ad }))
}

/* ============================================================
   Telemetry: impressions and clicks
   ============================================================ */

// Best-effort counter bumps. A failed write must never block the banner, so
// the error goes to the log and the call still succeeds.

pub async fn record_impression(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(ad_id): Path<Uuid>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    let recorded = match sqlx::query(
        r#"
        UPDATE sponsor_ad
        SET impressions = impressions + 1
        WHERE ad_id = $1
        "#,
    )
    .bind(ad_id)
    .execute(&state.db)
    .await
    {
        Ok(result) => result.rows_affected() > 0,
        Err(e) => {
            tracing::warn!(%ad_id, error = %e, "ad impression write failed");
            false
        }
    };

    Ok(Json(ApiOk {
        data: OkData { ok: recorded },
    }))
}

#[derive(Debug, Serialize)]
pub struct ClickDto {
    pub ok: bool,
    pub link_url: Option<String>,
}

pub async fn record_click(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(ad_id): Path<Uuid>,
) -> Result<Json<ApiOk<ClickDto>>, ApiError> {
    let recorded = match sqlx::query(
        r#"
        UPDATE sponsor_ad
        SET clicks = clicks + 1
        WHERE ad_id = $1
        "#,
    )
    .bind(ad_id)
    .execute(&state.db)
    .await
    {
        Ok(result) => result.rows_affected() > 0,
        Err(e) => {
            tracing::warn!(%ad_id, error = %e, "ad click write failed");
            false
        }
    };

    // Navigation target for the client; best-effort like the counter itself.
    let link_url: Option<String> = sqlx::query_scalar(
        r#"
        SELECT link_url
        FROM sponsor_ad
        WHERE ad_id = $1
        "#,
    )
    .bind(ad_id)
    .fetch_optional(&state.db)
    .await
    .unwrap_or_else(|e| {
        tracing::warn!(%ad_id, error = %e, "ad link lookup failed");
        None
    })
    .flatten();

    Ok(Json(ApiOk {
        data: ClickDto {
            ok: recorded,
            link_url,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_title() {
        assert!(validate_title("Spring checkup special").is_ok());
        assert!(validate_title("   ").is_err());
        assert!(validate_title(&"t".repeat(200)).is_err());
    }

    #[test]
    fn test_update_request_omitted_and_null_both_mean_unchanged() {
        let req: UpdateAdRequest = serde_json::from_str(r#"{"title":"New title"}"#).unwrap();
        assert_eq!(req.title.as_deref(), Some("New title"));
        assert!(req.body.is_none());
        assert!(req.link_url.is_none());

        let req: UpdateAdRequest =
            serde_json::from_str(r#"{"body":null,"link_url":null}"#).unwrap();
        assert!(req.body.is_none());
        assert!(req.link_url.is_none());
    }

    #[test]
    fn test_validate_status() {
        assert!(validate_status(AD_STATUS_ACTIVE).is_ok());
        assert!(validate_status(AD_STATUS_INACTIVE).is_ok());
        assert!(validate_status(2).is_err());
        assert!(validate_status(-1).is_err());
    }
}
