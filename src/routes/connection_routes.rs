// src/routes/connection_routes.rs

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, OkData, PersonBrief},
    policy::{
        self, DecisionAuthority, RequestFacts, RequestPermission, Role, REQUEST_STATUS_APPROVED,
        REQUEST_STATUS_PENDING, REQUEST_STATUS_REJECTED,
    },
};

/// The pending-pair unique index fired: somebody raced past the duplicate
/// checks between our reads and the insert.
fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|c| c == "23505")
}

fn map_request_insert_error(e: sqlx::Error) -> ApiError {
    if is_unique_violation(&e) {
        ApiError::Conflict(
            "REQUEST_PENDING",
            "a pending request already exists between these users".into(),
        )
    } else {
        ApiError::BadRequest("REQUEST_CREATE_FAILED", format!("{e}"))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/connections", get(list_connections))
        .route("/connections/requests", post(create_request))
        .route("/connections/requests/incoming", get(list_incoming))
        .route("/connections/requests/outgoing", get(list_outgoing))
        .route("/connections/requests/{request_id}/approve", post(approve_request))
        .route("/connections/requests/{request_id}/reject", post(reject_request))
        .route("/connections/{connection_id}/deactivate", post(deactivate_connection))
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ConnectionRequestDto {
    pub request_id: Uuid,
    pub requester: PersonBrief,
    pub recipient: PersonBrief,
    pub status: i16,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionDto {
    pub connection_id: Uuid,
    pub other: PersonBrief,
    pub created_at: DateTime<Utc>,
}

fn role_str(roles: i16) -> String {
    Role::from_i16(roles)
        .map(|r| r.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/* ============================================================
   Helpers
   ============================================================ */

struct RequestRow {
    request_id: Uuid,
    requester_id: Uuid,
    requester_role: Role,
    recipient_id: Uuid,
    recipient_role: Role,
    status: i16,
}

async fn load_request(state: &AppState, request_id: Uuid) -> Result<RequestRow, ApiError> {
    let row = sqlx::query(
        r#"
        SELECT
          cr.request_id,
          cr.requester_user_id,
          cr.recipient_user_id,
          cr.status,
          rq.roles AS rq_roles,
          rc.roles AS rc_roles
        FROM connection_request cr
        JOIN care_user rq ON rq.user_id = cr.requester_user_id
        JOIN care_user rc ON rc.user_id = cr.recipient_user_id
        WHERE cr.request_id = $1
        "#,
    )
    .bind(request_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(r) = row else {
        return Err(ApiError::not_found("connection request"));
    };

    let rq_roles: i16 = r.try_get("rq_roles").map_err(ApiError::row)?;
    let rc_roles: i16 = r.try_get("rc_roles").map_err(ApiError::row)?;

    Ok(RequestRow {
        request_id: r.try_get("request_id").map_err(ApiError::row)?,
        requester_id: r.try_get("requester_user_id").map_err(ApiError::row)?,
        requester_role: Role::from_i16(rq_roles)
            .ok_or_else(|| ApiError::Internal(format!("unknown role value: {rq_roles}")))?,
        recipient_id: r.try_get("recipient_user_id").map_err(ApiError::row)?,
        recipient_role: Role::from_i16(rc_roles)
            .ok_or_else(|| ApiError::Internal(format!("unknown role value: {rc_roles}")))?,
        status: r.try_get("status").map_err(ApiError::row)?,
    })
}

async fn fetch_request_dto(state: &AppState, request_id: Uuid) -> Result<ConnectionRequestDto, ApiError> {
    let row = sqlx::query(
        r#"
        SELECT
          cr.request_id,
          cr.status,
          cr.created_at,
          cr.decided_at,

          rq.user_id AS rq_id,
          rq.display_name AS rq_name,
          rq.roles AS rq_roles,

          rc.user_id AS rc_id,
          rc.display_name AS rc_name,
          rc.roles AS rc_roles

        FROM connection_request cr
        JOIN care_user rq ON rq.user_id = cr.requester_user_id
        JOIN care_user rc ON rc.user_id = cr.recipient_user_id
        WHERE cr.request_id = $1
        "#,
    )
    .bind(request_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(r) = row else {
        return Err(ApiError::not_found("connection request"));
    };

    Ok(ConnectionRequestDto {
        request_id: r.try_get("request_id").map_err(ApiError::row)?,
        status: r.try_get("status").map_err(ApiError::row)?,
        created_at: r.try_get("created_at").map_err(ApiError::row)?,
        decided_at: r.try_get("decided_at").ok().flatten(),
        requester: PersonBrief {
            user_id: r.try_get("rq_id").map_err(ApiError::row)?,
            display_name: r.try_get("rq_name").map_err(ApiError::row)?,
            role: role_str(r.try_get("rq_roles").map_err(ApiError::row)?),
        },
        recipient: PersonBrief {
            user_id: r.try_get("rc_id").map_err(ApiError::row)?,
            display_name: r.try_get("rc_name").map_err(ApiError::row)?,
            role: role_str(r.try_get("rc_roles").map_err(ApiError::row)?),
        },
    })
}

/// True if `nurse_id` and `doctor_id` both hold an active connection to at
/// least one common patient (the shared-roster rule).
async fn has_shared_patient(
    state: &AppState,
    nurse_id: Uuid,
    doctor_id: Uuid,
) -> Result<bool, ApiError> {
    let shared: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM connection_edge n
            JOIN connection_edge d
              ON (CASE WHEN n.user_lo = $1 THEN n.user_hi ELSE n.user_lo END) =
                 (CASE WHEN d.user_lo = $2 THEN d.user_hi ELSE d.user_lo END)
            JOIN care_user p
              ON p.user_id = (CASE WHEN n.user_lo = $1 THEN n.user_hi ELSE n.user_lo END)
            WHERE n.is_active
              AND d.is_active
              AND (n.user_lo = $1 OR n.user_hi = $1)
              AND (d.user_lo = $2 OR d.user_hi = $2)
              AND p.roles = $3
        )
        "#,
    )
    .bind(nurse_id)
    .bind(doctor_id)
    .bind(Role::Patient.as_i16())
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(shared)
}

/* ============================================================
   POST /connections/requests
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateRequestRequest {
    pub recipient_user_id: Uuid,
}

pub async fn create_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateRequestRequest>,
) -> Result<Json<ApiOk<ConnectionRequestDto>>, ApiError> {
    let Some((user_lo, user_hi)) = policy::canonical_pair(auth.user_id, req.recipient_user_id)
    else {
        return Err(ApiError::validation("cannot request a connection to yourself"));
    };

    let recipient_roles: Option<i16> = sqlx::query_scalar(
        r#"
        SELECT roles
        FROM care_user
        WHERE user_id = $1
          AND is_active = true
        "#,
    )
    .bind(req.recipient_user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(recipient_roles) = recipient_roles else {
        return Err(ApiError::not_found("recipient"));
    };
    let recipient_role = Role::from_i16(recipient_roles)
        .ok_or_else(|| ApiError::Internal(format!("unknown role value: {recipient_roles}")))?;

    match policy::may_request(auth.role, recipient_role) {
        RequestPermission::Allowed => {}
        RequestPermission::SharedRosterRequired => {
            if !has_shared_patient(&state, auth.user_id, req.recipient_user_id).await? {
                return Err(ApiError::forbidden(
                    "A nurse may connect to a doctor only with a shared patient",
                ));
            }
        }
        RequestPermission::Denied => {
            return Err(ApiError::forbidden(
                "Your role may not request a connection to this role",
            ));
        }
    }

    // Duplicate guard: no active edge, no pending request in either direction.
    // These reads give a precise error code; the pending-pair unique index is
    // what actually holds under concurrent creates.
    let edge_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM connection_edge
            WHERE user_lo = $1 AND user_hi = $2 AND is_active
        )
        "#,
    )
    .bind(user_lo)
    .bind(user_hi)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    if edge_exists {
        return Err(ApiError::Conflict(
            "ALREADY_CONNECTED",
            "an active connection already exists".into(),
        ));
    }

    let pending_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM connection_request
            WHERE status = $3
              AND LEAST(requester_user_id, recipient_user_id) = $1
              AND GREATEST(requester_user_id, recipient_user_id) = $2
        )
        "#,
    )
    .bind(user_lo)
    .bind(user_hi)
    .bind(REQUEST_STATUS_PENDING)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    if pending_exists {
        return Err(ApiError::Conflict(
            "REQUEST_PENDING",
            "a pending request already exists between these users".into(),
        ));
    }

    let row = sqlx::query(
        r#"
        INSERT INTO connection_request (requester_user_id, recipient_user_id, status)
        VALUES ($1, $2, $3)
        RETURNING request_id
        "#,
    )
    .bind(auth.user_id)
    .bind(req.recipient_user_id)
    .bind(REQUEST_STATUS_PENDING)
    .fetch_one(&state.db)
    .await
    .map_err(map_request_insert_error)?;

    let request_id: Uuid = row.try_get("request_id").map_err(ApiError::row)?;
    let dto = fetch_request_dto(&state, request_id).await?;
    Ok(Json(ApiOk { data: dto }))
}

/* ============================================================
   Pending lists
   ============================================================ */

async fn collect_request_dtos(
    state: &AppState,
    rows: Vec<sqlx::postgres::PgRow>,
) -> Result<Vec<ConnectionRequestDto>, ApiError> {
    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        let request_id: Uuid = r.try_get("request_id").map_err(ApiError::row)?;
        out.push(fetch_request_dto(state, request_id).await?);
    }
    Ok(out)
}

pub async fn list_incoming(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<ConnectionRequestDto>>>, ApiError> {
    let rows = sqlx::query(
        r#"
        SELECT request_id
        FROM connection_request
        WHERE recipient_user_id = $1
          AND status = $2
        ORDER BY created_at ASC
        "#,
    )
    .bind(auth.user_id)
    .bind(REQUEST_STATUS_PENDING)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let items = collect_request_dtos(&state, rows).await?;
    Ok(Json(ApiOk { data: items }))
}

pub async fn list_outgoing(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<ConnectionRequestDto>>>, ApiError> {
    let rows = sqlx::query(
        r#"
        SELECT request_id
        FROM connection_request
        WHERE requester_user_id = $1
          AND status = $2
        ORDER BY created_at ASC
        "#,
    )
    .bind(auth.user_id)
    .bind(REQUEST_STATUS_PENDING)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let items = collect_request_dtos(&state, rows).await?;
    Ok(Json(ApiOk { data: items }))
}

/* ============================================================
   Approve / reject
   ============================================================ */

async fn ensure_decision_authority(
    state: &AppState,
    auth: &AuthContext,
    req: &RequestRow,
) -> Result<(), ApiError> {
    let facts = RequestFacts {
        requester_role: req.requester_role,
        recipient_id: req.recipient_id,
        recipient_role: req.recipient_role,
    };

    match policy::may_decide(auth.user_id, auth.role, facts) {
        DecisionAuthority::Allowed => Ok(()),
        DecisionAuthority::SharedRosterRequired => {
            if has_shared_patient(state, auth.user_id, req.recipient_id).await? {
                Ok(())
            } else {
                Err(ApiError::forbidden(
                    "A nurse may decide this request only with a shared patient roster",
                ))
            }
        }
        DecisionAuthority::Denied => {
            Err(ApiError::forbidden("You may not decide this request"))
        }
    }
}

pub async fn approve_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(request_id): Path<Uuid>,
) -> Result<Json<ApiOk<ConnectionRequestDto>>, ApiError> {
    let req = load_request(&state, request_id).await?;
    if req.status != REQUEST_STATUS_PENDING {
        return Err(ApiError::Conflict(
            "REQUEST_ALREADY_DECIDED",
            "request is no longer pending".into(),
        ));
    }
    ensure_decision_authority(&state, &auth, &req).await?;

    let (user_lo, user_hi) = policy::canonical_pair(req.requester_id, req.recipient_id)
        .ok_or_else(|| ApiError::Internal("request pairs a user with themselves".into()))?;

    // Approval flips the request and creates the edge in one transaction so a
    // failure leaves both untouched.
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let updated = sqlx::query(
        r#"
        UPDATE connection_request
        SET status = $2,
            decided_by_user_id = $3,
            decided_at = now()
        WHERE request_id = $1
          AND status = $4
        RETURNING request_id
        "#,
    )
    .bind(req.request_id)
    .bind(REQUEST_STATUS_APPROVED)
    .bind(auth.user_id)
    .bind(REQUEST_STATUS_PENDING)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    if updated.is_none() {
        return Err(ApiError::Conflict(
            "REQUEST_ALREADY_DECIDED",
            "request was decided concurrently".into(),
        ));
    }

    // Reactivate a soft-deleted edge rather than duplicating the pair.
    sqlx::query(
        r#"
        INSERT INTO connection_edge (user_lo, user_hi, is_active)
        VALUES ($1, $2, true)
        ON CONFLICT (user_lo, user_hi)
        DO UPDATE SET is_active = true
        "#,
    )
    .bind(user_lo)
    .bind(user_hi)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    let dto = fetch_request_dto(&state, request_id).await?;
    Ok(Json(ApiOk { data: dto }))
}

pub async fn reject_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(request_id): Path<Uuid>,
) -> Result<Json<ApiOk<ConnectionRequestDto>>, ApiError> {
    let req = load_request(&state, request_id).await?;
    if req.status != REQUEST_STATUS_PENDING {
        return Err(ApiError::Conflict(
            "REQUEST_ALREADY_DECIDED",
            "request is no longer pending".into(),
        ));
    }
    ensure_decision_authority(&state, &auth, &req).await?;

    let updated = sqlx::query(
        r#"
        UPDATE connection_request
        SET status = $2,
            decided_by_user_id = $3,
            decided_at = now()
        WHERE request_id = $1
          AND status = $4
        RETURNING request_id
        "#,
    )
    .bind(req.request_id)
    .bind(REQUEST_STATUS_REJECTED)
    .bind(auth.user_id)
    .bind(REQUEST_STATUS_PENDING)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    if updated.is_none() {
        return Err(ApiError::Conflict(
            "REQUEST_ALREADY_DECIDED",
            "request was decided concurrently".into(),
        ));
    }

    let dto = fetch_request_dto(&state, request_id).await?;
    Ok(Json(ApiOk { data: dto }))
}

/* ============================================================
   GET /connections
   ============================================================ */

pub async fn list_connections(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<ConnectionDto>>>, ApiError> {
    // The edge is stored once per unordered pair; project the "other" side.
    let rows = sqlx::query(
        r#"
        SELECT
          ce.connection_id,
          ce.created_at,
          u.user_id AS other_id,
          u.display_name AS other_name,
          u.roles AS other_roles
        FROM connection_edge ce
        JOIN care_user u
          ON u.user_id = (CASE WHEN ce.user_lo = $1 THEN ce.user_hi ELSE ce.user_lo END)
        WHERE ce.is_active
          AND (ce.user_lo = $1 OR ce.user_hi = $1)
        ORDER BY ce.created_at ASC
        "#,
    )
    .bind(auth.user_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        out.push(ConnectionDto {
            connection_id: r.try_get("connection_id").map_err(ApiError::row)?,
            created_at: r.try_get("created_at").map_err(ApiError::row)?,
            other: PersonBrief {
                user_id: r.try_get("other_id").map_err(ApiError::row)?,
                display_name: r.try_get("other_name").map_err(ApiError::row)?,
                role: role_str(r.try_get("other_roles").map_err(ApiError::row)?),
            },
        });
    }

    Ok(Json(ApiOk { data: out }))
}

/* ============================================================
   POST /connections/{id}/deactivate
   ============================================================ */

pub async fn deactivate_connection(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(connection_id): Path<Uuid>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    let row = sqlx::query(
        r#"
        SELECT user_lo, user_hi
        FROM connection_edge
        WHERE connection_id = $1
          AND is_active
        "#,
    )
    .bind(connection_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(r) = row else {
        return Err(ApiError::not_found("connection"));
    };

    let user_lo: Uuid = r.try_get("user_lo").map_err(ApiError::row)?;
    let user_hi: Uuid = r.try_get("user_hi").map_err(ApiError::row)?;

    let is_party = auth.user_id == user_lo || auth.user_id == user_hi;
    if !is_party && !auth.role.is_staff_admin() {
        return Err(ApiError::forbidden("cannot deactivate this connection"));
    }

    sqlx::query(
        r#"
        UPDATE connection_edge
        SET is_active = false
        WHERE connection_id = $1
        "#,
    )
    .bind(connection_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: OkData { ok: true },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct PgErrorStub(&'static str);

    impl fmt::Display for PgErrorStub {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "database error (code {})", self.0)
        }
    }

    impl StdError for PgErrorStub {}

    impl DatabaseError for PgErrorStub {
        fn message(&self) -> &str {
            "stub"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    fn db_err(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(PgErrorStub(code)))
    }

    #[test]
    fn test_concurrent_duplicate_request_maps_to_pending_conflict() {
        // Two creates racing past the EXISTS checks: the second insert trips
        // the pending-pair unique index and must surface as 409, not 400.
        let err = map_request_insert_error(db_err("23505"));
        assert!(matches!(err, ApiError::Conflict("REQUEST_PENDING", _)));
    }

    #[test]
    fn test_other_insert_failures_stay_bad_request() {
        let err = map_request_insert_error(db_err("23503"));
        assert!(matches!(err, ApiError::BadRequest("REQUEST_CREATE_FAILED", _)));

        let err = map_request_insert_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, ApiError::BadRequest("REQUEST_CREATE_FAILED", _)));
    }
}
