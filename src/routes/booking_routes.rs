// src/routes/booking_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, PersonBrief},
    policy::Role,
    routes::room_routes::{load_room_slots, room_exists_and_active},
    scheduling::{
        self, TimeWindow, BOOKING_STATUS_CANCELLED, BOOKING_STATUS_COMPLETED,
        BOOKING_STATUS_SCHEDULED,
    },
};

fn is_provider(auth: &AuthContext) -> bool {
    matches!(auth.role, Role::Doctor | Role::Nurse)
}

fn can_manage_bookings(auth: &AuthContext) -> bool {
    auth.role.is_staff_admin() || is_provider(auth)
}

fn ensure_manage(auth: &AuthContext) -> Result<(), ApiError> {
    if can_manage_bookings(auth) {
        Ok(())
    } else {
        Err(ApiError::forbidden(
            "Only staff can create or manage bookings",
        ))
    }
}

/// Exclusion constraint on (room, time range) fired: somebody raced past the
/// availability check between our read and the insert.
fn is_exclusion_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|c| c == "23P01")
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/day", get(list_bookings_day))
        .route("/bookings/{booking_id}", get(get_booking))
        .route("/bookings/{booking_id}/cancel", post(cancel_booking))
        .route("/bookings/{booking_id}/complete", post(complete_booking))
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct BookingDto {
    pub booking_id: Uuid,
    pub room_id: Option<Uuid>,
    pub room_name: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: i16,
    pub note: Option<String>,
    pub patient: PersonBrief,
    pub provider: PersonBrief,
    pub created_at: DateTime<Utc>,
}

fn role_str(roles: i16) -> String {
    Role::from_i16(roles)
        .map(|r| r.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn fetch_booking_with_joins(state: &AppState, booking_id: Uuid) -> Result<BookingDto, ApiError> {
    let row = sqlx::query(
        r#"
        SELECT
          b.booking_id,
          b.room_id,
          b.start_at,
          b.end_at,
          b.status,
          b.note,
          b.created_at,

          rm.room_name,

          p.user_id AS p_id,
          p.display_name AS p_name,
          p.roles AS p_roles,

          pr.user_id AS pr_id,
          pr.display_name AS pr_name,
          pr.roles AS pr_roles

        FROM booking b
        JOIN care_user p ON p.user_id = b.patient_user_id
        JOIN care_user pr ON pr.user_id = b.provider_user_id
        LEFT JOIN room rm ON rm.room_id = b.room_id
        WHERE b.booking_id = $1
        "#,
    )
    .bind(booking_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(r) = row else {
        return Err(ApiError::not_found("booking"));
    };

    Ok(BookingDto {
        booking_id: r.try_get("booking_id").map_err(ApiError::row)?,
        room_id: r.try_get("room_id").ok().flatten(),
        room_name: r.try_get("room_name").ok().flatten(),
        start_at: r.try_get("start_at").map_err(ApiError::row)?,
        end_at: r.try_get("end_at").map_err(ApiError::row)?,
        status: r.try_get("status").map_err(ApiError::row)?,
        note: r.try_get("note").ok().flatten(),
        created_at: r.try_get("created_at").map_err(ApiError::row)?,
        patient: PersonBrief {
            user_id: r.try_get("p_id").map_err(ApiError::row)?,
            display_name: r.try_get("p_name").map_err(ApiError::row)?,
            role: role_str(r.try_get("p_roles").map_err(ApiError::row)?),
        },
        provider: PersonBrief {
            user_id: r.try_get("pr_id").map_err(ApiError::row)?,
            display_name: r.try_get("pr_name").map_err(ApiError::row)?,
            role: role_str(r.try_get("pr_roles").map_err(ApiError::row)?),
        },
    })
}

async fn ensure_can_view_booking(
    state: &AppState,
    auth: &AuthContext,
    booking_id: Uuid,
) -> Result<BookingDto, ApiError> {
    let dto = fetch_booking_with_joins(state, booking_id).await?;

    if auth.role.is_staff_admin() {
        return Ok(dto);
    }
    if dto.patient.user_id == auth.user_id || dto.provider.user_id == auth.user_id {
        return Ok(dto);
    }
    Err(ApiError::forbidden("cannot view this booking"))
}

async fn user_role(state: &AppState, user_id: Uuid) -> Result<Role, ApiError> {
    let roles: Option<i16> = sqlx::query_scalar(
        r#"
        SELECT roles
        FROM care_user
        WHERE user_id = $1
          AND is_active = true
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(roles) = roles else {
        return Err(ApiError::not_found("user"));
    };
    Role::from_i16(roles).ok_or_else(|| ApiError::Internal(format!("unknown role value: {roles}")))
}

/* ============================================================
   POST /bookings
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub patient_user_id: Uuid,
    pub provider_user_id: Uuid,
    pub room_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    pub duration_min: i64,
    pub note: Option<String>,
}

pub async fn create_booking(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateBookingRequest>,
) -> Result<Json<ApiOk<BookingDto>>, ApiError> {
    ensure_manage(&auth)?;

    // A provider may only book onto their own schedule.
    if is_provider(&auth) && req.provider_user_id != auth.user_id {
        return Err(ApiError::forbidden(
            "Providers can only create bookings for themselves",
        ));
    }

    let window = TimeWindow::from_start_and_minutes(req.start_at, req.duration_min)
        .map_err(|e| ApiError::validation(&e.to_string()))?;

    if user_role(&state, req.patient_user_id).await? != Role::Patient {
        return Err(ApiError::validation("patient_user_id must be a patient account"));
    }
    let provider_role = user_role(&state, req.provider_user_id).await?;
    if !matches!(provider_role, Role::Doctor | Role::Nurse) {
        return Err(ApiError::validation("provider_user_id must be a doctor or nurse"));
    }

    // Diagnostic pass of the availability check. The exclusion constraint on
    // booking remains the source of truth under concurrent writers.
    if let Some(room_id) = req.room_id {
        if !room_exists_and_active(&state, room_id).await? {
            return Err(ApiError::BadRequest("ROOM_INACTIVE", "room is deactivated".into()));
        }
        let slots = load_room_slots(&state, room_id, window).await?;
        let availability = scheduling::check_availability(window, &slots);
        if !availability.available {
            return Err(booking_conflict(availability.conflicts));
        }
    }

    let row = sqlx::query(
        r#"
        INSERT INTO booking (
          room_id,
          patient_user_id,
          provider_user_id,
          start_at,
          end_at,
          status,
          note,
          created_by_user_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING booking_id
        "#,
    )
    .bind(req.room_id)
    .bind(req.patient_user_id)
    .bind(req.provider_user_id)
    .bind(window.start)
    .bind(window.end)
    .bind(BOOKING_STATUS_SCHEDULED)
    .bind(req.note)
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await
    .map_err(|e| {
        if is_exclusion_violation(&e) {
            ApiError::Conflict(
                "BOOKING_CONFLICT",
                "room was booked concurrently for an overlapping window".into(),
            )
        } else {
            ApiError::BadRequest("BOOKING_CREATE_FAILED", format!("{e}"))
        }
    })?;

    let booking_id: Uuid = row.try_get("booking_id").map_err(ApiError::row)?;
    let dto = fetch_booking_with_joins(&state, booking_id).await?;
    Ok(Json(ApiOk { data: dto }))
}

fn booking_conflict(conflicts: Vec<Uuid>) -> ApiError {
    let ids: Vec<String> = conflicts.iter().map(|c| c.to_string()).collect();
    ApiError::Conflict(
        "BOOKING_CONFLICT",
        format!("room is not available; conflicting bookings: {}", ids.join(", ")),
    )
}

/* ============================================================
   GET /bookings/day
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct DayQuery {
    // YYYY-MM-DD, interpreted as a UTC day
    pub date: String,
    pub room_id: Option<Uuid>,
    pub provider_user_id: Option<Uuid>,
}

pub async fn list_bookings_day(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DayQuery>,
) -> Result<Json<ApiOk<Vec<BookingDto>>>, ApiError> {
    let date = NaiveDate::parse_from_str(q.date.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::validation("date must be YYYY-MM-DD"))?;

    let day_start =
        DateTime::<Utc>::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).unwrap(), Utc);
    let day_end = day_start + chrono::Duration::days(1);

    // Staff see everything; a provider is pinned to their own schedule and a
    // patient to their own bookings regardless of the query params.
    let (provider_filter, patient_filter) = match auth.role {
        _ if auth.role.is_staff_admin() => (q.provider_user_id, None),
        Role::Doctor | Role::Nurse => (Some(auth.user_id), None),
        _ => (None, Some(auth.user_id)),
    };

    let rows = sqlx::query(
        r#"
        SELECT b.booking_id
        FROM booking b
        WHERE b.start_at >= $1
          AND b.start_at <  $2
          AND ($3::uuid IS NULL OR b.room_id = $3)
          AND ($4::uuid IS NULL OR b.provider_user_id = $4)
          AND ($5::uuid IS NULL OR b.patient_user_id = $5)
        ORDER BY b.start_at ASC
        "#,
    )
    .bind(day_start)
    .bind(day_end)
    .bind(q.room_id)
    .bind(provider_filter)
    .bind(patient_filter)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        let booking_id: Uuid = r.try_get("booking_id").map_err(ApiError::row)?;
        out.push(fetch_booking_with_joins(&state, booking_id).await?);
    }

    Ok(Json(ApiOk { data: out }))
}

/* ============================================================
   GET /bookings/{id}
   ============================================================ */

pub async fn get_booking(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<ApiOk<BookingDto>>, ApiError> {
    let dto = ensure_can_view_booking(&state, &auth, booking_id).await?;
    Ok(Json(ApiOk { data: dto }))
}

/* ============================================================
   Status transitions
   ============================================================ */

pub async fn cancel_booking(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<ApiOk<BookingDto>>, ApiError> {
    // cancel: staff, the provider, or the patient themselves
    let dto = ensure_can_view_booking(&state, &auth, booking_id).await?;

    if dto.status != BOOKING_STATUS_SCHEDULED {
        return Err(ApiError::BadRequest(
            "BOOKING_NOT_SCHEDULED",
            "only scheduled bookings can be cancelled".into(),
        ));
    }

    sqlx::query(
        r#"
        UPDATE booking
        SET status = $2,
            cancelled_at = COALESCE(cancelled_at, now()),
            updated_at = now(),
            updated_by_user_id = $3
        WHERE booking_id = $1
          AND status = $4
        "#,
    )
    .bind(booking_id)
    .bind(BOOKING_STATUS_CANCELLED)
    .bind(auth.user_id)
    .bind(BOOKING_STATUS_SCHEDULED)
    .execute(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("BOOKING_CANCEL_FAILED", format!("{e}")))?;

    let dto = fetch_booking_with_joins(&state, booking_id).await?;
    Ok(Json(ApiOk { data: dto }))
}

pub async fn complete_booking(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<ApiOk<BookingDto>>, ApiError> {
    // complete: staff or the provider; patients cannot complete
    let dto = ensure_can_view_booking(&state, &auth, booking_id).await?;

    if !auth.role.is_staff_admin() && dto.provider.user_id != auth.user_id {
        return Err(ApiError::forbidden("only the provider or staff can complete a booking"));
    }
    if dto.status != BOOKING_STATUS_SCHEDULED {
        return Err(ApiError::BadRequest(
            "BOOKING_NOT_SCHEDULED",
            "only scheduled bookings can be completed".into(),
        ));
    }

    sqlx::query(
        r#"
        UPDATE booking
        SET status = $2,
            updated_at = now(),
            updated_by_user_id = $3
        WHERE booking_id = $1
          AND status = $4
        "#,
    )
    .bind(booking_id)
    .bind(BOOKING_STATUS_COMPLETED)
    .bind(auth.user_id)
    .bind(BOOKING_STATUS_SCHEDULED)
    .execute(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("BOOKING_COMPLETE_FAILED", format!("{e}")))?;

    let dto = fetch_booking_with_joins(&state, booking_id).await?;
    Ok(Json(ApiOk { data: dto }))
}
