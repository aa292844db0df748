// src/routes/room_routes.rs

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
    models::{ApiOk, AppState},
    scheduling::{self, BookingSlot, TimeWindow},
};

fn ensure_staff_admin(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role.is_staff_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("Only admin/office_manager can manage rooms"))
    }
}

fn validate_room_name(name: &str) -> Result<(), ApiError> {
    let n = name.trim();
    if n.is_empty() {
        return Err(ApiError::validation("room_name is required"));
    }
    if n.len() > 128 {
        return Err(ApiError::validation("room_name is too long (max 128)"));
    }
    Ok(())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", get(list_rooms))
        .route("/rooms", post(create_room))
        .route("/rooms/{room_id}", patch(update_room))
        .route("/rooms/{room_id}/availability", get(check_room_availability))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct RoomRow {
    pub room_id: Uuid,
    pub room_name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListRoomsQuery {
    pub include_inactive: Option<bool>,
}

pub async fn list_rooms(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<ListRoomsQuery>,
) -> Result<Json<ApiOk<Vec<RoomRow>>>, ApiError> {
    let rooms = sqlx::query_as::<_, RoomRow>(
        r#"
        SELECT room_id, room_name, is_active, created_at
        FROM room
        WHERE is_active = true OR $1
        ORDER BY room_name ASC
        "#,
    )
    .bind(q.include_inactive.unwrap_or(false))
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rooms }))
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub room_name: String,
}

pub async fn create_room(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<ApiOk<RoomRow>>, ApiError> {
    ensure_staff_admin(&auth)?;
    validate_room_name(&req.room_name)?;

    let room = sqlx::query_as::<_, RoomRow>(
        r#"
        INSERT INTO room (room_name)
        VALUES ($1)
        RETURNING room_id, room_name, is_active, created_at
        "#,
    )
    .bind(req.room_name.trim())
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("ROOM_CREATE_FAILED", format!("{e}")))?;

    Ok(Json(ApiOk { data: room }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoomRequest {
    pub room_name: Option<String>,
    // Rooms are never hard-deleted; historical bookings keep referencing them.
    pub is_active: Option<bool>,
}

pub async fn update_room(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(room_id): Path<Uuid>,
    Json(req): Json<UpdateRoomRequest>,
) -> Result<Json<ApiOk<RoomRow>>, ApiError> {
    ensure_staff_admin(&auth)?;
    if let Some(n) = &req.room_name {
        validate_room_name(n)?;
    }

    let room = sqlx::query_as::<_, RoomRow>(
        r#"
        UPDATE room
        SET
          room_name = COALESCE($2, room_name),
          is_active = COALESCE($3, is_active),
          updated_at = now()
        WHERE room_id = $1
        RETURNING room_id, room_name, is_active, created_at
        "#,
    )
    .bind(room_id)
    .bind(req.room_name.as_deref().map(str::trim))
    .bind(req.is_active)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("ROOM_UPDATE_FAILED", format!("{e}")))?
    .ok_or_else(|| ApiError::not_found("room"))?;

    Ok(Json(ApiOk { data: room }))
}

/* ============================================================
   GET /rooms/{id}/availability
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub start: DateTime<Utc>,
    pub duration_min: i64,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityDto {
    pub available: bool,
    pub conflicts: Vec<Uuid>,
}

/// Bookings for a room whose windows touch the candidate window, as input
/// to the pure checker. Cancelled rows are filtered by the checker itself.
pub async fn load_room_slots(
    state: &AppState,
    room_id: Uuid,
    around: TimeWindow,
) -> Result<Vec<BookingSlot>, ApiError> {
    #[derive(sqlx::FromRow)]
    struct SlotRow {
        booking_id: Uuid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        status: i16,
    }

    let rows = sqlx::query_as::<_, SlotRow>(
        r#"
        SELECT booking_id, start_at, end_at, status
        FROM booking
        WHERE room_id = $1
          AND start_at < $3
          AND end_at > $2
        ORDER BY start_at ASC
        "#,
    )
    .bind(room_id)
    .bind(around.start)
    .bind(around.end)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let mut slots = Vec::with_capacity(rows.len());
    for r in rows {
        let window = TimeWindow::from_bounds(r.start_at, r.end_at)
            .map_err(|e| ApiError::Internal(format!("stored booking window invalid: {e}")))?;
        slots.push(BookingSlot {
            booking_id: r.booking_id,
            window,
            status: r.status,
        });
    }
    Ok(slots)
}

pub async fn room_exists_and_active(state: &AppState, room_id: Uuid) -> Result<bool, ApiError> {
    let active: Option<bool> = sqlx::query_scalar(
        r#"
        SELECT is_active
        FROM room
        WHERE room_id = $1
        "#,
    )
    .bind(room_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    match active {
        Some(a) => Ok(a),
        None => Err(ApiError::not_found("room")),
    }
}

pub async fn check_room_availability(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(room_id): Path<Uuid>,
    Query(q): Query<AvailabilityQuery>,
) -> Result<Json<ApiOk<AvailabilityDto>>, ApiError> {
    let candidate = TimeWindow::from_start_and_minutes(q.start, q.duration_min)
        .map_err(|e| ApiError::validation(&e.to_string()))?;

    if !room_exists_and_active(&state, room_id).await? {
        return Err(ApiError::BadRequest(
            "ROOM_INACTIVE",
            "room is deactivated".into(),
        ));
    }

    let slots = load_room_slots(&state, room_id, candidate).await?;
    let result = scheduling::check_availability(candidate, &slots);

    Ok(Json(ApiOk {
        data: AvailabilityDto {
            available: result.available,
            conflicts: result.conflicts,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_room_name() {
        assert!(validate_room_name("Exam Room 1").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("   ").is_err());
        assert!(validate_room_name(&"r".repeat(200)).is_err());
    }
}
