// src/routes/user_routes.rs

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::hash_password,
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    policy::Role,
};

fn ensure_staff_admin(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role.is_staff_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("Only admin/office_manager can manage users"))
    }
}

fn validate_role(roles: i16) -> Result<(), ApiError> {
    Role::from_i16(roles)
        .map(|_| ())
        .ok_or_else(|| ApiError::validation("roles must be 0..5"))
}

fn validate_username(username: &str) -> Result<(), ApiError> {
    let u = username.trim();
    if u.len() < 3 {
        return Err(ApiError::validation("username must be at least 3 characters"));
    }
    if u.len() > 64 {
        return Err(ApiError::validation("username is too long (max 64)"));
    }
    Ok(())
}

fn validate_display_name(display_name: &str) -> Result<(), ApiError> {
    let d = display_name.trim();
    if d.is_empty() {
        return Err(ApiError::validation("display_name is required"));
    }
    if d.len() > 128 {
        return Err(ApiError::validation("display_name is too long (max 128)"));
    }
    Ok(())
}

fn validate_password(pw: &str) -> Result<(), ApiError> {
    if pw.len() < 8 {
        return Err(ApiError::validation("password must be at least 8 characters"));
    }
    Ok(())
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct UserPublicRow {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub roles: i16,
    pub is_active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub display_name: String,
    pub password: String,
    pub roles: i16,              // 0..5
    pub is_active: Option<bool>, // default true
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub display_name: Option<String>,
    pub roles: Option<i16>,
    pub is_active: Option<bool>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_users).post(create_user))
        .route("/{user_id}", get(get_user).patch(update_user))
}

pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<UserPublicRow>>>, ApiError> {
    ensure_staff_admin(&auth)?;

    let users = sqlx::query_as::<_, UserPublicRow>(
        r#"
        SELECT user_id, username, display_name, roles, is_active, created_at
        FROM care_user
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: users }))
}

pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    ensure_staff_admin(&auth)?;

    let user = sqlx::query_as::<_, UserPublicRow>(
        r#"
        SELECT user_id, username, display_name, roles, is_active, created_at
        FROM care_user
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("user"))?;

    Ok(Json(ApiOk { data: user }))
}

pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    ensure_staff_admin(&auth)?;

    validate_username(&req.username)?;
    validate_display_name(&req.display_name)?;
    validate_password(&req.password)?;
    validate_role(req.roles)?;

    let password_hash = hash_password(&req.password)
        .map_err(|e| ApiError::Internal(format!("password hash error: {e}")))?;

    let user = sqlx::query_as::<_, UserPublicRow>(
        r#"
        INSERT INTO care_user (username, display_name, password_hash, roles, is_active)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING user_id, username, display_name, roles, is_active, created_at
        "#,
    )
    .bind(req.username.trim())
    .bind(req.display_name.trim())
    .bind(&password_hash)
    .bind(req.roles)
    .bind(req.is_active.unwrap_or(true))
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("USER_CREATE_FAILED", format!("{e}")))?;

    Ok(Json(ApiOk { data: user }))
}

pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    ensure_staff_admin(&auth)?;

    if let Some(d) = &req.display_name {
        validate_display_name(d)?;
    }
    if let Some(r) = req.roles {
        validate_role(r)?;
    }

    let user = sqlx::query_as::<_, UserPublicRow>(
        r#"
        UPDATE care_user
        SET
          display_name = COALESCE($2, display_name),
          roles        = COALESCE($3, roles),
          is_active    = COALESCE($4, is_active),
          updated_at   = now()
        WHERE user_id = $1
        RETURNING user_id, username, display_name, roles, is_active, created_at
        "#,
    )
    .bind(user_id)
    .bind(req.display_name.as_deref().map(str::trim))
    .bind(req.roles)
    .bind(req.is_active)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("USER_UPDATE_FAILED", format!("{e}")))?
    .ok_or_else(|| ApiError::not_found("user"))?;

    Ok(Json(ApiOk { data: user }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_role_bounds() {
        assert!(validate_role(0).is_ok());
        assert!(validate_role(3).is_ok());
        assert!(validate_role(5).is_ok());

        assert!(validate_role(-1).is_err());
        assert!(validate_role(6).is_err());
        assert!(validate_role(100).is_err());
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("al").is_err()); // Too short
        assert!(validate_username("").is_err());
        assert!(validate_username("  ").is_err()); // Only whitespace
    }

    #[test]
    fn test_validate_display_name() {
        assert!(validate_display_name("Alice A.").is_ok());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(200)).is_err());
    }

    #[test]
    fn test_validate_password() {
        assert!(validate_password("password123").is_ok());
        assert!(validate_password("short").is_err()); // Too short
        assert!(validate_password("").is_err());
    }
}
