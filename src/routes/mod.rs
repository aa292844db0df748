use crate::models::AppState;
use axum::Router;

pub mod ad_routes;
pub mod auth_routes;
pub mod booking_routes;
pub mod connection_routes;
pub mod room_routes;
pub mod user_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/auth", auth_routes::router())
        .nest("/api/v1/users", user_routes::router())
        .nest("/api/v1", room_routes::router())
        .nest("/api/v1", booking_routes::router())
        .nest("/api/v1", connection_routes::router())
        .nest("/api/v1", ad_routes::router())
        .with_state(state)
}
