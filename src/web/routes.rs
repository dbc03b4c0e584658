use axum::{
    routing::{any, get, patch, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let camera_routes = Router::new()
        .route(
            "/cameras",
            get(handlers::cameras::list_cameras).post(handlers::cameras::create_camera),
        )
        .route("/cameras/:id", get(handlers::cameras::get_camera))
        .route(
            "/cameras/:id/settings",
            get(handlers::cameras::get_settings).put(handlers::cameras::put_setting),
        )
        .route("/cameras/:id/motion", post(handlers::cameras::motion_detected))
        .route("/cameras/:id/button", post(handlers::cameras::button_pressed));

    let stream_routes = Router::new()
        .route(
            "/cameras/:id/stream",
            post(handlers::stream::stream_start).delete(handlers::stream::stream_stop),
        )
        .route("/cameras/:id/stream/options", get(handlers::stream::stream_options))
        .route("/cameras/:id/stream/status", get(handlers::stream::stream_status));

    let config_routes = Router::new()
        .route("/config", get(handlers::config::get_all_config))
        .route("/config/stream", patch(handlers::config::update_stream_config))
        .route("/config/sensors", patch(handlers::config::update_sensor_config));

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", any(ws_handler))
        .merge(camera_routes)
        .merge(stream_routes)
        .merge(config_routes);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
