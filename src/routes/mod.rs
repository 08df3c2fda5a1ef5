use axum::{routing::get, Router};

use crate::state::AppState;

pub mod attendance;
pub mod channels;
pub mod chat;
pub mod expenses;
pub mod health;
pub mod identity;
pub mod organizations;
pub mod payments;
pub mod pricing;
pub mod reservations;
pub mod sync;
pub mod templates;
pub mod tours;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/me", get(identity::me))
        .merge(organizations::router())
        .merge(tours::router())
        .merge(channels::router())
        .merge(reservations::router())
        .merge(pricing::router())
        .merge(expenses::router())
        .merge(payments::router())
        .merge(chat::router())
        .merge(templates::router())
        .merge(attendance::router())
        .merge(sync::router())
}
