//! HTTP layer: the axum server that fronts the mirrors.

pub mod handler;
