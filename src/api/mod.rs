//! Thin HTTP front door (§6.1's out-of-scope collaborator, implemented here
//! only far enough to demonstrate the contract the core expects of it).
//!
//! Grounded in the teacher's `api::serve`/`AppState` pattern (`api/routes.rs`,
//! `api/proxy.rs`): a single `axum::Router` built from a shared `AppState`,
//! one module per route group.

mod routes;

pub use routes::{serve, AppState};
