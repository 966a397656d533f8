//! PuzzleBounty Backend Library
//!
//! Exposes the settlement core and its event store for the server binary
//! and integration tests.

pub mod api;
pub mod middleware;
pub mod models;
pub mod settlement;
pub mod store;
