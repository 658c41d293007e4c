//! Specchio mirrors third-party pages as self-contained snapshots.
//!
//! A client-facing relay maps cookie-bound client sessions onto renderer
//! sessions; the renderer drives a headless browser engine, captures the
//! stylesheets and images each navigation produces, and folds them back
//! into one document the client can display without further network
//! access — and without ever running upstream script or learning the
//! upstream origin.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
