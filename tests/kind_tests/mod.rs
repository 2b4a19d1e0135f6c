//! Integration tests for the Gramola operator
//!
//! These tests run reconcile passes against a real API server and tell the
//! story of an AppService from creation to a converged topology.
//!
//! - `app_service_lifecycle`: initialization, convergence and failure
//!   reporting for a single AppService
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod app_service_lifecycle;
mod helpers;
