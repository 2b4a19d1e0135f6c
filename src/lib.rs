//! Gramola operator - converges the Gramola application from an AppService
//!
//! An `AppService` (`gramola.redhat.com/v1alpha1`) declares one instance of
//! the Gramola application. The controller keeps three service groups in
//! place for it (events database and backend, gateway, frontend), runs the
//! events database migration once a replica is ready, and reports progress
//! in the AppService status with exponential backoff on failure.
//!
//! # Modules
//!
//! - [`crd`] - The AppService Custom Resource Definition
//! - [`controller`] - Reconcile state machine and watch triggers
//! - [`template`] - Desired-state generators for managed objects
//! - [`topology`] - Service groups and managed-resource identity
//! - [`converge`] - Create-or-patch convergence of one managed object
//! - [`migration`] - One-time database migration through pod exec
//! - [`status`] - Status recording and retry backoff
//! - [`events`] - Kubernetes Event publishing
//! - [`config`] - Flags and environment
//! - [`telemetry`] - Tracing subscriber setup
//! - [`kube_utils`] - Kubernetes client construction
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod converge;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod migration;
pub mod status;
pub mod telemetry;
pub mod template;
pub mod topology;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager and process name
pub const OPERATOR_NAME: &str = "gramola-operator";

/// Reporting controller name on Kubernetes Events
pub const CONTROLLER_NAME: &str = "controller-appservice";
