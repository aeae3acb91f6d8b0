//! Core modules for marshal's control plane.
//!
//! Shared primitives (errors, config, storage, clock) and the
//! [`plane::ControlPlane`] facade that composes the plugins.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod plane;
pub mod schemas;
pub mod store;
pub mod time;
