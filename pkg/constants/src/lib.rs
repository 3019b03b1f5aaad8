//! Centralized constants for the edge router.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod cluster;
pub mod idle;
pub mod network;
pub mod paths;
pub mod state;
pub mod tls;
