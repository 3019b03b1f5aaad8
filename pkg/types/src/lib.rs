pub mod config;
pub mod deployment;
pub mod ingress;
pub mod service;
pub mod target;
