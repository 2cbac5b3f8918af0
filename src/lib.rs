//! Durable workflow step orchestration.
//!
//! A workflow is a list of phases, each a list of steps. Steps reconcile a
//! git working tree, manage preview containers on allocated ports, or record
//! artifacts. Every step result is persisted so a resumed run replays what
//! already succeeded.

pub mod config;
pub mod container;
pub mod db;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod git;
pub mod logging;
pub mod models;
pub mod naming;
pub mod ports;
pub mod process;
pub mod steps;
pub mod tasks;
pub mod timeout;
