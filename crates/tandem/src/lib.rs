//! Tandem Backend Library
//!
//! This library provides the core components for the Task & Agent
//! Collaboration Platform backend: the per-session event stream (durable
//! log + live fan-out), presence tracking, and the HTTP API around them.

pub mod api;
pub mod db;
pub mod presence;
pub mod session;
pub mod stream;
