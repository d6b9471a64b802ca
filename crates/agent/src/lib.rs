//! TRACE agent: configuration and HTTP API around the tower engine

pub mod api;
pub mod config;
