//! Core crate for the pdf2word conversion server.

pub mod batch;
pub mod bundle;
pub mod config;
pub mod converter;
pub mod environment;
pub mod error;
pub mod job;
pub mod logging;
pub mod runtime;
pub mod server;
pub mod upload;
pub mod workspace;
