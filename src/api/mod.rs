//! HTTP API Module
//!
//! Provides a REST API for node status and operation submission.

mod http;

pub use http::{HttpServer, LogResponse, PeersResponse, StatusResponse, SubmitResponse};
