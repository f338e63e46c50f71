//! HTTP surface: the EPCIS 2.0 REST routes, the 1.2 SOAP endpoint, HTTP
//! Basic identity, and error-to-status mapping.

pub mod auth;
pub mod errors;
pub mod rest;
pub mod router;
pub mod soap_endpoint;

pub use router::{router, Api, AppState};
