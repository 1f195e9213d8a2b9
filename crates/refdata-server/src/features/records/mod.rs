//! Records feature module
//!
//! Read-only access to ingested LEI records and their audit trail.

pub mod routes;


pub use routes::records_routes;
