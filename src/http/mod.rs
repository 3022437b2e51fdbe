//! HTTP layer: the smart-HTTP front door.
//!
//! Requests are classified, canonicalized and either served from the local
//! mirror (ref discovery, upload-pack) or relayed to the origin (push).

pub mod handler;
mod passthrough;
pub mod pktline;
pub mod request;
mod reporting;
mod serve;


pub use handler::create_router;
