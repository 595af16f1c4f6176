//! Transport layer: dialing and connection pooling.
//!
//! - [`pool`]: per-route and global connection ceilings over pooled
//!   request handles
//! - [`connectjob`]: DNS → TCP → proxy tunnel → TLS dialing flow

pub mod connectjob;
pub mod pool;

pub use connectjob::{ConnectJob, NetSocket};
pub use pool::{ConnectionPool, Permit, RouteKey};
