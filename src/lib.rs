//! suitecheck library
//!
//! Two verification paths over external processes:
//! - the suite runner (`scheduler` + `supervisor`): declared commands run in
//!   order, each bounded by a timeout, with abort on critical failure
//! - the protocol probe (`probe`): a JSON-RPC-over-stdio client that checks
//!   a server's initialize / list / call lifecycle
//!
//! The binary entry point is in main.rs.

pub mod client;
pub mod config;
pub mod error;
pub mod junit;
pub mod lifecycle;
pub mod logging;
pub mod precondition;
pub mod probe;
pub mod protocol;
pub mod reporter;
pub mod scheduler;
pub mod signals;
pub mod suite;
pub mod supervisor;
