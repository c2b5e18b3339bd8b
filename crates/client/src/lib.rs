//! Thin HTTP client for a facade server, plus the wire types both sides
//! share. A client-side coordinator uses this to run its per-datastore
//! operations (read, prepare, commit, abort) inside the server process
//! that owns the backend connections.

mod client;
mod messages;

pub use client::FacadeClient;
pub use messages::{
    AbortRequest, CommitRequest, PlainResponse, PrepareRequest, PrepareResponse, ReadRequest,
    ReadResponse, STATUS_ERROR, STATUS_OK,
};
