//! Syncular sync daemon: HTTP/WS transport over the sync core.
//!
//! `state::build_state` is the single wiring point; `routes::build_router`
//! produces the bare router so the scenario tests in `tests/` can drive it
//! in-process without a socket.

pub mod auth;
pub mod console;
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod ws;
