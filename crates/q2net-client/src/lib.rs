#![allow(clippy::too_many_arguments, clippy::collapsible_if, clippy::collapsible_else_if,
         clippy::field_reassign_with_default, clippy::manual_range_contains,
         clippy::comparison_chain, clippy::needless_range_loop, clippy::new_without_default)]

// Client side of the protocol: handshake, level download, frames, prediction
pub mod client;
pub mod cl_main;
pub mod cl_ents;
pub mod cl_input;
pub mod cl_pred;
pub mod cl_parse;

pub use cl_main::Client;
pub use client::{ClientEvent, ConnState};
