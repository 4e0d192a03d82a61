#![allow(clippy::too_many_arguments, clippy::collapsible_if, clippy::collapsible_else_if,
         clippy::field_reassign_with_default, clippy::manual_range_contains,
         clippy::comparison_chain, clippy::needless_range_loop, clippy::new_without_default)]

// Server side of the protocol: connection handling, frames, client moves
pub mod server;
pub mod sv_ccmds;
pub mod sv_ents;
pub mod sv_init;
pub mod sv_main;
pub mod sv_send;
pub mod sv_user;

pub use server::{ClientState, ServerContext, ServerState};
pub use sv_ccmds::sv_execute_command;
pub use sv_init::{sv_map, sv_spawn_server};
pub use sv_main::{sv_frame, sv_shutdown, sv_time_to_next_frame};
