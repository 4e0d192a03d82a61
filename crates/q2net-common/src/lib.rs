#![allow(clippy::too_many_arguments, clippy::collapsible_if, clippy::collapsible_else_if,
         clippy::field_reassign_with_default, clippy::manual_range_contains,
         clippy::comparison_chain, clippy::identity_op, clippy::float_cmp,
         clippy::needless_range_loop, clippy::new_without_default, clippy::len_without_is_empty)]

// Shared protocol layer: buffers, channel, codecs, movement, transports

pub mod q_shared;
pub mod qcommon;
pub mod error;
pub mod cmd;
pub mod cvar;
pub mod common;
pub mod delta;
pub mod net_chan;
pub mod pmove;
pub mod cmodel;
pub mod net;
pub mod net_queue;
