//! Command dispatch: link lifecycle, single in-flight command, correlation.

mod command;
mod dispatcher;

pub use command::{goodbye_notice, link_sync, CommandRequest, ReplyMatch};
pub use dispatcher::{
    spawn_dispatcher, ChunkAckMode, DispatcherConfig, DispatcherHandle, LinkState,
};
