mod channel;
mod tracker;

pub use tracker::{ChannelState, ConnectionStatus};

pub(crate) use channel::{run_channel, ChannelContext};
pub(crate) use tracker::{watchdog, ConnectionTracker};
