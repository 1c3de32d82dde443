/// Push channel: relay connection delivering message notifications
pub mod channel;
pub mod protocol;

pub use channel::{ChannelEvent, ChannelState, EventStream, PushChannel, Subscription};
pub use protocol::{Frame, PushMessage, PROTOCOL_VERSION};
