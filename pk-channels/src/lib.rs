//! Chat transport adapters for Prikolist.
//!
//! Adapters are pure I/O: they convert platform updates to/from
//! `InboundMessage` / `OutboundMessage`.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    ChatId, InboundMessage, InboundMessageKind, MessageId, OutboundMessage, SenderId,
};
