//! Delivery channels and the machinery that runs them.

pub mod bridge;
pub mod channel;
pub mod discord;
pub mod email;
pub mod factory;
pub mod lifecycle;
pub mod monitor;
pub mod orchestrator;
pub mod retry;
pub mod telegram;

pub use channel::*;
pub use discord::DiscordChannel;
pub use email::EmailChannel;
pub use factory::ChannelFactory;
pub use monitor::{ChannelHealthReport, ChannelMonitor};
pub use orchestrator::ChannelOrchestrator;
pub use retry::{QueuedMessage, RetryManager};
pub use telegram::TelegramChannel;
