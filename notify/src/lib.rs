//! gantry-notify: webhook notifications pumped from the game's frame tick.
//!
//! Senders build multipart requests and drop them on a [`TransferQueue`];
//! a [`GameloopPump`] hook advances the queue once per tick so nothing
//! here ever blocks the game thread.

pub mod discord;
pub mod encoding;
pub mod gameloop;
pub mod multipart;
pub mod telegram;
pub mod transfer;

pub use discord::DiscordSender;
pub use encoding::win1251_to_utf8;
pub use gameloop::{DEFAULT_GAMELOOP_SITE, GameloopPump};
pub use multipart::Multipart;
pub use telegram::{FileType, ParseMode, TelegramSender};
pub use transfer::TransferQueue;
