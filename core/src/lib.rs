/// ProConnect messaging core
///
/// Client side of the real-time conversation view: a key-addressed cache of
/// server responses, a push channel for "message received" notifications and
/// the reconciler that keeps both consistent across sends, deletes and
/// reconnects.

pub mod backend;
pub mod cache;
pub mod cli_app;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod push;
pub mod reconciler;
pub mod session;
pub mod utils;
pub mod view;

pub use client::Client;
pub use config::Config;
pub use error::{ClientError, Result};
pub use view::{Composer, ConversationView, ViewState};
