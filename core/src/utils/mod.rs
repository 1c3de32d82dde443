pub mod notifier;

pub use notifier::{Notice, NoticeLevel, Notifier};
