/// User-visible, non-blocking notifications (the "toast" line of the UI)
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
    pub timestamp: String,
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn info(&self, text: impl Into<String>) {
        let text = text.into();
        info!("notice: {}", text);
        self.emit(NoticeLevel::Info, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        let text = text.into();
        warn!("error notice: {}", text);
        self.emit(NoticeLevel::Error, text);
    }

    fn emit(&self, level: NoticeLevel, text: String) {
        // Nobody listening is fine
        let _ = self.tx.send(Notice {
            level,
            text,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
