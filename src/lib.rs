//! Embeddable realtime chat core.
//!
//! The crate keeps a local, always-renderable view of conversations and
//! message threads, reconciled against a REST API and a WebSocket event
//! stream. Sends are optimistic and survive offline periods through a
//! persisted outbound queue. The host application supplies identity and
//! user-facing notifications through the [`IdentityProvider`] and
//! [`Notifier`] seams and drives everything through [`Nabo`].

use once_cell::sync::OnceCell;
use std::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

pub mod error;
pub mod identity;
pub mod nabo;
pub mod notifier;
pub mod transport;
pub mod types;

pub use error::{NaboError, Result};
pub use identity::{IdentityProvider, StaticIdentity};
pub use nabo::conversation::{Conversation, ConversationKind, PeerInfo};
pub use nabo::message::{
    Attachment, DeliveryStatus, ForwardInfo, Message, MessageKind, ReactionSummary, ReplySnapshot,
};
pub use nabo::presence::TypingEntry;
pub use nabo::streams::{ThreadUpdate, UpdateTrigger};
pub use nabo::{Nabo, NaboConfig};
pub use notifier::{LogNotifier, NoticeLevel, Notifier};
pub use transport::{ChatEvent, ConversationSettings, DeleteScope, MessageDraft, PageQuery};

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub(crate) fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("nabo")
            .filename_suffix("log")
            .build(logs_dir)
            .expect("Failed to create file appender");

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .init();
    });
}
