//! Client orchestration for the publisher.
//!
//! [`StreamClient`] picks the publish session from the URL scheme, fans each
//! access unit out to that session and to the [`RecordController`], and
//! exposes the caller-driven retry and metrics surface.

mod error;
mod metrics;
mod orchestrator;
mod record;

pub use error::{ClientError, ClientResult, RecordError, RecordResult};
pub use metrics::{check_warnings, ClientMetrics, MetricsCollector, MetricsWarning};
pub use orchestrator::{Protocol, StreamClient};
pub use record::{FlvMuxer, Muxer, RecordContainer, RecordController, RecordTarget, TsFileMuxer};

use crossbeam_channel::Receiver;
use publisher_ipc::{ConnectEvent, EventEmitter, PublishConfig, RecordEvent};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global `fmt` subscriber filtered by `RUST_LOG`.
///
/// Does nothing if a subscriber is already installed.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "publisher_engine=debug,publisher_transport=debug,publisher_media=info,publisher_ipc=info"
                .into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Create a stream client with bounded event channels.
pub fn create_client(
    config: PublishConfig,
) -> (StreamClient, Receiver<ConnectEvent>, Receiver<RecordEvent>) {
    let (event_tx, event_rx) = publisher_ipc::event_channel();
    let (record_tx, record_rx) = publisher_ipc::record_event_channel();
    let client = StreamClient::new(
        config,
        EventEmitter::new(event_tx),
        EventEmitter::new(record_tx),
    );
    (client, event_rx, record_rx)
}
