//! Bidirectional relay between an inbound client channel and an outbound backend channel.

pub mod control;
pub mod pump;
pub mod request;
pub mod session;
pub mod teardown;

pub use control::{BackendControl, BackendEvent, ClientControl, QueuedRequest};
pub use pump::{ByteSink, ByteSource, SourceEnd, WriterSink};
pub use request::{ChannelRequest, DecodedRequest};
pub use session::{AuditContext, BackendEndpoints, ClientEndpoints, RelayHandle, RelaySession, SessionSettings, SessionSummary};
pub use teardown::Teardown;
