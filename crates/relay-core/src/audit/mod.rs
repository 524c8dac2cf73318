//! Output capture: which commands to transcribe, how to decode them, where lines go.

pub mod decoder;
pub mod policy;
pub mod sink;
pub mod tap;

pub use decoder::{AuditLine, DecodeIssue, LineDecoder};
pub use policy::{Classification, CommandPolicy, PrefixPolicy};
pub use sink::{AUDIT_TARGET, AuditRecord, AuditSink, FanoutAuditSink, JsonLinesAuditSink, MemoryAuditSink, TracingAuditSink};
pub use tap::{AuditSwitch, AuditTee};
