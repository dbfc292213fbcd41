//! Background consumers for one-way events.

mod audit_log;

pub use audit_log::{AuditLogSink, AuditLogWorker, TracingAuditSink};
