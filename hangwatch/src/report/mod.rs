//! Report output: events, sinks, deferred batches and text formatting.

pub mod batch;
pub mod format;
pub mod sink;

pub use batch::DeferredBatch;
pub use format::{format_elapsed_minutes, format_elapsed_seconds, format_stack, full_thread_dump};
pub use sink::{
    FanoutSink, LogSink, MemorySink, RenderedReport, ReportBody, ReportEvent, ReportKind,
    ReportSink,
};
