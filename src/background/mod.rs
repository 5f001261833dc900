//! Background (detached) execution: the worker process, its durable
//! file protocol, and the in-process job registry.

mod input;
mod registry;
mod status_file;
mod worker;

pub use input::{WorkerInput, WorkerStep};
pub use registry::{BackgroundRegistry, SubagentEvent, TrackedJob};
pub use status_file::{
    append_event, markdown_log_path, read_events, read_result, read_status, status_path,
    step_log_path, write_result, write_status, RunEvent, EVENTS_FILE, STATUS_FILE,
};
pub use worker::{run as run_worker_input, run_worker};
