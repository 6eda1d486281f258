//! image-updater daemon: poll scheduler, webhook intake, config watcher and
//! the local control socket, all driving one shared reconciliation engine.

mod error;
pub mod intake;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod scheduler;
mod watcher;

pub use error::DaemonError;
pub use intake::{dispatch, Dispatched, Notification};
pub use protocol::{
    request_history, request_reconcile, request_status, request_stop, request_webhook,
    send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, run, serve, start_blocking};
pub use scheduler::Scheduler;
