//! Terminal output
//!
//! Spinners and progress bars in an interactive terminal, plain prefixed
//! lines in CI or when output is piped. Logging goes through `tracing`;
//! this module is only for the command's own report.

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    intro, key_value, outro_error, outro_success, remark, step_info, step_ok_detail,
    step_warn,
};
pub use progress::{BuildProgress, TaskSpinner};
