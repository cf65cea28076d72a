//! CLI command handlers.

mod add;
mod context;
mod inspect;
mod manage;
mod progress;
mod run;

pub use add::run_add_command;
pub use context::AppContext;
pub use inspect::{run_list_command, run_show_command};
pub use manage::{run_action_command, run_destroy_command, run_sweep_command};
pub use run::run_download_command;
