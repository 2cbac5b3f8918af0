//! CLI command implementations.
//!
//! | Module    | Commands handled                                |
//! |-----------|-------------------------------------------------|
//! | `run`     | `Run`, `Resume`, `Cancel`, `Runs`, `Steps`      |
//! | `git`     | `Git`                                           |
//! | `preview` | `Preview`, `Ports`                              |

pub mod git;
pub mod preview;
pub mod run;

pub use git::cmd_git;
pub use preview::{cmd_ports, cmd_preview, parse_slot};
pub use run::{cmd_cancel, cmd_resume, cmd_run, cmd_runs, cmd_steps};

use anyhow::Result;
use serde::Serialize;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
