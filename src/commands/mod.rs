// SPDX-License-Identifier: GPL-2.0-or-later

pub mod images;
pub mod ps;
pub mod run;
pub mod ssh;
pub mod start;
pub mod up;

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::Result;
use crate::instance::runner::Runner;

/// SIGINT is caught once at the session root; loops observe the flag and
/// unwind into cleanup.
pub fn register_interrupt() -> io::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag.clone())?;
    Ok(flag)
}

/// Run a session to completion and always tear it down, whatever the exit
/// path was.
pub fn execute_session(mut runner: Runner) -> Result<()> {
    let result = runner.run_session();
    runner.shutdown_and_cleanup();
    result
}
