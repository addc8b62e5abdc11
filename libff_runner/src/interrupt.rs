//! Interrupt handling for a running pipeline
//!
//! An interrupted run can leave binned data behind in the shared-memory scratch area,
//! which outlives the process. The handler installed here clears the scratch before the
//! process terminates.
//!
//! # Platform Support
//! - Unix: SIGINT via signal-hook, handled on a dedicated thread
//! - Other platforms: Ctrl-C via the ctrlc crate
use std::sync::atomic::{AtomicBool, Ordering};

use super::scratch::SharedScratch;

static INTERRUPT_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Exit status used when the run is stopped by Ctrl-C
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Install a handler that clears `scratch` when the run is interrupted.
///
/// Only the first call installs anything. After cleanup the process terminates the way it
/// would have without a handler.
pub fn install_interrupt_handler(scratch: SharedScratch) -> std::io::Result<()> {
    if INTERRUPT_HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        log::warn!("Interrupt handler already installed, skipping");
        return Ok(());
    }

    #[cfg(unix)]
    {
        install_unix_handler(scratch)?;
    }

    #[cfg(not(unix))]
    {
        install_ctrlc_handler(scratch)?;
    }

    Ok(())
}

/// Cleanup performed on interrupt. Returns the number of scratch files removed.
pub fn clean_up_after_interrupt(scratch: &SharedScratch) -> usize {
    println!("Ctrl-C was pressed, cleaning up.");
    match scratch.clear() {
        Ok(n) => {
            log::info!("Cleared {n} scratch file(s) from {}", scratch.dir().display());
            n
        }
        Err(e) => {
            log::error!("Could not clear scratch after interrupt: {e}");
            0
        }
    }
}

#[cfg(unix)]
fn install_unix_handler(scratch: SharedScratch) -> std::io::Result<()> {
    use signal_hook::consts::signal::SIGINT;
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT])?;
    std::thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                clean_up_after_interrupt(&scratch);
                // Terminate the way an unhandled SIGINT would
                if let Err(e) = signal_hook::low_level::emulate_default_handler(signal) {
                    log::error!("Could not re-raise signal {signal}: {e}");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            }
        })?;
    log::debug!("Interrupt handler installed");
    Ok(())
}

#[cfg(not(unix))]
fn install_ctrlc_handler(scratch: SharedScratch) -> std::io::Result<()> {
    ctrlc::set_handler(move || {
        clean_up_after_interrupt(&scratch);
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
    .map_err(std::io::Error::other)?;
    log::debug!("Interrupt handler installed");
    Ok(())
}
