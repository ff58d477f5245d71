// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OS signal handling.
//!
//! SIGINT, SIGTERM and SIGQUIT trigger graceful shutdown; SIGHUP reloads
//! the application list; SIGPIPE is blocked; the core-generating signals
//! print a stack trace and re-raise themselves so a core dump is produced.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigprocmask};
use tokio::signal::unix::{self, SignalKind};

/// Listener for the signals that stop the node.
///
/// Installed once at startup; `recv` names the signal it caught so the
/// shutdown can be logged with its cause.
pub struct ShutdownSignals {
    interrupt: unix::Signal,
    terminate: unix::Signal,
    quit: unix::Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: unix::signal(SignalKind::interrupt())?,
            terminate: unix::signal(SignalKind::terminate())?,
            quit: unix::signal(SignalKind::quit())?,
        })
    }

    /// Completes with the name of the next termination signal received.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

/// Block SIGPIPE for the whole process; broken sockets surface as write
/// errors instead.
pub fn block_sigpipe() -> nix::Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGPIPE);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), None)
}

extern "C" fn crash_handler(signum: i32) {
    let trace = std::backtrace::Backtrace::force_capture();
    eprintln!("caught signal {signum}, backtrace:\n{trace}");

    // Re-raise so that a core dump is generated; SA_RESETHAND has restored
    // the default disposition by now.
    let signal = Signal::try_from(signum).unwrap_or(Signal::SIGABRT);
    let _ = nix::sys::signal::raise(signal);

    // Just in case the default handler returns.
    std::process::exit(1);
}

/// Reroute the core-generating signals through the stack-trace printer.
pub fn install_crash_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(crash_handler),
        SaFlags::SA_NODEFER | SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );

    for signal in [Signal::SIGABRT, Signal::SIGBUS, Signal::SIGSEGV] {
        // Replacing the default disposition of a crash signal.
        if let Err(e) = unsafe { nix::sys::signal::sigaction(signal, &action) } {
            eprintln!("ERROR: unable to install the {signal} handler: {e}");
        }
    }
}
