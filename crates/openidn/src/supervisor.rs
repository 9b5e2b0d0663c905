// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Thread lifecycle: spawns the network, driver and management threads
//! with realtime priorities and quiesces them on shutdown.
//!
//! Shutdown safety: the driver must never leave the beam active, so it
//! parks the beam (safe center point, emitters off) on its way out of the
//! loop; the supervisor only raises the flag, joins, and re-raises the
//! signal so process termination proceeds normally.

use crate::adapter::DacAdapter;
use crate::bex::Bex;
use crate::config::{RuntimeConfig, IDN_HELLO_UDP_PORT, MGMT_UDP_PORT};
use crate::driver::Driver;
use crate::error::Error;
use crate::mgmt::MgmtServer;
use crate::server::events::DeviceEventSink;
use crate::server::IdnServer;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Raised by the signal handler; polled by [`Supervisor::run`].
static SIGNAL_RAISED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    // Only async-signal-safe work here
    SIGNAL_RAISED.store(true, Ordering::SeqCst);
}

/// Owns the worker threads and the shared shutdown flag.
pub struct Supervisor {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl Supervisor {
    /// Wire the pipeline and spawn all threads on the production ports.
    pub fn start(
        config: Arc<RuntimeConfig>,
        adapter: Arc<dyn DacAdapter>,
        settings_path: PathBuf,
    ) -> Result<Self, Error> {
        Self::start_on(
            IDN_HELLO_UDP_PORT,
            MGMT_UDP_PORT,
            config,
            adapter,
            settings_path,
        )
    }

    /// As [`Supervisor::start`] with explicit ports (tests use 0).
    pub fn start_on(
        idn_port: u16,
        mgmt_port: u16,
        config: Arc<RuntimeConfig>,
        adapter: Arc<dyn DacAdapter>,
        settings_path: PathBuf,
    ) -> Result<Self, Error> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let bex = Arc::new(Bex::new());
        let device_events = Arc::new(DeviceEventSink::new());
        let (stop_tx, stop_rx) = bounded::<()>(1);

        if config.max_pointrate() != 0 {
            adapter.set_max_pointrate(config.max_pointrate());
        }

        let mut server = IdnServer::bind(
            idn_port,
            Arc::clone(&config),
            Arc::clone(&adapter),
            Arc::clone(&bex),
            Arc::clone(&device_events),
            Arc::clone(&shutdown),
        )?;
        let mut driver = Driver::new(
            Arc::clone(&bex),
            Arc::clone(&adapter),
            Arc::clone(&config),
            Arc::clone(&device_events),
            Arc::clone(&shutdown),
        );
        let mut mgmt = MgmtServer::bind(
            mgmt_port,
            Arc::clone(&config),
            settings_path,
            Arc::clone(&shutdown),
        )?;

        let mut handles = Vec::new();

        // Driver gets the highest priority: playback cadence beats packet
        // reception under load
        handles.push(
            std::thread::Builder::new()
                .name("idn-driver".into())
                .spawn(move || {
                    set_realtime_priority(0);
                    driver.run();
                })
                .map_err(|_| Error::ThreadSpawn("idn-driver".into()))?,
        );
        handles.push(
            std::thread::Builder::new()
                .name("idn-net".into())
                .spawn(move || {
                    set_realtime_priority(1);
                    server.run();
                })
                .map_err(|_| Error::ThreadSpawn("idn-net".into()))?,
        );
        handles.push(
            std::thread::Builder::new()
                .name("idn-mgmt".into())
                .spawn(move || {
                    mgmt.run();
                })
                .map_err(|_| Error::ThreadSpawn("idn-mgmt".into()))?,
        );

        Ok(Supervisor {
            shutdown,
            handles,
            stop_tx,
            stop_rx,
        })
    }

    /// The shared shutdown flag (tests and embedders).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Request shutdown from another thread.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Block until an interrupt signal (or [`Supervisor::stop`]) arrives,
    /// then quiesce all threads. On a signal the default handler is
    /// restored and the signal re-raised so the process terminates with
    /// conventional semantics.
    pub fn run(mut self) {
        install_signal_handler();

        loop {
            if SIGNAL_RAISED.load(Ordering::SeqCst) {
                break;
            }
            if self.stop_rx.recv_timeout(Duration::from_millis(50)).is_ok() {
                break;
            }
        }

        log::info!("[SUP] shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }

        if SIGNAL_RAISED.load(Ordering::SeqCst) {
            // SAFETY: restoring the default disposition and re-raising is
            // the conventional way to terminate with the signal's own
            // semantics after a clean shutdown.
            unsafe {
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                libc::raise(libc::SIGINT);
            }
        }
    }

    /// Quiesce without waiting for a signal (tests and embedders).
    pub fn join(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn install_signal_handler() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    // SAFETY: on_signal only touches an atomic flag
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

/// Apply `SCHED_RR` at `offset` below the maximum priority. Logs and
/// continues when the process lacks the privilege.
fn set_realtime_priority(offset: i32) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: plain libc scheduling calls on the current thread
        unsafe {
            let max = libc::sched_get_priority_max(libc::SCHED_RR);
            if max <= 0 {
                return;
            }
            let param = libc::sched_param {
                sched_priority: (max - offset).max(1),
            };
            if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param) != 0 {
                log::warn!(
                    "[SUP] SCHED_RR priority {} unavailable (needs CAP_SYS_NICE), \
                     continuing with default scheduling",
                    param.sched_priority
                );
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = offset;
    }
}
