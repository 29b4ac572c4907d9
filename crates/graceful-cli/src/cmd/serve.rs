//! Serve subcommand - line-oriented TCP server with graceful shutdown
//!
//! Protocol, one command per line: `ping` answers `pong`, `exit` answers
//! `bye` and shuts the process down, anything else is echoed back.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use graceful_core::tracker::ActiveTasks;
use graceful_core::{Outcome, Switch, WeakSwitch};

use crate::config::Config;

/// Pause between accept attempts on the non-blocking listener
const ACCEPT_POLL: Duration = Duration::from_millis(25);

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address, port 0 picks a free random port
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Milliseconds to wait for open sessions during shutdown
    #[arg(long)]
    pub drain_ms: Option<u64>,

    /// Append session open/close events to this file
    #[arg(long)]
    pub journal: Option<PathBuf>,
}

/// Open client connections, closable as a group.
#[derive(Default)]
struct SessionPool {
    streams: Mutex<HashMap<u64, TcpStream>>,
}

impl SessionPool {
    fn insert(&self, id: u64, stream: TcpStream) {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, stream);
    }

    fn remove(&self, id: u64) {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Shut down every open stream. Failures are logged, never returned.
    fn close_all(&self) -> usize {
        let streams: Vec<(u64, TcpStream)> = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let count = streams.len();
        for (id, stream) in streams {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::warn!("Failed to close session {id}: {e}");
            }
        }
        count
    }
}

/// Append-only session log.
///
/// A disabled journal ignores every record. After [`close`](Self::close)
/// further records are dropped.
#[derive(Default)]
pub struct Journal {
    file: Mutex<Option<BufWriter<File>>>,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open journal {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn is_open(&self) -> bool {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn record(&self, event: &str) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = file.as_mut() else {
            log::debug!("Journal closed, dropping: {event}");
            return;
        };
        if let Err(e) = writeln!(writer, "{event}") {
            log::warn!("Journal write failed: {e}");
        }
    }

    /// Flush and release the file.
    pub fn close(&self) {
        let writer = self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut writer) = writer {
            match writer.flush() {
                Ok(()) => log::debug!("Journal closed"),
                Err(e) => log::warn!("Journal flush failed: {e}"),
            }
        }
    }
}

/// Accept loop plus the bookkeeping needed to stop it.
pub struct Server {
    addr: SocketAddr,
    // weak: the switch's task registry owns the server through `tcp_server`
    switch: WeakSwitch,
    stopping: AtomicBool,
    next_id: AtomicU64,
    sessions: SessionPool,
    journal: Arc<Journal>,
    active: Arc<ActiveTasks>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind `listen` and start accepting on a background thread.
    pub fn start(listen: &str, switch: WeakSwitch, journal: Arc<Journal>) -> Result<Arc<Self>> {
        let listener =
            TcpListener::bind(listen).with_context(|| format!("Failed to listen on {listen}"))?;
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        let addr = listener.local_addr().context("Failed to read local address")?;

        let server = Arc::new(Self {
            addr,
            switch,
            stopping: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            sessions: SessionPool::default(),
            journal,
            active: ActiveTasks::new(),
            accept: Mutex::new(None),
        });

        let accept_server = Arc::clone(&server);
        let handle = std::thread::Builder::new()
            .name("graceful-accept".into())
            .spawn(move || accept_server.accept_loop(listener))
            .context("Failed to spawn accept thread")?;
        *server.accept.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(server)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sessions currently being served.
    pub fn open_sessions(&self) -> usize {
        self.active.len()
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while !self.stopping.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => self.spawn_session(stream, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
        log::debug!("Stopped accepting on {}", self.addr);
    }

    fn spawn_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let label = format!("session-{id} {peer}");

        match stream.try_clone() {
            Ok(clone) => self.sessions.insert(id, clone),
            Err(e) => log::warn!("{label}: cannot track for shutdown: {e}"),
        }

        self.journal.record(&format!("open {label}"));
        let guard = self.active.enter(&label);
        let server = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                if let Err(e) = server.handle_session(stream) {
                    log::debug!("{}: {e}", guard.name());
                }
                server.sessions.remove(id);
                server.journal.record(&format!("close {}", guard.name()));
                drop(guard);
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn session thread: {e}");
            self.sessions.remove(id);
        }
    }

    fn handle_session(&self, stream: TcpStream) -> std::io::Result<()> {
        // accepted sockets may inherit the listener's non-blocking mode
        stream.set_nonblocking(false)?;
        let mut writer = stream.try_clone()?;
        let reader = BufReader::new(stream);

        for line in reader.lines() {
            let line = line?;
            match line.trim() {
                "" => continue,
                "ping" => writeln!(writer, "pong")?,
                "exit" => {
                    writeln!(writer, "bye")?;
                    match self.switch.upgrade() {
                        Some(switch) => switch.shutdown(),
                        None => log::debug!("exit received, switch already gone"),
                    }
                    break;
                }
                other => writeln!(writer, "{other}")?,
            }
        }
        Ok(())
    }

    /// Stop accepting and wait up to `drain` for open sessions.
    pub fn stop(&self, drain: Duration) -> Outcome {
        self.stopping.store(true, Ordering::SeqCst);
        let handle = self
            .accept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("Accept thread panicked");
            }
        }

        let outcome = self.active.wait_until(Instant::now().checked_add(drain));
        if let Outcome::Timeout(left) = &outcome {
            log::warn!("Sessions still open after drain: {}", left.join(", "));
        }
        outcome
    }

    /// [`stop`](Self::stop), then cut off whatever outlived the drain.
    ///
    /// Sessions keep being served while the drain runs.
    pub fn close(&self, drain: Duration) {
        if self.stop(drain).is_clean() {
            return;
        }
        let closed = self.sessions.close_all();
        log::info!("Closed {closed} session(s) left after drain");
    }
}

/// Register the server's shutdown tasks on `switch`.
pub fn register(switch: &Switch, server: &Arc<Server>, drain: Duration) {
    let stopping = Arc::clone(server);
    switch.on_shutdown("tcp_server", move || stopping.close(drain));

    let journal = Arc::clone(&server.journal);
    if journal.is_open() {
        switch.on_shutdown("close_journal", move || journal.close());
    }
}

pub fn run(args: ServeArgs, config: &Config, timeout_ms: Option<u64>) -> Result<()> {
    let listen = args.listen.unwrap_or_else(|| config.serve.listen.clone());
    let drain = Duration::from_millis(args.drain_ms.unwrap_or(config.serve.drain_ms));
    let journal = match args.journal.as_ref().or(config.serve.journal.as_ref()) {
        Some(path) => Journal::open(path)?,
        None => Journal::default(),
    };

    // Default mode: the switch exits the process once shutdown completes.
    let switch = super::switch_builder(&config.shutdown, timeout_ms)?.build();

    let server = Server::start(&listen, switch.downgrade(), Arc::new(journal))?;
    register(&switch, &server, drain);

    log::info!("Listening on {}", server.addr());
    println!("{}", server.addr());

    switch.wait();
    Ok(())
}
