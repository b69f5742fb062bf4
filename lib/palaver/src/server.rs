use crate::config::ServerConfig;
use crate::directory::UserDirectory;
use crate::logging;
use crate::net::codec::{self, FdIo};
use crate::net::frame::Op;
use crate::net::serializer::IoSerializer;
use crate::ops::{self, Outcome};
use crate::queue::{FdQueue, STOP};
use crate::stats::Stats;
use hashbrown::HashMap;
use indexmap::IndexSet;
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Registration table width.
pub const NBUCKETS: usize = 1024;

/// Readiness poll timeout, kept short so the shutdown flag is observed
/// promptly.
const POLL_TIMEOUT_MS: libc::c_int = 1;

/// Shared server state, passed explicitly to every component.
pub struct ServerCtx {
    pub config: ServerConfig,
    pub stats: Stats,
    pub directory: UserDirectory,
    pub serializer: IoSerializer,
    pub log: logging::Logger,
}

impl ServerCtx {
    pub fn new(config: ServerConfig, log: logging::Logger) -> ServerCtx {
        let directory = UserDirectory::new(
            NBUCKETS,
            config.max_connections,
            config.max_hist_msgs,
            &log,
        );

        ServerCtx {
            stats: Stats::new(),
            directory,
            serializer: IoSerializer::new(true),
            config,
            log,
        }
    }
}

/// Remote control for a running server; lets the owner request shutdown
/// without raising a signal.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// The dispatch runtime: listener, armed descriptor set, descriptor queue,
/// worker pool and signal thread.
///
/// A descriptor is disarmed before it is handed to a worker and re-armed
/// only after its handler completes, so at most one worker ever holds a
/// given descriptor and requests on one connection are processed strictly
/// in arrival order.
pub struct Server {
    ctx: Arc<ServerCtx>,
    listener: UnixListener,
    queue: Arc<FdQueue>,
    armed: Arc<Mutex<IndexSet<RawFd>>>,
    conns: Arc<Mutex<HashMap<RawFd, UnixStream>>>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Prepares the runtime: creates the file store directory, unlinks any
    /// stale socket file and binds the listener.
    pub fn bind(config: ServerConfig, log: &logging::Logger) -> io::Result<Server> {
        fs::create_dir_all(&config.dir_name)?;

        match fs::remove_file(&config.unix_path) {
            Ok(()) => {
                logging::debug!(log, "removed stale socket file";
                                "context" => "bind",
                                "path" => %config.unix_path.display());
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => (),
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(&config.unix_path)?;
        logging::info!(log, "listening"; "context" => "bind", "path" => %config.unix_path.display());

        Ok(Server {
            ctx: Arc::new(ServerCtx::new(config, log.new(logging::o!()))),
            listener,
            queue: Arc::new(FdQueue::new()),
            armed: Arc::new(Mutex::new(IndexSet::new())),
            conns: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn ctx(&self) -> Arc<ServerCtx> {
        Arc::clone(&self.ctx)
    }

    /// Runs the server to completion: spawns the signal thread and the
    /// worker pool, polls for readiness, and drains everything once the
    /// shutdown flag is raised.
    pub fn run(self) -> io::Result<()> {
        // Broken peers must surface as write errors, not signals.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let mut signals = Signals::new(&[SIGINT, SIGTERM, SIGQUIT, SIGUSR1])?;
        let signals_handle = signals.handle();

        let signal_thread = {
            let ctx = Arc::clone(&self.ctx);
            let shutdown = Arc::clone(&self.shutdown);
            thread::Builder::new().name("signals".to_string()).spawn(move || {
                for signal in signals.forever() {
                    match signal {
                        SIGUSR1 => {
                            logging::info!(ctx.log, "statistics dump requested"; "context" => "signals");
                            if let Err(err) = ctx.stats.dump(&ctx.config.stat_file_name) {
                                logging::error!(ctx.log, "statistics dump failed";
                                                "context" => "signals",
                                                "error" => %err);
                            }
                        }
                        signal => {
                            logging::info!(ctx.log, "termination signal";
                                           "context" => "signals",
                                           "signal" => signal);
                            shutdown.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            })?
        };

        let mut workers = Vec::with_capacity(self.ctx.config.threads_in_pool);
        for worker_id in 0..self.ctx.config.threads_in_pool {
            let ctx = Arc::clone(&self.ctx);
            let queue = Arc::clone(&self.queue);
            let armed = Arc::clone(&self.armed);
            let conns = Arc::clone(&self.conns);
            let shutdown = Arc::clone(&self.shutdown);

            workers.push(
                thread::Builder::new()
                    .name(format!("worker-{}", worker_id))
                    .spawn(move || worker_loop(worker_id, &ctx, &queue, &armed, &conns, &shutdown))?,
            );
        }

        logging::info!(self.ctx.log, "server started";
                       "context" => "run",
                       "workers" => self.ctx.config.threads_in_pool,
                       "max_connections" => self.ctx.config.max_connections);

        let listener_fd = self.listener.as_raw_fd();
        let mut scratch: Vec<RawFd> = Vec::new();

        while !self.shutdown.load(Ordering::Relaxed) {
            scratch.clear();
            scratch.push(listener_fd);
            {
                let armed = self.armed.lock().expect("armed set poisoned");
                scratch.extend(armed.iter().copied());
            }

            let mut pollfds: Vec<libc::pollfd> = scratch
                .iter()
                .map(|&fd| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();

            let ready = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, POLL_TIMEOUT_MS)
            };
            if ready <= 0 {
                // Timeout, or a harmless interruption.
                continue;
            }

            for pfd in &pollfds {
                if pfd.revents == 0 {
                    continue;
                }
                if pfd.fd == listener_fd {
                    self.accept_client();
                } else {
                    // Disarm before dispatch: the descriptor stays out of
                    // the poll set until its handler completes.
                    self.armed.lock().expect("armed set poisoned").swap_remove(&pfd.fd);
                    self.queue.push(pfd.fd);
                }
            }
        }

        logging::info!(self.ctx.log, "shutting down"; "context" => "shutdown");

        self.queue.push(STOP);
        signals_handle.close();

        if signal_thread.join().is_err() {
            logging::error!(self.ctx.log, "signal thread panicked"; "context" => "shutdown");
        }
        for (worker_id, worker) in workers.into_iter().enumerate() {
            if worker.join().is_err() {
                logging::error!(self.ctx.log, "worker panicked";
                                "context" => "shutdown",
                                "worker_id" => worker_id);
            }
        }

        // Dropping the registry closes every client connection; the
        // listener closes with the server.
        self.conns.lock().expect("registry poisoned").clear();

        logging::info!(self.ctx.log, "server stopped"; "context" => "shutdown");
        Ok(())
    }

    fn accept_client(&self) {
        match self.listener.accept() {
            Ok((stream, _)) => {
                let fd = stream.as_raw_fd();

                if self.ctx.directory.online_count() >= self.ctx.config.max_connections {
                    logging::info!(self.ctx.log, "connection limit reached";
                                   "context" => "accept",
                                   "fd" => fd);
                    self.ctx.stats.update(|c| c.nerrors += 1);
                    let _ = ops::send_ack(&self.ctx, fd, Op::Fail);
                    // The stream drops here, closing the connection.
                } else {
                    logging::debug!(self.ctx.log, "client connected"; "context" => "accept", "fd" => fd);
                    self.conns.lock().expect("registry poisoned").insert(fd, stream);
                    self.armed.lock().expect("armed set poisoned").insert(fd);
                }
            }
            Err(err) => {
                logging::error!(self.ctx.log, "accept failed"; "context" => "accept", "error" => %err);
            }
        }
    }
}

fn worker_loop(
    worker_id: usize,
    ctx: &ServerCtx,
    queue: &FdQueue,
    armed: &Mutex<IndexSet<RawFd>>,
    conns: &Mutex<HashMap<RawFd, UnixStream>>,
    shutdown: &AtomicBool,
) {
    logging::debug!(ctx.log, "worker started"; "context" => "worker", "worker_id" => worker_id);

    while !shutdown.load(Ordering::Relaxed) {
        let fd = queue.pop();
        if fd == STOP {
            queue.push(STOP);
            break;
        }

        let request = {
            let _guard = ctx.serializer.read_lock(fd);
            codec::read_msg(&mut FdIo(fd))
        };

        let outcome = match request {
            Ok(msg) => ops::dispatch(ctx, msg, fd),
            Err(err) => {
                logging::debug!(ctx.log, "client hung up";
                                "context" => "worker",
                                "worker_id" => worker_id,
                                "fd" => fd,
                                "error" => ?err);
                Outcome::Drop
            }
        };

        match outcome {
            Outcome::Keep => {
                armed.lock().expect("armed set poisoned").insert(fd);
            }
            Outcome::Drop => {
                if ctx.directory.disconnect_by_fd(fd).is_ok() {
                    ctx.stats.update(|c| c.nonline -= 1);
                }
                conns.lock().expect("registry poisoned").remove(&fd);
            }
        }
    }

    logging::debug!(ctx.log, "worker stopped"; "context" => "worker", "worker_id" => worker_id);
}
