//! Runs a [`CacheWorker`] on its own thread.
//!
//! The host and the worker share nothing: requests go in as
//! [`WorkerCommand`]s, answers come back on per-request reply channels and
//! lifecycle changes arrive as [`WorkerEvent`]s.

use std::fmt;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use super::{
    CacheStorage, CacheWorker, Network, Request, Response, WorkerError, WorkerEvent, WorkerState,
};

type Reply<T> = Sender<Result<T, WorkerError>>;

pub enum WorkerCommand {
    Fetch {
        request: Request,
        reply: Reply<Option<Response>>,
    },
    /// Activates a generation left waiting after install.
    Activate { reply: Reply<Vec<String>> },
    State { reply: Sender<WorkerState> },
    Shutdown,
}

pub struct Registration {
    version: String,
    commands: Sender<WorkerCommand>,
    events: Receiver<WorkerEvent>,
    handle: Option<JoinHandle<()>>,
}

impl Registration {
    /// Starts `worker` on a background thread and returns once it is ready.
    ///
    /// A fresh worker is installed first and activated straight away when
    /// `skip_waiting` is set or no older generation is around. Install
    /// failures are returned here and the thread is gone.
    pub fn register<C, N>(mut worker: CacheWorker<C, N>) -> Result<Self, WorkerError>
    where
        C: CacheStorage + Send + 'static,
        N: Network + Send + 'static,
    {
        let version = worker.version().to_string();
        let (event_tx, event_rx) = unbounded();
        let (command_tx, command_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        worker.set_events(event_tx);

        let handle = thread::Builder::new()
            .name(format!("cache-worker-{version}"))
            .spawn(move || {
                let started = start(&mut worker);
                let failed = started.is_err();
                if ready_tx.send(started).is_err() || failed {
                    return;
                }
                serve(worker, command_rx);
            })
            .map_err(|err| WorkerError::Cache(err.into()))?;

        let started = ready_rx.recv().map_err(|_| WorkerError::Disconnected);
        let mut registration = Self {
            version,
            commands: command_tx,
            events: event_rx,
            handle: Some(handle),
        };
        match started {
            Ok(Ok(state)) => {
                info!(version = %registration.version, %state, "cache worker registered");
                Ok(registration)
            }
            Ok(Err(err)) | Err(err) => {
                registration.join();
                Err(err)
            }
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn fetch(&self, request: Request) -> Result<Option<Response>, WorkerError> {
        let (reply, answer) = bounded(1);
        self.send(WorkerCommand::Fetch { request, reply })?;
        answer.recv().map_err(|_| WorkerError::Disconnected)?
    }

    pub fn activate(&self) -> Result<Vec<String>, WorkerError> {
        let (reply, answer) = bounded(1);
        self.send(WorkerCommand::Activate { reply })?;
        answer.recv().map_err(|_| WorkerError::Disconnected)?
    }

    pub fn state(&self) -> Result<WorkerState, WorkerError> {
        let (reply, answer) = bounded(1);
        self.send(WorkerCommand::State { reply })?;
        answer.recv().map_err(|_| WorkerError::Disconnected)
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    /// Everything the worker has reported so far.
    pub fn drain_events(&self) -> Vec<WorkerEvent> {
        self.events.try_iter().collect()
    }

    /// Stops the worker thread and waits for it to exit.
    pub fn unregister(mut self) {
        self.join();
    }

    fn send(&self, command: WorkerCommand) -> Result<(), WorkerError> {
        self.commands
            .send(command)
            .map_err(|_| WorkerError::Disconnected)
    }

    fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if handle.join().is_err() {
            warn!(version = %self.version, "cache worker thread panicked");
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("version", &self.version)
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.join();
    }
}

fn start<C: CacheStorage, N: Network>(
    worker: &mut CacheWorker<C, N>,
) -> Result<WorkerState, WorkerError> {
    if worker.state() == WorkerState::Parsed {
        let outcome = worker.install()?;
        if worker.options().skip_waiting || !outcome.replaces_existing {
            worker.activate()?;
        }
    }
    Ok(worker.state())
}

fn serve<C: CacheStorage, N: Network>(
    mut worker: CacheWorker<C, N>,
    commands: Receiver<WorkerCommand>,
) {
    for command in commands {
        match command {
            WorkerCommand::Fetch { request, reply } => {
                let _ = reply.send(worker.fetch(&request));
            }
            WorkerCommand::Activate { reply } => {
                let _ = reply.send(worker.activate());
            }
            WorkerCommand::State { reply } => {
                let _ = reply.send(worker.state());
            }
            WorkerCommand::Shutdown => break,
        }
    }
    debug!(version = %worker.version(), "cache worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheOptions;
    use crate::worker::{MemoryCache, NetworkError, OfflineNetwork};
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Site {
        files: Arc<HashMap<String, String>>,
    }

    impl Site {
        fn with(files: &[(&str, &str)]) -> Self {
            let files = files
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect();
            Self {
                files: Arc::new(files),
            }
        }
    }

    impl Network for Site {
        fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
            Ok(match self.files.get(&request.url) {
                Some(body) => Response::basic(200, "text/plain", body.as_str()),
                None => Response::basic(404, "text/plain", "Not Found"),
            })
        }
    }

    fn options(version: &str, skip_waiting: bool) -> CacheOptions {
        CacheOptions {
            version: version.into(),
            shell_files: vec!["./".into(), "./index.html".into()],
            skip_waiting,
            ..CacheOptions::default()
        }
    }

    fn site() -> Site {
        Site::with(&[("/", "root"), ("/index.html", "index"), ("/notes.css", "css")])
    }

    #[test]
    fn register_installs_activates_and_serves() -> anyhow::Result<()> {
        let worker = CacheWorker::new(options("my-note-v1", true), MemoryCache::new(), site());
        let registration = Registration::register(worker)?;
        assert_eq!(registration.state()?, WorkerState::Activated);
        assert!(format!("{registration:?}").contains("my-note-v1"));

        let response = registration
            .fetch(Request::get("./notes.css"))?
            .expect("served");
        assert_eq!(response.body, b"css");

        let events = registration.drain_events();
        assert!(events.contains(&WorkerEvent::ClientsClaimed {
            version: "my-note-v1".into()
        }));
        registration.unregister();
        Ok(())
    }

    #[test]
    fn waiting_generation_activates_on_request() -> anyhow::Result<()> {
        let cache = MemoryCache::new();
        cache.put("my-note-v1", "/", &Response::basic(200, "text/plain", "old"))?;
        let worker = CacheWorker::new(options("my-note-v2", false), cache, site());

        let registration = Registration::register(worker)?;
        assert_eq!(registration.state()?, WorkerState::Installed);
        assert!(registration.drain_events().contains(&WorkerEvent::UpdateReady {
            version: "my-note-v2".into()
        }));
        assert_matches!(
            registration.fetch(Request::get("./")),
            Err(WorkerError::InvalidState { .. })
        );

        assert_eq!(registration.activate()?, vec!["my-note-v1"]);
        let response = registration.fetch(Request::get("./"))?.expect("cached");
        assert_eq!(response.body, b"root");
        Ok(())
    }

    #[test]
    fn install_failure_is_reported_by_register() {
        let worker = CacheWorker::new(options("my-note-v1", true), MemoryCache::new(), OfflineNetwork);
        assert_matches!(
            Registration::register(worker),
            Err(WorkerError::Precache { .. })
        );
    }
}
