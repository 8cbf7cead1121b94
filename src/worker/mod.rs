//! Offline cache worker.
//!
//! A [`CacheWorker`] owns one generation of the application shell, named by
//! its version tag. It moves through an explicit lifecycle:
//!
//! ```text
//! Parsed -> Installing -> Installed (waiting) -> Activating -> Activated
//!              \-> Redundant (pre-cache failed)
//! ```
//!
//! Install pre-caches the shell into the versioned bucket, activate deletes
//! every other bucket and claims the clients, and from then on [`CacheWorker::fetch`]
//! answers requests cache-first. Status changes are reported as
//! [`WorkerEvent`]s to whoever registered the worker.

use std::fmt;

use crossbeam_channel::Sender;
use strum::{Display, IntoStaticStr};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CacheOptions;

pub mod cache;
pub mod network;
pub mod registration;

pub use cache::{CacheStorage, MemoryCache, SqliteCache};
pub use network::{
    normalize_url, Network, NetworkError, OfflineNetwork, Request, RequestMode, Response,
    ResponseType, StaticOrigin,
};
pub use registration::Registration;

/// Served when a navigation cannot reach the network.
pub const OFFLINE_FALLBACK: &str = "./index.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and waiting for an older generation to let go.
    Installed,
    Activating,
    Activated,
    Redundant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    StateChanged { version: String, state: WorkerState },
    CacheDeleted { name: String },
    ClientsClaimed { version: String },
    /// A new generation finished installing while an older one still exists.
    UpdateReady { version: String },
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("cannot {action} while the worker is {state}")]
    InvalidState {
        action: &'static str,
        state: WorkerState,
    },

    #[error("shell generation {version} is not installed")]
    NotInstalled { version: String },

    #[error("failed to pre-cache {url}: {reason}")]
    Precache { url: String, reason: String },

    #[error("worker thread is no longer running")]
    Disconnected,

    #[error(transparent)]
    Cache(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
    pub cached: usize,
    /// Another generation's bucket was present when install finished.
    pub replaces_existing: bool,
}

pub struct CacheWorker<C, N> {
    options: CacheOptions,
    cache: C,
    network: N,
    state: WorkerState,
    clients_claimed: bool,
    events: Option<Sender<WorkerEvent>>,
}

impl<C, N> fmt::Debug for CacheWorker<C, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheWorker")
            .field("version", &self.options.version)
            .field("state", &self.state)
            .field("clients_claimed", &self.clients_claimed)
            .finish_non_exhaustive()
    }
}

impl<C: CacheStorage, N: Network> CacheWorker<C, N> {
    pub fn new(options: CacheOptions, cache: C, network: N) -> Self {
        Self {
            options,
            cache,
            network,
            state: WorkerState::Parsed,
            clients_claimed: false,
            events: None,
        }
    }

    /// Picks up a generation installed by an earlier run.
    ///
    /// Activation removes every other bucket, so a generation whose bucket
    /// shares the cache with older ones is still waiting.
    pub fn resume(options: CacheOptions, cache: C, network: N) -> Result<Self, WorkerError> {
        if !cache.has(&options.version)? {
            return Err(WorkerError::NotInstalled {
                version: options.version.clone(),
            });
        }
        let others = cache
            .keys()?
            .into_iter()
            .any(|name| name != options.version);
        let mut worker = Self::new(options, cache, network);
        if others {
            worker.state = WorkerState::Installed;
        } else {
            worker.state = WorkerState::Activated;
            worker.clients_claimed = true;
        }
        Ok(worker)
    }

    pub fn with_events(mut self, events: Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn set_events(&mut self, events: Sender<WorkerEvent>) {
        self.events = Some(events);
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn version(&self) -> &str {
        &self.options.version
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Pre-caches every shell file into the versioned bucket.
    ///
    /// All files are fetched before anything is written; one failure leaves
    /// the cache untouched and the worker redundant.
    pub fn install(&mut self) -> Result<InstallOutcome, WorkerError> {
        self.expect_state("install", &[WorkerState::Parsed])?;
        self.transition(WorkerState::Installing);
        info!(version = %self.options.version, "installing shell");

        let files = self.options.shell_files.clone();
        let mut fetched = Vec::with_capacity(files.len());
        for file in &files {
            let url = normalize_url(file, &self.options.origin);
            let failure = match self.network.fetch(&Request::get(url.clone())) {
                Ok(response) if response.ok() => {
                    fetched.push((url, response));
                    continue;
                }
                Ok(response) => format!("status {}", response.status),
                Err(err) => err.to_string(),
            };
            warn!(%url, reason = %failure, "shell file unavailable, install aborted");
            self.transition(WorkerState::Redundant);
            return Err(WorkerError::Precache {
                url,
                reason: failure,
            });
        }

        let written = self.write_shell(&fetched);
        if let Err(err) = written {
            if let Err(cleanup) = self.cache.delete(&self.options.version) {
                warn!(?cleanup, "failed to drop partially written shell");
            }
            self.transition(WorkerState::Redundant);
            return Err(err);
        }

        let replaces_existing = self
            .cache
            .keys()?
            .iter()
            .any(|name| name != &self.options.version);
        self.transition(WorkerState::Installed);
        if replaces_existing {
            info!(version = %self.options.version, "new version installed and waiting");
            self.emit(WorkerEvent::UpdateReady {
                version: self.options.version.clone(),
            });
        }
        Ok(InstallOutcome {
            cached: fetched.len(),
            replaces_existing,
        })
    }

    /// Deletes every bucket but the current one and claims the clients.
    /// Returns the names of the deleted buckets.
    pub fn activate(&mut self) -> Result<Vec<String>, WorkerError> {
        self.expect_state("activate", &[WorkerState::Installed])?;
        self.transition(WorkerState::Activating);

        let mut deleted = Vec::new();
        for name in self.cache.keys()? {
            if name == self.options.version {
                continue;
            }
            if self.cache.delete(&name)? {
                info!(bucket = %name, "deleted stale cache");
                self.emit(WorkerEvent::CacheDeleted { name: name.clone() });
                deleted.push(name);
            }
        }

        self.transition(WorkerState::Activated);
        self.clients_claimed = true;
        self.emit(WorkerEvent::ClientsClaimed {
            version: self.options.version.clone(),
        });
        Ok(deleted)
    }

    /// Answers a request the way the page would see it.
    ///
    /// Cache hits never touch the network. Misses go to the network and
    /// successful same-origin responses are copied into the current bucket.
    /// When the network fails, navigations get the cached shell document and
    /// everything else gets `None`.
    pub fn fetch(&self, request: &Request) -> Result<Option<Response>, WorkerError> {
        self.expect_state(
            "handle fetch",
            &[WorkerState::Activating, WorkerState::Activated],
        )?;
        let url = normalize_url(&request.url, &self.options.origin);
        if let Some(hit) = self.cache.match_any(&url)? {
            debug!(%url, "cache hit");
            return Ok(Some(hit));
        }

        let forwarded = Request {
            url: url.clone(),
            mode: request.mode,
        };
        match self.network.fetch(&forwarded) {
            Ok(response) => {
                if response.is_cacheable() {
                    if let Err(err) = self.cache.put(&self.options.version, &url, &response) {
                        warn!(%url, ?err, "failed to cache network response");
                    } else {
                        debug!(%url, "cached network response");
                    }
                } else {
                    debug!(%url, status = response.status, kind = %response.kind, "not caching response");
                }
                Ok(Some(response))
            }
            Err(err) => {
                debug!(%url, %err, "network request failed");
                if request.is_navigation() {
                    let fallback = normalize_url(OFFLINE_FALLBACK, &self.options.origin);
                    Ok(self.cache.match_any(&fallback)?)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn write_shell(&self, fetched: &[(String, Response)]) -> Result<(), WorkerError> {
        self.cache.open(&self.options.version)?;
        for (url, response) in fetched {
            self.cache.put(&self.options.version, url, response)?;
        }
        Ok(())
    }

    fn expect_state(
        &self,
        action: &'static str,
        allowed: &[WorkerState],
    ) -> Result<(), WorkerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(WorkerError::InvalidState {
                action,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, state: WorkerState) {
        debug!(version = %self.options.version, from = %self.state, to = %state, "worker state");
        self.state = state;
        self.emit(WorkerEvent::StateChanged {
            version: self.options.version.clone(),
            state,
        });
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("worker event dropped, host is gone");
            }
        }
    }
}
