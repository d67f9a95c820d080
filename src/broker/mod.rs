//! The per-host work queue server.
//!
//! Workers on a host do not poll the database themselves: they connect to
//! this process over a Unix-domain socket and send their fetch criteria.
//! The server batches database fetches across waiting workers, locks extra
//! jobs under a host-scoped prefetch identity to cover the next request
//! wave, and hands prefetched locks to newly idle workers with a
//! compare-and-set transfer.
//!
//! All broker state is owned by the main loop. Per-client reader tasks only
//! forward decoded requests over a channel, so the waiting lists and
//! prefetch buckets need no locking.

pub mod protocol;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hooks::{Callbacks, Event};
use crate::job::{Job, PREFETCH_PREFIX};
use crate::settings::Settings;
use crate::store::{JobStore, LockedJobs, StoreError};
use protocol::{ConfigKey, WorkRequest, WorkerConfig};

/// Cadence of the store-level sweep that recovers prefetch locks left
/// behind by brokers that died mid-prefetch.
pub const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Errors on the listen socket are fatal; the supervisor restarts the
    /// broker. Per-client errors are not.
    #[error("listen socket error: {0}")]
    Listen(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Client {
    /// Known after the client's first request.
    name: Option<String>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    reader_task: JoinHandle<()>,
}

enum ClientEvent {
    Request { client_id: u64, request: WorkRequest },
    Gone { client_id: u64 },
}

struct Prefetched {
    job: Job,
    locked_since: Instant,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, Client>,
    /// Idle clients per worker config, in arrival order.
    waiting: HashMap<ConfigKey, VecDeque<u64>>,
    /// Representative config per key (the key drops nothing, any one will do).
    configs: HashMap<ConfigKey, WorkerConfig>,
    prefetched: HashMap<ConfigKey, VecDeque<Prefetched>>,
    next_client_id: u64,
}

pub struct WorkQueueServer {
    store: JobStore,
    settings: Arc<Settings>,
    hooks: Arc<Callbacks>,
    prefetch_owner: String,
    server_id: String,
}

impl WorkQueueServer {
    pub fn new(store: JobStore, hooks: Arc<Callbacks>) -> Self {
        let settings = store.settings_arc();
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let server_id = settings
            .parent_process
            .server_address
            .display()
            .to_string();
        Self {
            store,
            settings,
            hooks,
            prefetch_owner: format!("{PREFETCH_PREFIX}{host}"),
            server_id,
        }
    }

    /// The locker identity this broker's prefetches are held under.
    pub fn prefetch_owner(&self) -> &str {
        &self.prefetch_owner
    }

    /// Run the server until cancelled, the parent process dies, or the
    /// listen socket fails. All prefetched jobs are unlocked on the way out,
    /// whichever exit path is taken.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        let address = self.settings.parent_process.server_address.clone();
        if let Some(parent) = address.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if address.exists() {
            std::fs::remove_file(&address)?;
        }
        let listener = UnixListener::bind(&address)?;
        info!(address = %address.display(), owner = %self.prefetch_owner, "work queue server listening");

        let parent_pid = std::os::unix::process::parent_id();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut state = BrokerState::default();
        let mut next_orphan_sweep = Instant::now() + self.orphan_sweep_jitter();

        let result = loop {
            let timeout = self.loop_timeout();
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.register_client(&mut state, &events_tx, stream),
                    Err(err) => break Err(BrokerError::Listen(err)),
                },
                event = events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(&mut state, event);
                    }
                }
                _ = tokio::time::sleep(timeout) => {}
            }
            // Drain whatever else arrived so a burst of requests is served
            // by a single batched fetch.
            while let Ok(event) = events_rx.try_recv() {
                self.handle_event(&mut state, event);
            }

            self.check_for_work(&mut state).await;
            self.unlock_timed_out_prefetched_jobs(&mut state).await;

            if Instant::now() >= next_orphan_sweep {
                let horizon = chrono::Duration::seconds(ORPHAN_SWEEP_INTERVAL.as_secs() as i64);
                match self.store.unlock_orphaned_prefetched_jobs(horizon).await {
                    Ok(0) => {}
                    Ok(n) => info!(unlocked = n, "recovered orphaned prefetched jobs"),
                    Err(err) => warn!(error = %err, "orphaned prefetch sweep failed"),
                }
                next_orphan_sweep = Instant::now() + ORPHAN_SWEEP_INTERVAL;
            }

            if std::os::unix::process::parent_id() != parent_pid {
                info!("parent process exited, shutting down");
                break Ok(());
            }
        };

        self.release_all_prefetched(&mut state).await;
        let _ = std::fs::remove_file(&address);
        result
    }

    fn register_client(
        &self,
        state: &mut BrokerState,
        events_tx: &mpsc::UnboundedSender<ClientEvent>,
        stream: UnixStream,
    ) {
        let client_id = state.next_client_id;
        state.next_client_id += 1;

        let (read_half, write_half) = stream.into_split();
        let writer = FramedWrite::new(write_half, protocol::codec());
        let mut reader = FramedRead::new(read_half, protocol::codec());
        let tx = events_tx.clone();
        let reader_task = tokio::spawn(async move {
            // One request per readable event; EOF or a malformed frame ends
            // the connection.
            while let Some(frame) = reader.next().await {
                let request = match frame {
                    Ok(bytes) => match protocol::decode::<WorkRequest>(&bytes) {
                        Ok(request) => request,
                        Err(err) => {
                            debug!(client_id, error = %err, "malformed request, dropping client");
                            break;
                        }
                    },
                    Err(err) => {
                        debug!(client_id, error = %err, "read error, dropping client");
                        break;
                    }
                };
                if tx
                    .send(ClientEvent::Request { client_id, request })
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx.send(ClientEvent::Gone { client_id });
        });

        state.clients.insert(
            client_id,
            Client {
                name: None,
                writer,
                reader_task,
            },
        );
        debug!(client_id, "client connected");
    }

    fn handle_event(&self, state: &mut BrokerState, event: ClientEvent) {
        match event {
            ClientEvent::Request { client_id, request } => {
                let Some(client) = state.clients.get_mut(&client_id) else {
                    return;
                };
                client.name = Some(request.worker_name.clone());
                let key = request.config.key();
                state
                    .configs
                    .entry(key.clone())
                    .or_insert_with(|| request.config.clone());
                let bucket = state.waiting.entry(key).or_default();
                if !bucket.contains(&client_id) {
                    bucket.push_back(client_id);
                }
            }
            ClientEvent::Gone { client_id } => {
                debug!(client_id, "client disconnected");
                self.drop_client(state, client_id);
            }
        }
    }

    fn drop_client(&self, state: &mut BrokerState, client_id: u64) {
        if let Some(client) = state.clients.remove(&client_id) {
            client.reader_task.abort();
        }
        for bucket in state.waiting.values_mut() {
            bucket.retain(|id| *id != client_id);
        }
    }

    async fn check_for_work(&self, state: &mut BrokerState) {
        self.hooks.fire(&Event::CheckForWork {
            server: &self.server_id,
        });

        let keys: Vec<ConfigKey> = state
            .waiting
            .iter()
            .filter(|(_, waiters)| !waiters.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.dispatch_prefetched(state, &key).await;
            self.fetch_for_waiters(state, &key).await;
        }
        state.waiting.retain(|_, waiters| !waiters.is_empty());
    }

    /// Hand prefetched jobs to waiting workers via lock transfer. A failed
    /// transfer means the lock was reclaimed out from under us; the job is
    /// dropped and the worker goes back to the head of the line.
    async fn dispatch_prefetched(&self, state: &mut BrokerState, key: &ConfigKey) {
        loop {
            let Some(client_id) = state.waiting.get_mut(key).and_then(|w| w.pop_front()) else {
                break;
            };
            let Some(name) = state
                .clients
                .get(&client_id)
                .and_then(|c| c.name.clone())
            else {
                continue;
            };
            let Some(entry) = state.prefetched.get_mut(key).and_then(|b| b.pop_front()) else {
                if let Some(waiters) = state.waiting.get_mut(key) {
                    waiters.push_front(client_id);
                }
                break;
            };

            match self
                .store
                .transfer_lock(entry.job.id, &self.prefetch_owner, &name)
                .await
            {
                Ok(true) => {
                    let mut job = entry.job;
                    job.locked_by = Some(name);
                    job.locked_at = Some(chrono::Utc::now());
                    self.send_job(state, client_id, job).await;
                }
                Ok(false) => {
                    debug!(job_id = entry.job.id, "prefetched lock gone, dropping job");
                    if let Some(waiters) = state.waiting.get_mut(key) {
                        waiters.push_front(client_id);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "lock transfer failed, retrying next loop");
                    if let Some(waiters) = state.waiting.get_mut(key) {
                        waiters.push_front(client_id);
                    }
                    if let Some(bucket) = state.prefetched.get_mut(key) {
                        bucket.push_front(entry);
                    }
                    break;
                }
            }
        }
    }

    /// Batch-fetch for the workers still waiting under this config, locking
    /// `fetch_batch_size × pool_size − recipients` extra jobs under the
    /// prefetch identity.
    async fn fetch_for_waiters(&self, state: &mut BrokerState, key: &ConfigKey) {
        let Some(config) = state.configs.get(key).cloned() else {
            return;
        };
        let recipients: Vec<(u64, String)> = match state.waiting.get(key) {
            Some(waiters) => waiters
                .iter()
                .filter_map(|id| {
                    state
                        .clients
                        .get(id)
                        .and_then(|c| c.name.clone())
                        .map(|name| (*id, name))
                })
                .collect(),
            None => return,
        };
        if recipients.is_empty() {
            return;
        }

        let names: Vec<String> = recipients.iter().map(|(_, name)| name.clone()).collect();
        let prefetch = (self.settings.fetch_batch_size * config.pool_size)
            .saturating_sub(names.len());

        let event = Event::WorkQueuePop {
            server: &self.server_id,
            config: &config,
        };
        let mut fetched: Option<Result<LockedJobs, StoreError>> = None;
        {
            let fetched = &mut fetched;
            let names = &names;
            let config = &config;
            self.hooks
                .wrap(
                    &event,
                    Box::pin(async move {
                        *fetched = Some(
                            self.store
                                .get_and_lock_next_available(
                                    names,
                                    &config.queue,
                                    config.min_priority,
                                    config.max_priority,
                                    prefetch,
                                    &self.prefetch_owner,
                                )
                                .await,
                        );
                    }),
                )
                .await;
        }
        let locked = match fetched {
            Some(Ok(locked)) => locked,
            Some(Err(err)) => {
                warn!(error = %err, queue = %config.queue, "batch fetch failed, retrying next loop");
                return;
            }
            None => return,
        };
        if locked.is_empty() {
            return;
        }

        let LockedJobs {
            mut assigned,
            prefetched,
        } = locked;
        for (client_id, name) in recipients {
            let Some(job) = assigned.remove(&name) else {
                continue;
            };
            if let Some(waiters) = state.waiting.get_mut(key) {
                waiters.retain(|id| *id != client_id);
            }
            self.send_job(state, client_id, job).await;
        }
        if !prefetched.is_empty() {
            debug!(
                queue = %config.queue,
                count = prefetched.len(),
                "prefetched jobs for the next request wave"
            );
            let now = Instant::now();
            state
                .prefetched
                .entry(key.clone())
                .or_default()
                .extend(prefetched.into_iter().map(|job| Prefetched {
                    job,
                    locked_since: now,
                }));
        }
    }

    /// Write one job to one client within the socket timeout. Any failure
    /// drops the client and unlocks the job so another worker can claim it.
    async fn send_job(&self, state: &mut BrokerState, client_id: u64, job: Job) -> bool {
        let frame = match protocol::encode(&job) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(job_id = job.id, error = %err, "failed to serialize job");
                self.unlock_quietly(&[job.id]).await;
                return false;
            }
        };
        let Some(client) = state.clients.get_mut(&client_id) else {
            self.unlock_quietly(&[job.id]).await;
            return false;
        };
        let timeout = Duration::from_secs_f64(self.settings.parent_process.server_socket_timeout);
        match tokio::time::timeout(timeout, client.writer.send(frame)).await {
            Ok(Ok(())) => {
                debug!(job_id = job.id, client_id, "assigned job to worker");
                true
            }
            Ok(Err(err)) => {
                warn!(client_id, error = %err, "write failed, dropping client");
                self.drop_client(state, client_id);
                self.unlock_quietly(&[job.id]).await;
                false
            }
            Err(_) => {
                warn!(client_id, "write timed out, dropping client");
                self.drop_client(state, client_id);
                self.unlock_quietly(&[job.id]).await;
                false
            }
        }
    }

    /// Unlock any prefetch bucket whose oldest entry has gone stale; a stuck
    /// bucket means no worker under that config is asking for work.
    async fn unlock_timed_out_prefetched_jobs(&self, state: &mut BrokerState) {
        let timeout =
            Duration::from_secs_f64(self.settings.parent_process.prefetched_jobs_timeout);
        let mut stale: Vec<i64> = Vec::new();
        for bucket in state.prefetched.values_mut() {
            let Some(oldest) = bucket.front() else { continue };
            if oldest.locked_since.elapsed() < timeout {
                continue;
            }
            stale.extend(bucket.iter().map(|p| p.job.id));
            bucket.clear();
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "unlocking timed out prefetched jobs");
            self.unlock_quietly(&stale).await;
        }
    }

    async fn release_all_prefetched(&self, state: &mut BrokerState) {
        let ids: Vec<i64> = state
            .prefetched
            .values()
            .flat_map(|bucket| bucket.iter().map(|p| p.job.id))
            .collect();
        state.prefetched.clear();
        if !ids.is_empty() {
            info!(count = ids.len(), "releasing prefetched jobs on shutdown");
            self.unlock_quietly(&ids).await;
        }
    }

    async fn unlock_quietly(&self, ids: &[i64]) {
        if let Err(err) = self.store.unlock(ids).await {
            warn!(error = %err, job_ids = ?ids, "failed to unlock jobs");
        }
    }

    fn loop_timeout(&self) -> Duration {
        let stagger = self.settings.sleep_delay_stagger;
        let jitter = if stagger > 0.0 {
            rand::thread_rng().gen_range(0.0..stagger)
        } else {
            0.0
        };
        Duration::from_secs_f64(self.settings.sleep_delay + jitter)
    }

    fn orphan_sweep_jitter(&self) -> Duration {
        let max = ORPHAN_SWEEP_INTERVAL.as_secs_f64();
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..max))
    }
}
