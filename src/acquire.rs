//! Acquisition orchestrator. Resolves each discovery event to a terminal
//! result: dedup short-circuit, then a direct probe against the announcing
//! peer, then the swarm fallback with in-flight coalescing. Callers always
//! get a status back; nothing here propagates a panic or blocks unbounded.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::timeout;

use crate::config::Config;
use crate::dedup::Membership;
use crate::fetch::FetchError;
use crate::info;
use crate::model::{AcquireStatus, HashEvent, InfoHash, MetadataResult};
use crate::stats::Stats;

/// Namespace for info-hashes with successfully obtained metadata.
pub const NS_INFOHASH: &str = "infohash";
/// Namespace for `hash|ip|port` direct attempts; one attempt per peer, ever.
pub const NS_PEER: &str = "peer";

/// A single way of obtaining raw info-dictionary bytes for a hash.
pub trait AcquireStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn attempt(
        &self,
        hash: InfoHash,
        peer: Option<SocketAddr>,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

type Failure = (AcquireStatus, String);
type SharedOutcome = Result<Bytes, Failure>;

enum Role {
    Lead(OwnedSemaphorePermit, watch::Sender<Option<SharedOutcome>>),
    Join(watch::Receiver<Option<SharedOutcome>>),
    Reject,
}

pub struct Acquirer<D, S, M> {
    cfg: Arc<Config>,
    direct: D,
    swarm: S,
    membership: Arc<M>,
    stats: Arc<Stats>,
    direct_pool: Arc<Semaphore>,
    swarm_pool: Arc<Semaphore>,
    inflight: Mutex<HashMap<InfoHash, watch::Receiver<Option<SharedOutcome>>>>,
}

impl<D, S, M> Acquirer<D, S, M>
where
    D: AcquireStrategy,
    S: AcquireStrategy,
    M: Membership,
{
    pub fn new(cfg: Arc<Config>, direct: D, swarm: S, membership: Arc<M>, stats: Arc<Stats>) -> Self {
        let direct_pool = Arc::new(Semaphore::new(cfg.direct_pool_size.max(1)));
        let swarm_pool = Arc::new(Semaphore::new(cfg.swarm_pool_size.max(1)));
        Acquirer {
            cfg,
            direct,
            swarm,
            membership,
            stats,
            direct_pool,
            swarm_pool,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves one discovery event. Always returns a terminal status within
    /// the configured deadlines.
    pub async fn acquire(&self, event: HashEvent) -> MetadataResult {
        let started = Instant::now();
        let hash = event.hash;
        self.stats.event();

        if self.membership.exists(NS_INFOHASH, &hash.to_string()) {
            self.stats.duplicate();
            tracing::debug!(hash = %hash, "acquire: already handled");
            return MetadataResult::duplicate(hash, started.elapsed());
        }

        let mut last_failure: Option<Failure> = None;

        if self.cfg.direct_enabled {
            if let Some(peer) = event.peer {
                match self.try_direct(hash, peer).await {
                    Some(Ok(bytes)) => match self.verified(hash, bytes) {
                        Ok(raw) => return self.complete(hash, raw, self.direct.name(), started),
                        Err(failure) => last_failure = Some(failure),
                    },
                    Some(Err(err)) => last_failure = Some((err.status(), err.to_string())),
                    None => {}
                }
            }
        }

        if self.cfg.swarm_enabled {
            match self.swarm_coalesced(hash).await {
                Ok(raw) => return self.complete(hash, raw, self.swarm.name(), started),
                Err((status, reason)) => {
                    // a swarm verdict outranks the direct one unless the swarm
                    // merely found nobody while the direct probe reached a peer
                    if status != AcquireStatus::NoPeers || last_failure.is_none() {
                        last_failure = Some((status, reason));
                    }
                }
            }
        }

        let (status, reason) = last_failure.unwrap_or((
            AcquireStatus::NoPeers,
            "no acquisition path available".to_string(),
        ));
        self.stats.failure();
        tracing::debug!(hash = %hash, status = %status, reason = %reason, "acquire: exhausted");
        MetadataResult::failure(hash, status, reason, started.elapsed())
    }

    /// One bounded attempt against the announcing peer. Returns `None` when
    /// the peer was already tried once and is skipped.
    async fn try_direct(
        &self,
        hash: InfoHash,
        peer: SocketAddr,
    ) -> Option<Result<Vec<u8>, FetchError>> {
        let peer_key = format!("{}|{}|{}", hash, peer.ip(), peer.port());
        if self.membership.exists(NS_PEER, &peer_key) {
            self.stats.direct_skip();
            tracing::trace!(hash = %hash, peer = %peer, "direct: peer already attempted");
            return None;
        }

        let _permit = match self.direct_pool.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return None,
        };
        self.stats.direct_attempt();
        let outcome = match timeout(
            Duration::from_secs(self.cfg.direct_attempt_timeout_secs),
            self.direct.attempt(hash, Some(peer)),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(FetchError::Timeout("direct attempt")),
        };
        // one attempt per peer, ever, success or not
        self.membership.add(NS_PEER, &peer_key);
        if let Err(err) = &outcome {
            tracing::debug!(hash = %hash, peer = %peer, error = %err, "direct: attempt failed");
        }
        Some(outcome)
    }

    /// Runs the swarm strategy for a hash, admitting at most the configured
    /// number of leaders and attaching any concurrent caller for the same
    /// hash to the in-flight fetch.
    async fn swarm_coalesced(&self, hash: InfoHash) -> SharedOutcome {
        let role = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(&hash) {
                Role::Join(rx.clone())
            } else {
                match self.swarm_pool.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(hash, rx);
                        Role::Lead(permit, tx)
                    }
                    Err(_) => Role::Reject,
                }
            }
        };

        match role {
            Role::Reject => {
                self.stats.reject();
                Err((
                    AcquireStatus::RejectedAdmission,
                    "swarm pool at capacity".to_string(),
                ))
            }
            Role::Join(mut rx) => {
                self.stats.coalesce();
                tracing::debug!(hash = %hash, "swarm: joining in-flight fetch");
                match rx.wait_for(|slot| slot.is_some()).await {
                    Ok(slot) => match (*slot).clone() {
                        Some(outcome) => outcome,
                        None => Err((AcquireStatus::Error, "in-flight fetch abandoned".to_string())),
                    },
                    Err(_) => Err((AcquireStatus::Error, "in-flight fetch abandoned".to_string())),
                }
            }
            Role::Lead(_permit, tx) => {
                self.stats.swarm_attempt();
                let outcome = match timeout(
                    Duration::from_secs(self.cfg.swarm_attempt_timeout_secs),
                    self.swarm.attempt(hash, None),
                )
                .await
                {
                    Ok(Ok(bytes)) => self.verified(hash, bytes),
                    Ok(Err(err)) => Err((err.status(), err.to_string())),
                    Err(_) => Err((AcquireStatus::Timeout, "swarm window elapsed".to_string())),
                };
                self.inflight.lock().await.remove(&hash);
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
        }
    }

    /// Digest check for bytes claimed to be the info dictionary of `hash`.
    /// Forged bytes count as a protocol violation by whichever peer served
    /// them.
    fn verified(&self, hash: InfoHash, bytes: Vec<u8>) -> Result<Bytes, Failure> {
        if InfoHash::for_bytes(&bytes) == hash {
            Ok(Bytes::from(bytes))
        } else {
            tracing::warn!(hash = %hash, "acquire: metadata digest mismatch");
            Err((
                AcquireStatus::PeerMismatch,
                "metadata digest mismatch".to_string(),
            ))
        }
    }

    /// Parses verified bytes, marks the main dedup key and builds the
    /// success result. The key is only marked here, never on failure.
    fn complete(
        &self,
        hash: InfoHash,
        raw: Bytes,
        strategy: &'static str,
        started: Instant,
    ) -> MetadataResult {
        match info::parse(hash, &raw) {
            Ok(parsed) => {
                self.membership.add(NS_INFOHASH, &hash.to_string());
                self.stats.success(strategy);
                tracing::info!(
                    hash = %hash,
                    strategy,
                    name = %parsed.name,
                    size = parsed.total_size,
                    "acquire: metadata obtained"
                );
                MetadataResult {
                    hash,
                    status: AcquireStatus::Success,
                    strategy: Some(strategy),
                    name: Some(parsed.name),
                    total_size: parsed.total_size,
                    files: parsed.files,
                    raw_info: Some(raw),
                    reason: None,
                    elapsed: started.elapsed(),
                }
            }
            Err(err) => {
                self.stats.failure();
                tracing::debug!(hash = %hash, error = %err, "acquire: undecodable metadata");
                MetadataResult::failure(
                    hash,
                    AcquireStatus::DecodeError,
                    err.to_string(),
                    started.elapsed(),
                )
            }
        }
    }
}
