//! Agent registry: the linked-id set, the session table, and link/unlink.
//!
//! Every mutation runs under one async mutex so channel indices are always
//! computed from a consistent snapshot of the linked set. Lookups only take a
//! short read lock and never wait behind a slow link.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use tokio::{sync::Mutex, task::JoinSet};

use crate::error::{FleetError, Result};
use crate::session::{AgentId, AgentSession, SessionConfig};
use crate::store::LinkStore;
use crate::transport::TransportProvider;

/// Channel index of every id: its rank in ascending order.
pub fn channel_indices(linked: &BTreeSet<AgentId>) -> BTreeMap<AgentId, usize> {
    linked.iter().enumerate().map(|(rank, id)| (*id, rank)).collect()
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub session: SessionConfig,
    /// Pause between opening successive new sessions in one link call.
    pub link_stagger: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            link_stagger: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LinkOutcome {
    pub opened: Vec<AgentId>,
    pub already_linked: Vec<AgentId>,
    pub failed: Vec<(AgentId, String)>,
    /// Existing sessions whose channel index moved but were left open.
    pub stale: Vec<AgentId>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct UnlinkOutcome {
    pub closed: Vec<AgentId>,
    pub not_linked: Vec<AgentId>,
}

#[derive(Default)]
struct Inner {
    linked: BTreeSet<AgentId>,
    sessions: HashMap<AgentId, Arc<AgentSession>>,
}

pub struct Registry {
    provider: Arc<dyn TransportProvider>,
    config: RegistryConfig,
    store: Option<LinkStore>,
    inner: RwLock<Inner>,
    mutation: Mutex<()>,
}

impl Registry {
    pub fn new(provider: Arc<dyn TransportProvider>, config: RegistryConfig) -> Self {
        Self {
            provider,
            config,
            store: None,
            inner: RwLock::new(Inner::default()),
            mutation: Mutex::new(()),
        }
    }

    /// Persist the linked set to `store` after every mutation.
    pub fn with_store(mut self, store: LinkStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Add `ids` to the linked set and open a session for each id that does
    /// not have one yet.
    ///
    /// Channel indices are recomputed for the whole set, but sessions that were
    /// already open keep the channel they were opened on.
    pub async fn link(&self, ids: &[AgentId]) -> LinkOutcome {
        let _guard = self.mutation.lock().await;
        let mut outcome = LinkOutcome::default();

        let (channels, to_open) = {
            let mut inner = self.inner.write();
            inner.linked.extend(ids.iter().copied());
            let channels = channel_indices(&inner.linked);

            for (id, session) in &inner.sessions {
                if channels.get(id) != Some(&session.channel()) {
                    outcome.stale.push(*id);
                }
            }

            let requested: BTreeSet<AgentId> = ids.iter().copied().collect();
            let mut to_open = Vec::new();
            for id in requested {
                if inner.sessions.contains_key(&id) {
                    outcome.already_linked.push(id);
                } else {
                    to_open.push(id);
                }
            }
            (channels, to_open)
        };
        outcome.stale.sort();
        self.persist();

        if !outcome.stale.is_empty() {
            tracing::warn!(
                target = "northstar::registry",
                agents = ?outcome.stale,
                "linked set changed; existing sessions keep their previous channel"
            );
        }

        for (n, id) in to_open.into_iter().enumerate() {
            if n > 0 && !self.config.link_stagger.is_zero() {
                tokio::time::sleep(self.config.link_stagger).await;
            }
            let channel = channels.get(&id).copied().unwrap_or_default();
            match AgentSession::open(id, channel, self.provider.as_ref(), self.config.session.clone()) {
                Ok(session) => {
                    self.inner.write().sessions.insert(id, session);
                    outcome.opened.push(id);
                }
                Err(error) => {
                    tracing::warn!(target = "northstar::registry", agent_id = %id, channel, error = %error, "failed to open session");
                    outcome.failed.push((id, error.to_string()));
                }
            }
        }

        tracing::info!(
            target = "northstar::registry",
            opened = outcome.opened.len(),
            already_linked = outcome.already_linked.len(),
            failed = outcome.failed.len(),
            "link complete"
        );
        outcome
    }

    /// Remove `ids` from the linked set and tear down their sessions.
    pub async fn unlink(&self, ids: &[AgentId]) -> UnlinkOutcome {
        let _guard = self.mutation.lock().await;
        let mut outcome = UnlinkOutcome::default();

        let removed: Vec<Arc<AgentSession>> = {
            let mut inner = self.inner.write();
            let requested: BTreeSet<AgentId> = ids.iter().copied().collect();
            let mut removed = Vec::new();
            for id in requested {
                let was_linked = inner.linked.remove(&id);
                match inner.sessions.remove(&id) {
                    Some(session) => removed.push(session),
                    None if was_linked => outcome.closed.push(id),
                    None => outcome.not_linked.push(id),
                }
            }
            removed
        };
        self.persist();

        outcome.closed.extend(teardown(removed, None).await.closed);
        outcome.closed.sort();
        outcome
    }

    /// Tear down every session and clear the linked set.
    pub async fn unlink_all(&self) -> UnlinkOutcome {
        let (outcome, _) = self.drain(None).await;
        outcome
    }

    /// Unlink everything, then release provider-wide resources.
    pub async fn shutdown(&self) {
        self.shutdown_within(None).await;
    }

    /// Like [`shutdown`](Self::shutdown), but stop waiting after `grace`.
    ///
    /// Sessions still tearing down at the deadline keep running their KILL
    /// burst in the background; their ids are returned. The provider is only
    /// shut down once every session has finished.
    pub async fn shutdown_within(&self, grace: Option<Duration>) -> Vec<AgentId> {
        let (outcome, unfinished) = self.drain(grace).await;
        if unfinished.is_empty() {
            self.provider.shutdown();
        }
        tracing::info!(
            target = "northstar::registry",
            closed = outcome.closed.len(),
            unfinished = unfinished.len(),
            "registry shut down"
        );
        unfinished
    }

    async fn drain(&self, grace: Option<Duration>) -> (UnlinkOutcome, Vec<AgentId>) {
        let _guard = self.mutation.lock().await;

        let (linked, removed) = {
            let mut inner = self.inner.write();
            let linked = std::mem::take(&mut inner.linked);
            let removed: Vec<Arc<AgentSession>> = inner.sessions.drain().map(|(_, s)| s).collect();
            (linked, removed)
        };
        self.persist();

        let torn_down = teardown(removed, grace).await;
        let outcome = UnlinkOutcome {
            closed: linked.into_iter().collect(),
            not_linked: Vec::new(),
        };
        (outcome, torn_down.unfinished)
    }

    pub fn resolve(&self, id: AgentId) -> Result<Arc<AgentSession>> {
        self.inner
            .read()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(FleetError::NotConnected(id))
    }

    /// Resolve each id independently, keeping the request order.
    pub fn resolve_many(&self, ids: &[AgentId]) -> Vec<(AgentId, Result<Arc<AgentSession>>)> {
        let inner = self.inner.read();
        ids.iter()
            .map(|id| {
                let session = inner.sessions.get(id).cloned().ok_or(FleetError::NotConnected(*id));
                (*id, session)
            })
            .collect()
    }

    pub fn linked_ids(&self) -> Vec<AgentId> {
        self.inner.read().linked.iter().copied().collect()
    }

    /// Channel index each linked id would get from the current linked set.
    pub fn channel_map(&self) -> BTreeMap<AgentId, usize> {
        channel_indices(&self.inner.read().linked)
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let linked = self.inner.read().linked.clone();
        if let Err(error) = store.save(&linked) {
            tracing::warn!(target = "northstar::registry", path = %store.path().display(), error = %error, "failed to persist linked set");
        }
    }
}

/// Shut sessions down concurrently; each runs its own KILL burst.
struct Teardown {
    closed: Vec<AgentId>,
    unfinished: Vec<AgentId>,
}

/// Shut sessions down concurrently. With a `grace`, tasks still running at
/// the deadline are detached, not aborted, so no KILL burst is cut short.
async fn teardown(sessions: Vec<Arc<AgentSession>>, grace: Option<Duration>) -> Teardown {
    let mut pending: BTreeSet<AgentId> = sessions.iter().map(|s| s.id()).collect();
    let mut set = JoinSet::new();
    for session in sessions {
        set.spawn(async move {
            session.shutdown().await;
            session.id()
        });
    }

    let deadline = grace.map(|grace| tokio::time::Instant::now() + grace);
    let mut closed = Vec::new();
    loop {
        let joined = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(joined) => joined,
                Err(_) => break,
            },
            None => set.join_next().await,
        };
        let Some(joined) = joined else { break };
        match joined {
            Ok(id) => {
                pending.remove(&id);
                closed.push(id);
            }
            Err(error) => {
                tracing::warn!(target = "northstar::registry", error = %error, "session teardown task failed");
            }
        }
    }

    if set.is_empty() {
        return Teardown {
            closed,
            unfinished: Vec::new(),
        };
    }
    let unfinished: Vec<AgentId> = pending.into_iter().collect();
    tracing::warn!(
        target = "northstar::registry",
        unfinished = ?unfinished,
        "session teardown still running after the grace period"
    );
    set.detach_all();
    Teardown { closed, unfinished }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimProvider;

    fn id(raw: u32) -> AgentId {
        AgentId::new(raw).unwrap()
    }

    fn ids(raw: &[u32]) -> Vec<AgentId> {
        raw.iter().map(|r| id(*r)).collect()
    }

    fn registry(provider: Arc<SimProvider>) -> Registry {
        Registry::new(
            provider,
            RegistryConfig {
                session: SessionConfig {
                    kill_retries: 20,
                    ..SessionConfig::default()
                },
                link_stagger: Duration::from_millis(50),
            },
        )
    }

    #[test]
    fn channel_index_is_sorted_rank() {
        let linked: BTreeSet<AgentId> = ids(&[5, 2, 9]).into_iter().collect();
        let expected: BTreeMap<AgentId, usize> = [(id(2), 0), (id(5), 1), (id(9), 2)].into_iter().collect();
        assert_eq!(channel_indices(&linked), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn link_assigns_ranks_and_relink_shifts_them() {
        let provider = Arc::new(SimProvider::new());
        let registry = registry(provider.clone());

        let outcome = registry.link(&ids(&[5, 2, 9])).await;
        assert_eq!(outcome.opened, ids(&[2, 5, 9]));
        let map = registry.channel_map();
        assert_eq!(map, [(id(2), 0), (id(5), 1), (id(9), 2)].into_iter().collect());
        for (agent, channel) in &map {
            assert_eq!(registry.resolve(*agent).unwrap().channel(), *channel);
        }
        assert_eq!(provider.agent(id(5)).unwrap().uri().to_string(), "radio:/1/05/2/E7E7E7E301");

        let outcome = registry.link(&ids(&[1])).await;
        assert_eq!(outcome.opened, ids(&[1]));
        assert_eq!(outcome.stale, ids(&[2, 5, 9]));
        assert_eq!(
            registry.channel_map(),
            [(id(1), 0), (id(2), 1), (id(5), 2), (id(9), 3)].into_iter().collect()
        );
        // Existing sessions keep the channel they were opened on.
        assert_eq!(registry.resolve(id(2)).unwrap().channel(), 0);
        assert_eq!(registry.resolve(id(1)).unwrap().channel(), 0);

        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn relinking_a_linked_id_opens_nothing() {
        let provider = Arc::new(SimProvider::new());
        let registry = registry(provider);
        registry.link(&ids(&[3])).await;
        let first = registry.resolve(id(3)).unwrap();

        let outcome = registry.link(&ids(&[3])).await;
        assert!(outcome.opened.is_empty());
        assert_eq!(outcome.already_linked, ids(&[3]));
        assert!(Arc::ptr_eq(&first, &registry.resolve(id(3)).unwrap()));
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn link_staggers_new_sessions() {
        let provider = Arc::new(SimProvider::new());
        let registry = registry(provider);
        let start = tokio::time::Instant::now();
        registry.link(&ids(&[1, 2, 3])).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_stays_linked_but_unresolvable() {
        let provider = Arc::new(SimProvider::new());
        provider.set_unreachable(id(4));
        let registry = registry(provider);

        let outcome = registry.link(&ids(&[3, 4])).await;
        assert_eq!(outcome.opened, ids(&[3]));
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(registry.linked_ids(), ids(&[3, 4]));
        assert!(matches!(registry.resolve(id(4)), Err(FleetError::NotConnected(_))));
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unlink_named_ids() {
        let provider = Arc::new(SimProvider::new());
        let registry = registry(provider);
        registry.link(&ids(&[1, 2, 3])).await;
        let two = registry.resolve(id(2)).unwrap();

        let outcome = registry.unlink(&ids(&[2, 7])).await;
        assert_eq!(outcome.closed, ids(&[2]));
        assert_eq!(outcome.not_linked, ids(&[7]));
        assert!(!two.is_alive());
        assert_eq!(registry.linked_ids(), ids(&[1, 3]));
        assert!(registry.resolve(id(1)).unwrap().is_alive());
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unlink_all_empties_and_kills_every_session() {
        let provider = Arc::new(SimProvider::new());
        let registry = registry(provider);
        registry.link(&ids(&[4, 8, 6])).await;
        let sessions: Vec<Arc<AgentSession>> = ids(&[4, 6, 8])
            .into_iter()
            .map(|i| registry.resolve(i).unwrap())
            .collect();

        let outcome = registry.unlink_all().await;
        assert_eq!(outcome.closed, ids(&[4, 6, 8]));
        assert!(registry.linked_ids().is_empty());
        assert_eq!(registry.session_count(), 0);
        assert!(sessions.iter().all(|s| !s.is_alive()));
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_many_reports_each_id() {
        let provider = Arc::new(SimProvider::new());
        let registry = registry(provider);
        registry.link(&ids(&[1, 3])).await;

        let resolved = registry.resolve_many(&ids(&[1, 2, 3]));
        assert!(resolved[0].1.is_ok());
        assert!(matches!(resolved[1].1, Err(FleetError::NotConnected(_))));
        assert!(resolved[2].1.is_ok());
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn linked_set_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = LinkStore::new(dir.path().join("links.json"));
        let provider = Arc::new(SimProvider::new());
        let registry = registry(provider).with_store(store.clone());

        registry.link(&ids(&[9, 5])).await;
        assert_eq!(store.load().unwrap(), ids(&[5, 9]).into_iter().collect());
        registry.unlink(&ids(&[5])).await;
        assert_eq!(store.load().unwrap(), ids(&[9]).into_iter().collect());
        registry.shutdown().await;
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn grace_expiry_leaves_kill_burst_running() {
        let provider = Arc::new(SimProvider::new());
        let registry = Registry::new(
            provider.clone(),
            RegistryConfig {
                session: SessionConfig {
                    kill_retries: 200_000,
                    ..SessionConfig::default()
                },
                link_stagger: Duration::ZERO,
            },
        );
        registry.link(&ids(&[4])).await;
        let session = registry.resolve(id(4)).unwrap();

        let unfinished = registry.shutdown_within(Some(Duration::from_millis(1))).await;
        assert_eq!(unfinished, ids(&[4]));
        assert_eq!(registry.session_count(), 0);

        // The burst was detached, not aborted: it still runs to the end.
        tokio::time::timeout(Duration::from_secs(30), async {
            while session.is_alive() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let agent = provider.agent(id(4)).unwrap();
        assert_eq!(agent.frames().last().map(Vec::as_slice), Some(&[40u8, 8][..]));
    }
}
