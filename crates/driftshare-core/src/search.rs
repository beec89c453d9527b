// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::events::{EventBus, NodeEvent};
use crate::identity::{FileHash, PeerIdentity, SharedFile, SharedFileSummary};
use crate::net::RequestTransport;
use crate::peers::PeerRegistry;
use crate::relay::protocol::RelayFileRef;
use crate::wire::{Message, SearchRequest, SearchResponse};

const DEDUP_CAPACITY: usize = 1024;

/// The node's shared-file index, keyed by the directory a file was shared
/// from. Hashes are computed when a file is added and cached with it.
#[derive(Debug, Default)]
pub struct ShareIndex {
    files: Mutex<HashMap<String, Vec<SharedFile>>>,
    relay_refs: Mutex<HashMap<FileHash, RelayFileRef>>,
}

impl ShareIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, directory: &str, file: SharedFile) {
        let mut files = self.files.lock().expect("share index poisoned");
        let entries = files.entry(directory.to_owned()).or_default();
        // replace a stale entry for the same logical name
        entries.retain(|existing| existing.logical_name != file.logical_name);
        entries.push(file);
    }

    pub fn add_path(
        &self,
        directory: &str,
        path: &Path,
        owner_peer_id: &str,
    ) -> anyhow::Result<SharedFile> {
        let file = SharedFile::from_path(path, owner_peer_id)?;
        self.add_file(directory, file.clone());
        Ok(file)
    }

    pub fn remove_file(&self, directory: &str, logical_name: &str) {
        let mut files = self.files.lock().expect("share index poisoned");
        if let Some(entries) = files.get_mut(directory) {
            entries.retain(|file| file.logical_name != logical_name);
            if entries.is_empty() {
                files.remove(directory);
            }
        }
    }

    /// Record that a shared file is mirrored on the relay; summaries for
    /// it will carry the ref from now on.
    pub fn attach_relay_ref(&self, file_hash: FileHash, relay_ref: RelayFileRef) {
        self.relay_refs
            .lock()
            .expect("share index poisoned")
            .insert(file_hash, relay_ref);
    }

    pub fn all_files(&self) -> Vec<SharedFile> {
        let files = self.files.lock().expect("share index poisoned");
        files.values().flatten().cloned().collect()
    }

    pub fn file_count(&self) -> usize {
        let files = self.files.lock().expect("share index poisoned");
        files.values().map(Vec::len).sum()
    }

    /// Case-insensitive substring match against logical names.
    pub fn find_matches(&self, query: &str) -> Vec<SharedFileSummary> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return vec![];
        }
        let relay_refs = self.relay_refs.lock().expect("share index poisoned");
        self.all_files()
            .into_iter()
            .filter(|file| file.logical_name.to_lowercase().contains(&needle))
            .map(|file| {
                let mut summary = file.summary();
                summary.relay_ref = relay_refs.get(&file.file_hash).cloned();
                summary
            })
            .collect()
    }

    pub fn relay_ref_for(&self, file_hash: FileHash) -> Option<RelayFileRef> {
        self.relay_refs
            .lock()
            .expect("share index poisoned")
            .get(&file_hash)
            .cloned()
    }

    pub fn find_by_hash(&self, file_hash: FileHash) -> Option<SharedFile> {
        self.all_files()
            .into_iter()
            .find(|file| file.file_hash == file_hash)
    }

    /// Resolve an incoming transfer request. Requests address files by
    /// hash (hex), logical name, or the exact shared path; anything else
    /// is refused, so transfer serving can never escape the share set.
    pub fn resolve_request(&self, reference: &str) -> Option<SharedFile> {
        if let Ok(hash) = FileHash::from_hex(reference) {
            if let Some(file) = self.find_by_hash(hash) {
                return Some(file);
            }
        }
        self.all_files().into_iter().find(|file| {
            file.logical_name == reference || file.local_path == Path::new(reference)
        })
    }
}

/// Bounded set of recently seen search request ids. Oldest entries are
/// evicted once the capacity is reached.
#[derive(Debug)]
pub struct RequestDedup {
    inner: Mutex<DedupInner>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct DedupInner {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl RequestDedup {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(DedupInner::default()),
            capacity,
        }
    }

    /// Returns true when the id was fresh (and is now recorded).
    pub fn check_and_insert(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("dedup poisoned");
        if inner.seen.contains(request_id) {
            return false;
        }
        if inner.order.len() >= self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.seen.remove(&evicted);
            }
        }
        inner.seen.insert(request_id.to_owned());
        inner.order.push_back(request_id.to_owned());
        true
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner
            .lock()
            .expect("dedup poisoned")
            .seen
            .contains(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup poisoned").seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestDedup {
    fn default() -> Self {
        Self::new(DEDUP_CAPACITY)
    }
}

/// Flooded search: answer queries from the local index, forward them with
/// a decremented TTL, and aggregate fan-out responses for local queries.
pub struct SearchService {
    index: Arc<ShareIndex>,
    dedup: RequestDedup,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn RequestTransport>,
    events: EventBus,
    local: PeerIdentity,
    search_timeout: Duration,
    /// Local queries still being aggregated, keyed by request id.
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<SearchResponse>>>,
}

impl SearchService {
    pub fn new(
        index: Arc<ShareIndex>,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn RequestTransport>,
        events: EventBus,
        local: PeerIdentity,
        search_timeout: Duration,
    ) -> Self {
        Self {
            index,
            dedup: RequestDedup::default(),
            registry,
            transport,
            events,
            local,
            search_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn dedup(&self) -> &RequestDedup {
        &self.dedup
    }

    /// Handle a query received over an authenticated channel. Replies with
    /// local matches; a duplicate request id gets an empty reply and no
    /// forwarding. `via_peer` is the immediate sender, excluded from the
    /// forward fan-out alongside the origin.
    pub fn handle_request(
        self: &Arc<Self>,
        request: SearchRequest,
        via_peer: Option<&str>,
    ) -> SearchResponse {
        if !self.dedup.check_and_insert(&request.request_id) {
            return SearchResponse {
                request_id: request.request_id,
                source: self.local.clone(),
                files: vec![],
            };
        }

        let files = self.index.find_matches(&request.query);
        debug!(
            query = %request.query,
            matches = files.len(),
            ttl = request.ttl,
            "handling search request"
        );

        if request.ttl > 0 {
            let service = Arc::clone(self);
            let mut forwarded = request.clone();
            forwarded.ttl -= 1;
            let via = via_peer.map(ToOwned::to_owned);
            tokio::spawn(async move {
                service.forward_request(forwarded, via).await;
            });
        }

        SearchResponse {
            request_id: request.request_id,
            source: self.local.clone(),
            files,
        }
    }

    /// Fan the request out to every other known peer; any non-empty reply
    /// is relayed back to the origin over a fresh channel. Per-peer
    /// failures are swallowed; one bad peer must not break the flood.
    async fn forward_request(self: Arc<Self>, request: SearchRequest, via_peer: Option<String>) {
        let mut tasks = JoinSet::new();
        for peer in self.registry.known_peers() {
            if peer.peer_id == request.origin.peer_id
                || Some(peer.peer_id.as_str()) == via_peer.as_deref()
            {
                continue;
            }
            let service = Arc::clone(&self);
            let request = request.clone();
            tasks.spawn(async move {
                let reply = service
                    .transport
                    .request(
                        &peer,
                        Message::SearchRequest(request.clone()),
                        service.search_timeout,
                    )
                    .await;
                match reply {
                    Ok(Message::SearchResponse(response)) if !response.files.is_empty() => {
                        let relayed = service
                            .transport
                            .request(
                                &request.origin,
                                Message::SearchResponse(response),
                                service.search_timeout,
                            )
                            .await;
                        if let Err(err) = relayed {
                            debug!(origin = %request.origin.peer_id, error = %err,
                                "failed to relay search response to origin");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(peer = %peer.peer_id, error = %err, "search forward failed");
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// A response relayed to us as the query origin by an intermediate
    /// peer. Routed into the matching live aggregation, if any.
    pub fn handle_forwarded_response(&self, response: SearchResponse) {
        if response.files.is_empty() {
            return;
        }
        let pending = self.pending.lock().expect("pending searches poisoned");
        if let Some(sink) = pending.get(&response.request_id) {
            let _ = sink.send(response);
        } else {
            debug!(request_id = %response.request_id, "late search response dropped");
        }
    }

    /// Issue a query: fan out to every known peer, stream responses as
    /// they arrive (as `SearchResult` events), and finish when the timer
    /// expires or every direct peer has replied.
    pub async fn search(self: &Arc<Self>, query: &str, ttl: u8) -> anyhow::Result<SearchOutcome> {
        let request_id = uuid::Uuid::new_v4().to_string();
        // our own id goes into the dedup set so the flood cannot bounce
        // the request back through us
        self.dedup.check_and_insert(&request_id);

        let request = SearchRequest {
            request_id: request_id.clone(),
            origin: self.local.clone(),
            query: query.to_owned(),
            ttl,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<SearchResponse>();
        self.pending
            .lock()
            .expect("pending searches poisoned")
            .insert(request_id.clone(), tx.clone());

        let peers = self.registry.known_peers();
        let peer_total = peers.len();
        let mut tasks: JoinSet<()> = JoinSet::new();
        for peer in peers {
            let service = Arc::clone(self);
            let request = request.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                match service
                    .transport
                    .request(&peer, Message::SearchRequest(request), service.search_timeout)
                    .await
                {
                    Ok(Message::SearchResponse(response)) if !response.files.is_empty() => {
                        let _ = tx.send(response);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(peer = %peer.peer_id, error = %err, "search fan-out failed");
                    }
                }
            });
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + self.search_timeout;
        let mut responses: Vec<SearchResponse> = Vec::new();
        let mut peers_done = false;
        loop {
            tokio::select! {
                joined = tasks.join_next(), if !peers_done => {
                    if joined.is_none() {
                        peers_done = true;
                    }
                }
                received = rx.recv() => {
                    match received {
                        Some(response) => {
                            self.events.emit(NodeEvent::SearchResult {
                                request_id: request_id.clone(),
                                source: response.source.clone(),
                                files: response.files.clone(),
                            });
                            responses.push(response);
                        }
                        // sender side only closes once the pending entry
                        // is dropped, so treat as spurious
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
            if peers_done && tasks.is_empty() {
                // direct fan-out complete; give distant relays until the
                // deadline only if nothing arrived yet
                if peer_total == 0 || !responses.is_empty() {
                    break;
                }
            }
        }

        self.pending
            .lock()
            .expect("pending searches poisoned")
            .remove(&request_id);
        while let Ok(response) = rx.try_recv() {
            self.events.emit(NodeEvent::SearchResult {
                request_id: request_id.clone(),
                source: response.source.clone(),
                files: response.files.clone(),
            });
            responses.push(response);
        }

        self.events.emit(NodeEvent::SearchComplete {
            request_id: request_id.clone(),
        });

        Ok(SearchOutcome {
            request_id,
            responses,
        })
    }
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub request_id: String,
    pub responses: Vec<SearchResponse>,
}

impl SearchOutcome {
    /// Flattened results with duplicates collapsed by
    /// `(owner_peer_id, file_hash)`.
    pub fn unique_files(&self) -> Vec<SharedFileSummary> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for response in &self.responses {
            for file in &response.files {
                if seen.insert((file.owner_peer_id.clone(), file.file_hash)) {
                    out.push(file.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Instant;

    fn identity(id: &str) -> PeerIdentity {
        PeerIdentity {
            peer_id: id.to_owned(),
            display_name: id.to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 9000,
            public_key: [0u8; 32],
        }
    }

    fn shared_file(name: &str, owner: &str, hash_byte: u8) -> SharedFile {
        SharedFile {
            local_path: format!("/srv/{name}").into(),
            logical_name: name.to_owned(),
            size: 42,
            file_hash: FileHash([hash_byte; 32]),
            owner_peer_id: owner.to_owned(),
        }
    }

    /// Routes requests straight to the target service's handler, so flood
    /// behavior is testable without sockets.
    struct LoopbackNet {
        services: Mutex<HashMap<String, Arc<SearchService>>>,
        origin_inbox: Mutex<Vec<SearchResponse>>,
    }

    struct LoopbackTransport {
        net: Arc<LoopbackNet>,
        sender_id: String,
    }

    #[async_trait]
    impl RequestTransport for LoopbackTransport {
        async fn request(
            &self,
            peer: &PeerIdentity,
            message: Message,
            _timeout: Duration,
        ) -> anyhow::Result<Message> {
            match message {
                Message::SearchRequest(request) => {
                    let target = {
                        let services = self.net.services.lock().expect("services");
                        services.get(&peer.peer_id).cloned()
                    };
                    let Some(target) = target else {
                        anyhow::bail!("peer {} unreachable", peer.peer_id);
                    };
                    let response = target.handle_request(request, Some(self.sender_id.as_str()));
                    Ok(Message::SearchResponse(response))
                }
                Message::SearchResponse(response) => {
                    // relayed to origin
                    let target = {
                        let services = self.net.services.lock().expect("services");
                        services.get(&peer.peer_id).cloned()
                    };
                    if let Some(target) = target {
                        target.handle_forwarded_response(response.clone());
                    }
                    self.net
                        .origin_inbox
                        .lock()
                        .expect("inbox")
                        .push(response);
                    Ok(Message::Ok)
                }
                other => anyhow::bail!("unexpected message {other:?}"),
            }
        }
    }

    fn build_node(
        id: &str,
        net: &Arc<LoopbackNet>,
        registry: Arc<PeerRegistry>,
        files: &[SharedFile],
    ) -> Arc<SearchService> {
        let index = Arc::new(ShareIndex::new());
        for file in files {
            index.add_file("shared", file.clone());
        }
        let transport = Arc::new(LoopbackTransport {
            net: Arc::clone(net),
            sender_id: id.to_owned(),
        });
        let service = Arc::new(SearchService::new(
            index,
            registry,
            transport,
            EventBus::new(64),
            identity(id),
            Duration::from_millis(500),
        ));
        net.services
            .lock()
            .expect("services")
            .insert(id.to_owned(), Arc::clone(&service));
        service
    }

    #[test]
    fn index_matches_case_insensitive_substring() {
        let index = ShareIndex::new();
        index.add_file("shared", shared_file("Alpha.bin", "a", 1));
        index.add_file("shared", shared_file("beta.txt", "a", 2));

        assert_eq!(index.find_matches("ALPHA").len(), 1);
        assert_eq!(index.find_matches("a").len(), 2);
        assert!(index.find_matches("gamma").is_empty());
        assert!(index.find_matches("").is_empty());
    }

    #[test]
    fn index_resolves_by_hash_name_and_path() {
        let index = ShareIndex::new();
        let file = shared_file("alpha.bin", "a", 7);
        index.add_file("shared", file.clone());

        assert!(index.resolve_request(&file.file_hash.to_hex()).is_some());
        assert!(index.resolve_request("alpha.bin").is_some());
        assert!(index.resolve_request("/srv/alpha.bin").is_some());
        assert!(index.resolve_request("/etc/passwd").is_none());
    }

    #[test]
    fn removing_a_file_empties_its_directory() {
        let index = ShareIndex::new();
        index.add_file("docs", shared_file("a.txt", "me", 1));
        index.remove_file("docs", "a.txt");
        assert_eq!(index.file_count(), 0);
    }

    #[test]
    fn dedup_is_bounded_and_rejects_duplicates() {
        let dedup = RequestDedup::new(2);
        assert!(dedup.check_and_insert("r1"));
        assert!(!dedup.check_and_insert("r1"));
        assert!(dedup.check_and_insert("r2"));
        assert!(dedup.check_and_insert("r3")); // evicts r1
        assert!(!dedup.contains("r1"));
        assert!(dedup.check_and_insert("r1"));
    }

    #[tokio::test]
    async fn duplicate_request_gets_empty_reply_and_no_forward() {
        let net = Arc::new(LoopbackNet {
            services: Mutex::new(HashMap::new()),
            origin_inbox: Mutex::new(vec![]),
        });
        let registry = Arc::new(PeerRegistry::new());
        let service = build_node("b", &net, registry, &[shared_file("alpha.bin", "b", 1)]);

        let request = SearchRequest {
            request_id: "req-1".to_owned(),
            origin: identity("a"),
            query: "alpha".to_owned(),
            ttl: 0,
        };
        let first = service.handle_request(request.clone(), Some("a"));
        assert_eq!(first.files.len(), 1);
        let second = service.handle_request(request, Some("a"));
        assert!(second.files.is_empty());
        assert_eq!(service.dedup().len(), 1);
    }

    #[tokio::test]
    async fn flooded_search_reaches_two_sharers_with_single_dedup_entry() {
        // Three peers: A shares alpha.bin, C shares alphabet.bin, B asks.
        let net = Arc::new(LoopbackNet {
            services: Mutex::new(HashMap::new()),
            origin_inbox: Mutex::new(vec![]),
        });
        let now = Instant::now();
        let registry_b = Arc::new(PeerRegistry::new());
        registry_b.observe_join(identity("a"), now).expect("join a");
        registry_b.observe_join(identity("c"), now).expect("join c");
        // A and C only know B, so each answers B's direct request once
        let registry_a = Arc::new(PeerRegistry::new());
        registry_a.observe_join(identity("b"), now).expect("join");
        let registry_c = Arc::new(PeerRegistry::new());
        registry_c.observe_join(identity("b"), now).expect("join");

        let _a = build_node("a", &net, registry_a, &[shared_file("alpha.bin", "a", 1)]);
        let _c = build_node("c", &net, registry_c, &[shared_file("alphabet.bin", "c", 2)]);
        let b = build_node("b", &net, registry_b, &[]);

        let outcome = b.search("alpha", 2).await.expect("search");
        let mut sources: Vec<String> = outcome
            .responses
            .iter()
            .map(|response| response.source.peer_id.clone())
            .collect();
        sources.sort();
        assert_eq!(sources, vec!["a".to_owned(), "c".to_owned()]);
        for response in &outcome.responses {
            assert_eq!(response.files.len(), 1);
        }
        // exactly one dedup entry for the request id on the issuing node
        assert!(b.dedup().contains(&outcome.request_id));
    }

    #[tokio::test]
    async fn ttl_forwarding_relays_distant_results_to_the_origin() {
        // Chain topology: A knows only B, B knows both, C shares the file.
        let net = Arc::new(LoopbackNet {
            services: Mutex::new(HashMap::new()),
            origin_inbox: Mutex::new(vec![]),
        });
        let now = Instant::now();
        let registry_a = Arc::new(PeerRegistry::new());
        registry_a.observe_join(identity("b"), now).expect("join");
        let registry_b = Arc::new(PeerRegistry::new());
        registry_b.observe_join(identity("a"), now).expect("join");
        registry_b.observe_join(identity("c"), now).expect("join");
        let registry_c = Arc::new(PeerRegistry::new());
        registry_c.observe_join(identity("b"), now).expect("join");

        let a = build_node("a", &net, registry_a, &[]);
        let _b = build_node("b", &net, registry_b, &[]);
        let _c = build_node("c", &net, registry_c, &[shared_file("deep.bin", "c", 3)]);

        let outcome = a.search("deep", 2).await.expect("search");
        assert_eq!(outcome.responses.len(), 1);
        assert_eq!(outcome.responses[0].source.peer_id, "c");
        assert_eq!(outcome.unique_files().len(), 1);
        // the hit reached the origin over a fresh channel, not the
        // request channel
        assert!(!net.origin_inbox.lock().expect("inbox").is_empty());
    }

    #[tokio::test]
    async fn ttl_zero_is_answered_but_never_forwarded() {
        let net = Arc::new(LoopbackNet {
            services: Mutex::new(HashMap::new()),
            origin_inbox: Mutex::new(vec![]),
        });
        let now = Instant::now();
        // B knows C, but the request arrives with ttl 0
        let registry_b = Arc::new(PeerRegistry::new());
        registry_b.observe_join(identity("c"), now).expect("join");
        let registry_c = Arc::new(PeerRegistry::new());
        let _c = build_node("c", &net, registry_c, &[shared_file("deep.bin", "c", 3)]);
        let b = build_node("b", &net, registry_b, &[]);

        let response = b.handle_request(
            SearchRequest {
                request_id: "req-ttl0".to_owned(),
                origin: identity("a"),
                query: "deep".to_owned(),
                ttl: 0,
            },
            Some("a"),
        );
        assert!(response.files.is_empty());
        // give any (incorrect) forward a chance to run
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(net.origin_inbox.lock().expect("inbox").is_empty());
    }

    #[tokio::test]
    async fn unique_files_collapses_duplicate_owners() {
        let file = shared_file("alpha.bin", "a", 1).summary();
        let outcome = SearchOutcome {
            request_id: "r".to_owned(),
            responses: vec![
                SearchResponse {
                    request_id: "r".to_owned(),
                    source: identity("a"),
                    files: vec![file.clone()],
                },
                SearchResponse {
                    request_id: "r".to_owned(),
                    source: identity("c"),
                    files: vec![file],
                },
            ],
        };
        assert_eq!(outcome.unique_files().len(), 1);
    }
}
