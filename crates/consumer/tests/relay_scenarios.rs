//! End-to-end relay scenarios driven through the orchestrator with in-memory
//! transport, parser, cache and conflict-sender collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use relaymesh_consumer::{ConsumerConfig, ConsumerError, RelayOrchestrator, RelayOutput};
use relaymesh_core::{
    ApiCategory, CacheError, ChainBlockStats, ChainMessage, ChainParseError, ChainParser,
    ConflictSender, FinalizationConflict, ProviderClient, ProviderOptimizer, RelayCache,
    RelayReply, RelayRequest, RelayStream, RelayTransport, ResponseConflict, TransportError,
};
use relaymesh_crypto::{query_hash, reply_signable_data, sign_data, SigningKeypair};
use relaymesh_protocol::{calculate_vrf_on_relay, threshold_to_session, FinalizationConsensus};
use relaymesh_session::{ConsumerSessionManager, PairingListEntry};

// ==================== Mock collaborators ====================

struct NoopOptimizer;

impl ProviderOptimizer for NoopOptimizer {
    fn append_relay_data(&self, _provider: &str, _latency: Duration, _failure: bool) {}
}

struct MockMessage {
    requested_block: i64,
    category: ApiCategory,
    compute_units: u64,
}

impl ChainMessage for MockMessage {
    fn requested_block(&self) -> i64 {
        self.requested_block
    }

    fn api_category(&self) -> ApiCategory {
        self.category
    }

    fn api_interface(&self) -> &str {
        "jsonrpc"
    }

    fn compute_units(&self) -> u64 {
        self.compute_units
    }
}

struct MockParser {
    requested_block: i64,
    category: ApiCategory,
    compute_units: u64,
    reliability: (bool, u32),
}

impl MockParser {
    fn deterministic(requested_block: i64, reliability: (bool, u32)) -> Self {
        Self {
            requested_block,
            category: ApiCategory {
                deterministic: true,
                hanging_api: false,
                subscription: false,
            },
            compute_units: 10,
            reliability,
        }
    }
}

impl ChainParser for MockParser {
    fn parse_msg(
        &self,
        _url: &str,
        _data: &[u8],
        _connection_type: &str,
    ) -> Result<Box<dyn ChainMessage>, ChainParseError> {
        Ok(Box::new(MockMessage {
            requested_block: self.requested_block,
            category: self.category,
            compute_units: self.compute_units,
        }))
    }

    fn chain_block_stats(&self) -> ChainBlockStats {
        ChainBlockStats {
            average_block_time: Duration::from_secs(6),
            finalization_time: Duration::from_secs(2),
            blocks_distance_for_finalized: 5,
            allowed_block_lag_for_qos_sync: 2,
        }
    }

    fn data_reliability_params(&self) -> (bool, u32) {
        self.reliability
    }
}

#[derive(Clone)]
enum Behavior {
    Reply {
        data: Vec<u8>,
        latest_block: i64,
        finalized_hashes: Vec<u8>,
    },
    Timeout,
}

struct MockProvider {
    address: String,
    keypair: SigningKeypair,
    behavior: Behavior,
    requests: Mutex<Vec<RelayRequest>>,
}

impl MockProvider {
    fn reply(&self) -> Option<RelayReply> {
        match &self.behavior {
            Behavior::Reply {
                data,
                latest_block,
                finalized_hashes,
            } => {
                let mut reply = RelayReply {
                    data: data.clone(),
                    sig: vec![],
                    latest_block: *latest_block,
                    finalized_blocks_hashes: finalized_hashes.clone(),
                };
                reply.sig = sign_data(&self.keypair, &reply_signable_data(&reply)).to_vec();
                Some(reply)
            }
            Behavior::Timeout => None,
        }
    }

    fn recorded_requests(&self) -> Vec<RelayRequest> {
        self.requests.lock().clone()
    }
}

struct MockClient(Arc<MockProvider>);

#[async_trait]
impl ProviderClient for MockClient {
    async fn relay(&self, request: &RelayRequest) -> Result<RelayReply, TransportError> {
        self.0.requests.lock().push(request.clone());
        match self.0.reply() {
            Some(reply) => Ok(reply),
            None => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::Io("unreachable".to_string()))
            }
        }
    }

    async fn relay_subscribe(&self, request: &RelayRequest) -> Result<RelayStream, TransportError> {
        self.0.requests.lock().push(request.clone());
        let items = vec![
            Ok(RelayReply {
                data: b"event-1".to_vec(),
                sig: vec![],
                latest_block: 100,
                finalized_blocks_hashes: b"{}".to_vec(),
            }),
            Ok(RelayReply {
                data: b"event-2".to_vec(),
                sig: vec![],
                latest_block: 101,
                finalized_blocks_hashes: b"{}".to_vec(),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn probe(&self, guid: u64) -> Result<u64, TransportError> {
        Ok(guid)
    }
}

struct MockNetwork {
    providers: HashMap<String, Arc<MockProvider>>,
}

#[async_trait]
impl RelayTransport for MockNetwork {
    async fn connect(
        &self,
        provider: &str,
        _url: &str,
    ) -> Result<Arc<dyn ProviderClient>, TransportError> {
        match self.providers.get(provider) {
            Some(provider) => Ok(Arc::new(MockClient(provider.clone()))),
            None => Err(TransportError::ConnectionRefused(provider.to_string())),
        }
    }
}

#[derive(Default)]
struct RecordingConflictSender {
    finalization: Mutex<Vec<FinalizationConflict>>,
    response: Mutex<Vec<ResponseConflict>>,
    same_provider: Mutex<Vec<FinalizationConflict>>,
}

#[async_trait]
impl ConflictSender for RecordingConflictSender {
    async fn tx_conflict_detection(
        &self,
        finalization_conflict: Option<FinalizationConflict>,
        response_conflict: Option<ResponseConflict>,
        same_provider_conflict: Option<FinalizationConflict>,
    ) -> Result<(), TransportError> {
        if let Some(conflict) = finalization_conflict {
            self.finalization.lock().push(conflict);
        }
        if let Some(conflict) = response_conflict {
            self.response.lock().push(conflict);
        }
        if let Some(conflict) = same_provider_conflict {
            self.same_provider.lock().push(conflict);
        }
        Ok(())
    }
}

/// Cache keyed by the salt-independent query hash.
#[derive(Default)]
struct MemoryCache {
    entries: Mutex<HashMap<Vec<u8>, RelayReply>>,
}

#[async_trait]
impl RelayCache for MemoryCache {
    async fn get_entry(
        &self,
        request: &RelayRequest,
        _api_interface: &str,
        _spec_id: &str,
    ) -> Result<Option<RelayReply>, CacheError> {
        Ok(self.entries.lock().get(&query_hash(&request.relay_data)).cloned())
    }

    async fn set_entry(
        &self,
        request: &RelayRequest,
        _api_interface: &str,
        _spec_id: &str,
        reply: &RelayReply,
        _finalized: bool,
    ) -> Result<(), CacheError> {
        self.entries
            .lock()
            .insert(query_hash(&request.relay_data), reply.clone());
        Ok(())
    }
}

// ==================== Harness ====================

struct Harness {
    orchestrator: Arc<RelayOrchestrator>,
    sessions: Arc<ConsumerSessionManager>,
    providers: Vec<Arc<MockProvider>>,
    conflicts: Arc<RecordingConflictSender>,
    vrf_key: SigningKeypair,
}

fn harness(
    parser: MockParser,
    behaviors: &[(&str, Behavior)],
    cache: Option<Arc<dyn RelayCache>>,
    required_responses: usize,
) -> Harness {
    relaymesh_logging::init_test();
    let providers: Vec<Arc<MockProvider>> = behaviors
        .iter()
        .map(|(address, behavior)| {
            Arc::new(MockProvider {
                address: address.to_string(),
                keypair: SigningKeypair::generate(),
                behavior: behavior.clone(),
                requests: Mutex::new(Vec::new()),
            })
        })
        .collect();

    let network = Arc::new(MockNetwork {
        providers: providers
            .iter()
            .map(|provider| (provider.address.clone(), provider.clone()))
            .collect(),
    });

    let sessions = Arc::new(ConsumerSessionManager::new(
        network,
        Arc::new(NoopOptimizer),
    ));
    let pairing: Vec<PairingListEntry> = providers
        .iter()
        .map(|provider| PairingListEntry {
            address: provider.address.clone(),
            public_key: provider.keypair.public_key_bytes(),
            endpoints: vec![format!("mesh://{}:4500", provider.address)],
            max_compute_units: 10_000,
        })
        .collect();
    sessions.update_pairing(7, pairing).unwrap();

    let finalization = Arc::new(FinalizationConsensus::new());
    finalization.new_epoch(7);

    let conflicts = Arc::new(RecordingConflictSender::default());
    let vrf_key = SigningKeypair::generate();
    let orchestrator = Arc::new(RelayOrchestrator::new(
        ConsumerConfig {
            spec_id: "ETH1".to_string(),
            relay_chain_id: "relaymesh-1".to_string(),
            api_interface: "jsonrpc".to_string(),
            required_responses,
        },
        Arc::new(parser),
        sessions.clone(),
        finalization,
        cache,
        conflicts.clone(),
        SigningKeypair::generate(),
        vrf_key.clone(),
    ));

    Harness {
        orchestrator,
        sessions,
        providers,
        conflicts,
        vrf_key,
    }
}

fn reply_behavior(data: &[u8]) -> Behavior {
    Behavior::Reply {
        data: data.to_vec(),
        latest_block: 100,
        finalized_hashes: br#"{"94":"0x44","95":"0x45"}"#.to_vec(),
    }
}

async fn settle() {
    // let detached tasks (audits, backoff releases, cache writes) finish
    tokio::time::sleep(Duration::from_secs(10)).await;
}

// ==================== Scenarios ====================

#[tokio::test(start_paused = true)]
async fn test_happy_path_single_response() {
    let h = harness(
        MockParser::deterministic(94, (false, 0)),
        &[
            ("p0", reply_behavior(b"\xaa")),
            ("p1", reply_behavior(b"\xaa")),
            ("p2", reply_behavior(b"\xaa")),
        ],
        None,
        1,
    );

    let output = h
        .orchestrator
        .send_relay("/block", b"{\"height\":94}", "POST")
        .await
        .unwrap();
    let reply = match output {
        RelayOutput::Reply(reply) => reply,
        RelayOutput::Subscription(_) => panic!("expected a plain reply"),
    };
    assert_eq!(reply.data, b"\xaa");
    settle().await;

    // exactly one provider served the relay and was charged for it
    let served: Vec<_> = h
        .providers
        .iter()
        .filter(|provider| !provider.recorded_requests().is_empty())
        .collect();
    assert_eq!(served.len(), 1);
    let request = &served[0].recorded_requests()[0];
    assert_eq!(request.relay_session.cu_sum, 10);
    assert_eq!(request.relay_session.relay_num, 1);
    assert_eq!(request.relay_session.epoch, 7);
    assert_eq!(request.relay_session.unresponsive_providers, b"[]".to_vec());
    assert!(request.vrf_data.is_none());

    let entry = h.sessions.get_provider_entry(&served[0].address).unwrap();
    assert_eq!(entry.used_compute_units(), 10);
    assert_eq!(h.sessions.reported_providers(7), b"[]".to_vec());
    assert!(h.conflicts.response.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_retries_on_another_provider() {
    let h = harness(
        MockParser::deterministic(94, (false, 0)),
        &[
            ("slow", Behavior::Timeout),
            ("fast", reply_behavior(b"\xaa")),
        ],
        None,
        1,
    );

    let output = h
        .orchestrator
        .send_relay("/block", b"{\"height\":94}", "POST")
        .await
        .unwrap();
    match output {
        RelayOutput::Reply(reply) => assert_eq!(reply.data, b"\xaa"),
        RelayOutput::Subscription(_) => panic!("expected a plain reply"),
    }
    settle().await;

    // the timed-out provider was refunded after its backoff release, and a
    // single timeout neither blocks nor reports it
    let slow = h.sessions.get_provider_entry("slow").unwrap();
    assert_eq!(slow.used_compute_units(), 0);
    let fast = h.sessions.get_provider_entry("fast").unwrap();
    assert_eq!(fast.used_compute_units(), 10);
    assert_eq!(h.sessions.reported_providers(7), b"[]".to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_all_retries_failed() {
    let h = harness(
        MockParser::deterministic(94, (false, 0)),
        &[("slow", Behavior::Timeout)],
        None,
        1,
    );

    let err = h
        .orchestrator
        .send_relay("/block", b"{\"height\":94}", "POST")
        .await
        .unwrap_err();
    match err {
        ConsumerError::AllRetriesFailed(errors) => assert!(!errors.is_empty()),
        other => panic!("expected AllRetriesFailed, got {other}"),
    }
    settle().await;
    let slow = h.sessions.get_provider_entry("slow").unwrap();
    assert_eq!(slow.used_compute_units(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cache_hit_releases_session_unused() {
    let cache = Arc::new(MemoryCache::default());
    let h = harness(
        MockParser::deterministic(94, (false, 0)),
        &[("p0", reply_behavior(b"\xaa"))],
        Some(cache.clone()),
        1,
    );

    // first relay misses the cache and gets written back asynchronously
    let first = h
        .orchestrator
        .send_relay("/block", b"{\"height\":94}", "POST")
        .await
        .unwrap();
    match first {
        RelayOutput::Reply(reply) => assert_eq!(reply.data, b"\xaa"),
        RelayOutput::Subscription(_) => panic!("expected a plain reply"),
    }
    settle().await;
    let entry = h.sessions.get_provider_entry("p0").unwrap();
    assert_eq!(entry.used_compute_units(), 10);
    assert_eq!(h.providers[0].recorded_requests().len(), 1);

    // second identical request is served from cache: no new provider
    // request, reserved compute units refunded
    let second = h
        .orchestrator
        .send_relay("/block", b"{\"height\":94}", "POST")
        .await
        .unwrap();
    match second {
        RelayOutput::Reply(reply) => assert_eq!(reply.data, b"\xaa"),
        RelayOutput::Subscription(_) => panic!("expected a plain reply"),
    }
    settle().await;
    assert_eq!(h.providers[0].recorded_requests().len(), 1);
    assert_eq!(entry.used_compute_units(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_charges_cu_only() {
    let mut parser = MockParser::deterministic(94, (false, 0));
    parser.category = ApiCategory {
        deterministic: false,
        hanging_api: false,
        subscription: true,
    };
    let h = harness(parser, &[("p0", reply_behavior(b"\xaa"))], None, 1);

    let output = h
        .orchestrator
        .send_relay("/subscribe", b"{}", "POST")
        .await
        .unwrap();
    let stream = match output {
        RelayOutput::Subscription(stream) => stream,
        RelayOutput::Reply(_) => panic!("expected a subscription"),
    };
    let events: Vec<_> = stream.collect().await;
    assert_eq!(events.len(), 2);

    // the subscription charged its compute units and kept them
    let entry = h.sessions.get_provider_entry("p0").unwrap();
    assert_eq!(entry.used_compute_units(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_audit_consistency_with_vrf_decision() {
    let h = harness(
        MockParser::deterministic(94, (true, u32::MAX)),
        &[
            ("p0", reply_behavior(b"\xaa")),
            ("p1", reply_behavior(b"\xaa")),
            ("p2", reply_behavior(b"\xbb")),
        ],
        None,
        1,
    );

    let output = h
        .orchestrator
        .send_relay("/block", b"{\"height\":94}", "POST")
        .await;
    // p2 may be the original; its answer differs from nobody until audited,
    // so the client call itself always succeeds
    let reply = match output.unwrap() {
        RelayOutput::Reply(reply) => reply,
        RelayOutput::Subscription(_) => panic!("expected a plain reply"),
    };
    settle().await;

    // reconstruct the audit decision the orchestrator must have made
    let by_address: HashMap<&str, &Arc<MockProvider>> = h
        .providers
        .iter()
        .map(|provider| (provider.address.as_str(), provider))
        .collect();
    let index_of: HashMap<&str, u64> = [("p0", 0u64), ("p1", 1u64), ("p2", 2u64)].into();

    let original = h
        .providers
        .iter()
        .find(|provider| {
            provider
                .recorded_requests()
                .iter()
                .any(|request| request.relay_session.session_id != 0)
        })
        .expect("some provider served the original relay");
    let original_request = original
        .recorded_requests()
        .iter()
        .find(|request| request.relay_session.session_id != 0)
        .cloned()
        .unwrap();
    let original_reply = original.reply().unwrap();
    assert_eq!(original_reply.data, reply.data);

    let (vrf_first, vrf_second) =
        calculate_vrf_on_relay(&original_request.relay_data, &original_reply, &h.vrf_key, 7);
    let decision = threshold_to_session(&[vrf_first, vrf_second], &[false, true], u32::MAX, 3);
    let expected_audited: Vec<&str> = index_of
        .iter()
        .filter(|&(&address, &index)| decision.contains_key(&index) && address != original.address)
        .map(|(&address, _)| address)
        .collect();

    // every expected audit ran on the reserved audit session, and no others
    let mut audited_data: Vec<Vec<u8>> = Vec::new();
    for (address, provider) in &by_address {
        let audit_requests: Vec<_> = provider
            .recorded_requests()
            .iter()
            .filter(|request| request.relay_session.session_id == 0)
            .cloned()
            .collect();
        if expected_audited.contains(address) {
            assert_eq!(audit_requests.len(), 1, "expected one audit on {address}");
            let audit = &audit_requests[0];
            assert_eq!(audit.relay_session.cu_sum, 0);
            assert_eq!(audit.relay_session.relay_num, 1);
            assert!(audit.vrf_data.is_some());
            assert_eq!(audit.relay_data.request_block, 94);
            audited_data.push(provider.reply().unwrap().data);
        } else {
            assert!(audit_requests.is_empty(), "unexpected audit on {address}");
        }
    }

    // expected conflicts: original vs each disagreeing audit, plus the
    // audit↔audit pairs once any original mismatch exists
    let original_mismatches = audited_data
        .iter()
        .filter(|data| **data != original_reply.data)
        .count();
    let mut expected_conflicts = original_mismatches;
    if original_mismatches > 0 {
        for first in 0..audited_data.len() {
            for second in (first + 1)..audited_data.len() {
                if audited_data[first] != audited_data[second] {
                    expected_conflicts += 1;
                }
            }
        }
    }

    let conflicts = h.conflicts.response.lock();
    assert_eq!(conflicts.len(), expected_conflicts);
    for conflict in conflicts.iter() {
        assert_ne!(
            conflict.relay_data0.reply.data,
            conflict.relay_data1.reply.data
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_cross_provider_finalization_conflict() {
    // both providers agree on the data but not on a finalized hash
    let h = harness(
        MockParser::deterministic(94, (true, 0)),
        &[
            (
                "honest",
                Behavior::Reply {
                    data: b"\xaa".to_vec(),
                    latest_block: 100,
                    finalized_hashes: br#"{"94":"0x44"}"#.to_vec(),
                },
            ),
            (
                "forker",
                Behavior::Reply {
                    data: b"\xaa".to_vec(),
                    latest_block: 100,
                    finalized_hashes: br#"{"94":"0xff"}"#.to_vec(),
                },
            ),
        ],
        None,
        2,
    );

    // asking for two responses forces both providers to answer; whichever
    // answers second contradicts the first on block 94
    let output = h
        .orchestrator
        .send_relay("/block", b"{\"height\":94}", "POST")
        .await
        .unwrap();
    match output {
        RelayOutput::Reply(reply) => assert_eq!(reply.data, b"\xaa"),
        RelayOutput::Subscription(_) => panic!("expected a plain reply"),
    }
    settle().await;

    let conflicts = h.conflicts.finalization.lock();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_ne!(conflict.provider0, conflict.provider1);
    assert!(conflict.reply1.is_some());
    // the offender was blocked and reported for the epoch
    let reported = h.sessions.reported_providers(7);
    assert_ne!(reported, b"[]".to_vec());
}
