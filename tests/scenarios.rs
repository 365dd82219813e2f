//! Scripted end-to-end scenarios: a vault driven through its public
//! message entry point, with a capturing router standing in for the
//! overlay.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vault_core::chunk_store::ChunkStore;
use vault_core::db::AccountDb;
use vault_core::wire::{decode_cbor, encode_cbor, SyncEnvelope};
use vault_core::{
    Config, DataKind, DataName, Destination, Frame, Identity, MessageId, PeerId, Persona,
    Request, Response, Router, SrcAuthority, Vault, VaultError, VersionName,
};

// ─── Test router ─────────────────────────────────────────────────────────────

/// Captures every send; the close group of every target is a fixed set
/// of four peers with this vault first.
struct TestRouter {
    our_id: PeerId,
    group: Vec<PeerId>,
    sent: Mutex<Vec<(Destination, Vec<u8>)>>,
}

impl TestRouter {
    fn new(our_id: PeerId, group: Vec<PeerId>) -> Arc<Self> {
        Arc::new(TestRouter { our_id, group, sent: Mutex::new(Vec::new()) })
    }

    fn take_sent(&self) -> Vec<(Destination, Vec<u8>)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Router for TestRouter {
    fn our_id(&self) -> PeerId {
        self.our_id
    }

    fn close_group(&self, _target: &Identity) -> Vec<PeerId> {
        self.group.clone()
    }

    fn send(&self, dst: Destination, bytes: Vec<u8>) {
        self.sent.lock().unwrap().push((dst, bytes));
    }
}

/// A router whose close group excludes this vault, for churn tests.
struct EvictedRouter {
    inner: Arc<TestRouter>,
}

impl Router for EvictedRouter {
    fn our_id(&self) -> PeerId {
        self.inner.our_id()
    }

    fn close_group(&self, _target: &Identity) -> Vec<PeerId> {
        self.inner.group.iter().copied().filter(|p| *p != self.inner.our_id).collect()
    }

    fn send(&self, dst: Destination, bytes: Vec<u8>) {
        self.inner.send(dst, bytes)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn peer(fill: u8) -> PeerId {
    PeerId([fill; 64])
}

fn identity(fill: u8) -> Identity {
    Identity([fill; 64])
}

fn data_name(fill: u8) -> DataName {
    DataName::new(DataKind::ImmutableData, identity(fill))
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("vault_test_{}", rand::random::<u64>()))
}

async fn make_vault(router: Arc<dyn Router>, config: Config) -> Arc<Vault> {
    let db = AccountDb::open_in_memory().await.unwrap();
    let chunks = ChunkStore::open(&scratch_dir()).await.unwrap();
    Vault::with_stores(config, router, db, chunks).unwrap()
}

fn default_group(our_id: PeerId) -> Vec<PeerId> {
    vec![our_id, peer(11), peer(12), peer(13)]
}

fn request_frame(
    persona: Persona,
    src: SrcAuthority,
    message_id: MessageId,
    request: Request,
) -> Vec<u8> {
    Frame::Request { persona, src, message_id, request }.to_bytes().unwrap()
}

/// A peer's sync broadcast carrying one proposal.
fn sync_frame<A: serde::Serialize>(
    persona: Persona,
    owner: Identity,
    name: DataName,
    action: &A,
    message_id: MessageId,
    originator: PeerId,
) -> Vec<u8> {
    let envelope = SyncEnvelope {
        owner,
        name,
        action: encode_cbor(action).unwrap(),
        message_id,
        originator,
    };
    request_frame(
        persona,
        SrcAuthority::Single { peer: originator },
        MessageId(rand::random()),
        Request::Sync { entries: vec![envelope] },
    )
}

fn sent_requests(sent: &[(Destination, Vec<u8>)]) -> Vec<(Destination, Persona, Request)> {
    sent.iter()
        .filter_map(|(dst, bytes)| match Frame::from_bytes(bytes) {
            Ok(Frame::Request { persona, request, .. }) => Some((*dst, persona, request)),
            _ => None,
        })
        .collect()
}

fn sent_responses(sent: &[(Destination, Vec<u8>)]) -> Vec<(Destination, Response)> {
    sent.iter()
        .filter_map(|(dst, bytes)| match Frame::from_bytes(bytes) {
            Ok(Frame::Response { response, .. }) => Some((*dst, response)),
            _ => None,
        })
        .collect()
}

// ─── Scenario 1: dedup single-source ─────────────────────────────────────────

#[tokio::test]
async fn single_source_message_is_deduplicated() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let vault = make_vault(router.clone(), Config::default()).await;

    let client = identity(42);
    let bytes = request_frame(
        Persona::MaidManager,
        SrcAuthority::Single { peer: peer(99) },
        MessageId(1),
        Request::ClientPut { client, name: data_name(7), content: vec![1, 2, 3] },
    );

    vault.handle_message(&bytes).await.unwrap();
    let first_round = router.take_sent();
    // Exactly one downstream action: the proposal broadcast to the group.
    assert_eq!(sent_requests(&first_round).len(), 1);
    assert!(matches!(sent_requests(&first_round)[0].2, Request::Sync { .. }));

    assert_eq!(vault.handle_message(&bytes).await.unwrap_err(), VaultError::DuplicateRequest);
    assert_eq!(router.sent_count(), 0);
}

// ─── Scenario 2: group-source quorum ─────────────────────────────────────────

#[tokio::test]
async fn group_source_fires_on_third_distinct_sender() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let vault = make_vault(router.clone(), Config::default()).await;

    let client = identity(42);
    let name = data_name(7);
    let frame_from = |sender: PeerId| {
        request_frame(
            Persona::DataManager,
            SrcAuthority::Group { group: client, peer: sender },
            MessageId(2),
            Request::Put { name, content: vec![9; 16] },
        )
    };

    vault.handle_message(&frame_from(peer(11))).await.unwrap();
    vault.handle_message(&frame_from(peer(12))).await.unwrap();
    assert_eq!(router.sent_count(), 0, "no action before quorum");

    // Third distinct sender crosses the threshold (group_size - 1 = 3).
    vault.handle_message(&frame_from(peer(13))).await.unwrap();
    let requests = sent_requests(&router.take_sent());
    assert_eq!(requests.len(), 1);
    assert!(matches!(requests[0].2, Request::Sync { .. }));

    // A fourth copy is ignored.
    assert_eq!(
        vault.handle_message(&frame_from(peer(14))).await.unwrap_err(),
        VaultError::DuplicateRequest
    );
    assert_eq!(router.sent_count(), 0);
}

// ─── Full commit: request quorum + sync quorum ───────────────────────────────

#[tokio::test]
async fn put_commits_after_peer_sync_and_forwards_to_holders() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let vault = make_vault(router.clone(), Config::default()).await;

    let client = identity(42);
    let name = data_name(7);
    let message_id = MessageId(3);
    let content = vec![5; 32];

    // Admit the request from three MaidManager group members.
    for sender in [peer(11), peer(12), peer(13)] {
        let frame = request_frame(
            Persona::DataManager,
            SrcAuthority::Group { group: client, peer: sender },
            message_id,
            Request::Put { name, content: content.clone() },
        );
        vault.handle_message(&frame).await.unwrap();
    }
    router.take_sent();

    // Two peers ship the matching proposal; with ours that is quorum.
    let action = vault_core::actions::DataManagerAction::Put { size: 32, unique: false };
    for originator in [peer(11), peer(12)] {
        let frame =
            sync_frame(Persona::DataManager, name.identity, name, &action, message_id, originator);
        vault.handle_message(&frame).await.unwrap();
    }

    // Committed: the row exists and the data went out to every holder's
    // manager group, plus a success response to the maid managers.
    let account = vault_core::name::account_id("dm:", &name.identity);
    let row = vault.db().get(&account, &name.encode()).await.unwrap();
    let value: vault_core::actions::DataAccountValue = decode_cbor(&row).unwrap();
    assert_eq!(value.subscribers, 1);
    assert_eq!(value.data_size, 32);
    assert_eq!(value.online_holders.len(), 4);

    let sent = router.take_sent();
    let forwards: Vec<_> = sent_requests(&sent)
        .into_iter()
        .filter(|(_, persona, request)| {
            *persona == Persona::PmidManager && matches!(request, Request::ForwardPut { .. })
        })
        .collect();
    assert_eq!(forwards.len(), 4);
    let responses = sent_responses(&sent);
    assert!(responses
        .iter()
        .any(|(_, response)| matches!(response, Response::PutSuccess { .. })));
}

// ─── Scenario 3: holder down, then up ────────────────────────────────────────

#[tokio::test]
async fn mark_holder_down_then_up_through_the_pipeline() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let config = Config { min_holders: 2, ..Config::default() };
    let vault = make_vault(router.clone(), config).await;

    let name = data_name(7);
    let account = vault_core::name::account_id("dm:", &name.identity);
    let holder_b = identity(b'B');

    // Seed the committed row: online = {A, B, C}.
    let seeded = vault_core::actions::DataAccountValue {
        data_size: 16,
        subscribers: 1,
        online_holders: [identity(b'A'), holder_b, identity(b'C')].into(),
        offline_holders: Default::default(),
    };
    vault.db().put(&account, &name.encode(), &encode_cbor(&seeded).unwrap()).await.unwrap();

    let run_action = |action: vault_core::actions::DataManagerAction, message_id: MessageId| {
        let vault = vault.clone();
        let router = router.clone();
        async move {
            for sender in [peer(11), peer(12), peer(13)] {
                let request = match &action {
                    vault_core::actions::DataManagerAction::MarkHolderDown { pmid } => {
                        Request::HolderDown { name, pmid: *pmid }
                    }
                    _ => Request::HolderUp { name, pmid: holder_b },
                };
                let frame = request_frame(
                    Persona::DataManager,
                    SrcAuthority::Group { group: identity(b'B'), peer: sender },
                    message_id,
                    request,
                );
                vault.handle_message(&frame).await.unwrap();
            }
            for originator in [peer(11), peer(12)] {
                let frame = sync_frame(
                    Persona::DataManager,
                    name.identity,
                    name,
                    &action,
                    message_id,
                    originator,
                );
                vault.handle_message(&frame).await.unwrap();
            }
            router.take_sent()
        }
    };

    run_action(
        vault_core::actions::DataManagerAction::MarkHolderDown { pmid: holder_b },
        MessageId(10),
    )
    .await;
    let row = vault.db().get(&account, &name.encode()).await.unwrap();
    let value: vault_core::actions::DataAccountValue = decode_cbor(&row).unwrap();
    assert_eq!(value.online_holders, [identity(b'A'), identity(b'C')].into());
    assert_eq!(value.offline_holders, [holder_b].into());

    run_action(
        vault_core::actions::DataManagerAction::MarkHolderUp { pmid: holder_b },
        MessageId(11),
    )
    .await;
    let row = vault.db().get(&account, &name.encode()).await.unwrap();
    let value: vault_core::actions::DataAccountValue = decode_cbor(&row).unwrap();
    assert_eq!(
        value.online_holders,
        [identity(b'A'), holder_b, identity(b'C')].into()
    );
    assert!(value.offline_holders.is_empty());
}

// ─── Scenario 4: version chain with branch cap ───────────────────────────────

#[tokio::test]
async fn put_version_chain_respects_branch_cap() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let config = Config { max_branches: 2, ..Config::default() };
    let vault = make_vault(router.clone(), config).await;

    let name = DataName::new(DataKind::MutableData, identity(7));
    let account = vault_core::name::account_id("vm:", &name.identity);
    let version = |index: u64, fill: u8| VersionName::new(index, identity(fill));

    let mut next_msg = 20u64;
    let mut run_put = |old: Option<VersionName>, new: VersionName| {
        let vault = vault.clone();
        let router = router.clone();
        next_msg += 1;
        let message_id = MessageId(next_msg);
        async move {
            let frame = request_frame(
                Persona::VersionManager,
                SrcAuthority::Single { peer: peer(99) },
                message_id,
                Request::PutVersion { name, old, new },
            );
            vault.handle_message(&frame).await.unwrap();
            let action = vault_core::actions::VersionManagerAction::PutVersion { old, new };
            for originator in [peer(11), peer(12)] {
                let frame = sync_frame(
                    Persona::VersionManager,
                    name.identity,
                    name,
                    &action,
                    message_id,
                    originator,
                );
                vault.handle_message(&frame).await.unwrap();
            }
            sent_responses(&router.take_sent())
        }
    };

    let root = version(0, 0);
    let v1 = version(1, 1);
    let v2 = version(2, 2);
    let v3 = version(2, 3);
    let v4 = version(2, 4);

    assert!(run_put(None, root).await.iter().any(|(_, r)| matches!(r, Response::PutSuccess { .. })));
    run_put(Some(root), v1).await;
    run_put(Some(v1), v2).await;

    let graph: vault_core::versions::StructuredDataVersions =
        decode_cbor(&vault.db().get(&account, &name.encode()).await.unwrap()).unwrap();
    assert_eq!(graph.tips(), vec![v2]);

    // Fork under v1: second tip, still within the cap.
    run_put(Some(v1), v3).await;
    let graph: vault_core::versions::StructuredDataVersions =
        decode_cbor(&vault.db().get(&account, &name.encode()).await.unwrap()).unwrap();
    assert_eq!(graph.tips().len(), 2);

    // Third branch is over the cap: the commit fails with TooManyBranches.
    let responses = run_put(Some(v1), v4).await;
    assert!(responses.iter().any(|(_, r)| matches!(
        r,
        Response::PutFailure { error: VaultError::TooManyBranches, .. }
    )));
}

// ─── Scenario 5: churn account transfer ──────────────────────────────────────

#[tokio::test]
async fn churn_hands_off_account_rows_byte_identical() {
    let v1_id = peer(1);
    let v2_id = peer(2);

    let v1_router = TestRouter::new(v1_id, vec![v2_id, peer(11), peer(12), peer(13)]);
    let v2_router = TestRouter::new(v2_id, vec![v2_id, peer(11), peer(12), peer(13)]);

    // V1's close groups no longer include it.
    let v1 = make_vault(
        Arc::new(EvictedRouter { inner: v1_router.clone() }),
        Config::default(),
    )
    .await;
    let v2 = make_vault(v2_router.clone(), Config::default()).await;

    // Ten rows in one DataManager account on V1.
    let owner = identity(42);
    let account = vault_core::name::account_id("dm:", &owner);
    let mut expected = Vec::new();
    for i in 0..10u8 {
        let key = data_name(i).encode();
        let value = vec![i; 24];
        v1.db().put(&account, &key, &value).await.unwrap();
        expected.push((key, value));
    }

    // Churn: V1 notices it lost responsibility and pushes the snapshot.
    assert_eq!(v1.handle_churn().await.unwrap(), 1);
    let outgoing = v1_router.take_sent();
    assert_eq!(outgoing.len(), 1);

    // Deliver to V2, then route the ack back to V1.
    v2.handle_message(&outgoing[0].1).await.unwrap();
    let acks = v2_router.take_sent();
    assert_eq!(acks.len(), 1);
    assert!(matches!(acks[0].0, Destination::Peer(p) if p == v1_id));
    v1.handle_message(&acks[0].1).await.unwrap();

    // Every row on V2 is byte-identical; V1 no longer has the account.
    for (key, value) in &expected {
        assert_eq!(&v2.db().get(&account, key).await.unwrap(), value);
        assert_eq!(v1.db().get(&account, key).await.unwrap_err(), VaultError::NotFound);
    }
}

// ─── Snapshot pull on joining responsibility ─────────────────────────────────

#[tokio::test]
async fn joining_vault_installs_majority_snapshot() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let vault = make_vault(router.clone(), Config::default()).await;

    // Build the snapshot a healthy group would serve.
    let source = AccountDb::open_in_memory().await.unwrap();
    let owner = identity(42);
    let account = vault_core::name::account_id("dm:", &owner);
    source.put(&account, &data_name(1).encode(), b"row one").await.unwrap();
    source.put(&account, &data_name(2).encode(), b"row two").await.unwrap();
    let snapshot = source.snapshot(&account).await.unwrap();

    vault.transfers.request_account(&account).await.unwrap();
    assert_eq!(sent_requests(&router.take_sent()).len(), 1);

    // Majority for group_size 4 is two identical snapshots.
    let installed = vault
        .transfers
        .handle_snapshot_response(&account, peer(11), snapshot.clone())
        .await
        .unwrap();
    assert!(!installed);
    let installed = vault
        .transfers
        .handle_snapshot_response(&account, peer(12), snapshot.clone())
        .await
        .unwrap();
    assert!(installed);

    assert_eq!(vault.db().get(&account, &data_name(1).encode()).await.unwrap(), b"row one");
    assert_eq!(vault.db().snapshot(&account).await.unwrap(), snapshot);
}

// ─── Quota charge, forward, refund on downstream failure ─────────────────────

#[tokio::test]
async fn client_put_charges_then_refunds_on_downstream_failure() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let vault = make_vault(router.clone(), Config::default()).await;

    let client = identity(42);
    let name = data_name(7);
    let message_id = MessageId(50);
    let account = vault_core::name::account_id("mm:", &client);
    let row_key = DataName::new(DataKind::Maid, client).encode();

    // Client put, then commit the charge with two peer proposals.
    let frame = request_frame(
        Persona::MaidManager,
        SrcAuthority::Single { peer: peer(99) },
        message_id,
        Request::ClientPut { client, name, content: vec![1, 2, 3] },
    );
    vault.handle_message(&frame).await.unwrap();
    let charge = vault_core::actions::MaidManagerAction::Put { size: 3 };
    for originator in [peer(11), peer(12)] {
        let frame = sync_frame(
            Persona::MaidManager,
            client,
            DataName::new(DataKind::Maid, client),
            &charge,
            message_id,
            originator,
        );
        vault.handle_message(&frame).await.unwrap();
    }

    // The charge stuck and the data moved on to the DataManager group.
    let value: vault_core::actions::MaidAccountValue =
        decode_cbor(&vault.db().get(&account, &row_key).await.unwrap()).unwrap();
    assert_eq!(value.data_stored, 1);
    assert_eq!(value.space_available, 499);
    let sent = router.take_sent();
    assert!(sent_requests(&sent)
        .iter()
        .any(|(_, persona, request)| *persona == Persona::DataManager
            && matches!(request, Request::Put { .. })));

    // The DataManager group reports failure (quorum of three members).
    for sender in [peer(11), peer(12), peer(13)] {
        let frame = Frame::Response {
            src: SrcAuthority::Group { group: name.identity, peer: sender },
            message_id,
            response: Response::PutFailure { name, error: VaultError::DuplicateData },
        }
        .to_bytes()
        .unwrap();
        let _ = vault.handle_message(&frame).await;
    }
    // The client heard about the failure straight away.
    let responses = sent_responses(&router.take_sent());
    assert!(responses.iter().any(|(dst, response)| {
        matches!(dst, Destination::Peer(p) if *p == peer(99))
            && matches!(response, Response::PutFailure { .. })
    }));

    // Commit the refund the same way the charge went through.
    let refund = vault_core::actions::MaidManagerAction::Refund { size: 3 };
    for originator in [peer(11), peer(12)] {
        let frame = sync_frame(
            Persona::MaidManager,
            client,
            DataName::new(DataKind::Maid, client),
            &refund,
            message_id,
            originator,
        );
        vault.handle_message(&frame).await.unwrap();
    }
    let value: vault_core::actions::MaidAccountValue =
        decode_cbor(&vault.db().get(&account, &row_key).await.unwrap()).unwrap();
    assert_eq!(value.data_stored, 0);
    assert_eq!(value.space_available, 500);
}

// ─── Scenario 6: accumulator TTL ─────────────────────────────────────────────

#[tokio::test]
async fn expired_request_counts_as_fresh() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let config = Config { accumulator_ttl_secs: 0, ..Config::default() };
    let vault = make_vault(router.clone(), config).await;

    let bytes = request_frame(
        Persona::MaidManager,
        SrcAuthority::Single { peer: peer(99) },
        MessageId(6),
        Request::ClientPut { client: identity(42), name: data_name(7), content: vec![1] },
    );

    vault.handle_message(&bytes).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    // Past the TTL the same message is a fresh request, not a duplicate.
    vault.handle_message(&bytes).await.unwrap();
}

// ─── Chunk round trip through the PmidNode ───────────────────────────────────

#[tokio::test]
async fn chunk_put_then_get_roundtrips() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let vault = make_vault(router.clone(), Config::default()).await;

    let name = data_name(7);
    let our_name = Identity::from(our_id);

    // Store instruction from our PmidManager group (quorum of three).
    for sender in [peer(11), peer(12), peer(13)] {
        let frame = request_frame(
            Persona::PmidNode,
            SrcAuthority::Group { group: our_name, peer: sender },
            MessageId(30),
            Request::ChunkPut { name, content: b"chunk".to_vec() },
        );
        vault.handle_message(&frame).await.unwrap();
    }

    let frame = request_frame(
        Persona::PmidNode,
        SrcAuthority::Single { peer: peer(99) },
        MessageId(31),
        Request::ChunkGet { name },
    );
    vault.handle_message(&frame).await.unwrap();
    let responses = sent_responses(&router.take_sent());
    assert!(responses.iter().any(|(dst, response)| {
        matches!(dst, Destination::Peer(p) if *p == peer(99))
            && matches!(response, Response::GetSuccess { content, .. } if content == b"chunk")
    }));
}

// ─── Unroutable and malformed input ──────────────────────────────────────────

#[tokio::test]
async fn malformed_and_unroutable_messages_are_rejected() {
    let our_id = peer(1);
    let router = TestRouter::new(our_id, default_group(our_id));
    let vault = make_vault(router.clone(), Config::default()).await;

    assert_eq!(
        vault.handle_message(b"garbage").await.unwrap_err(),
        VaultError::MalformedMessage
    );

    // A chunk put addressed to the MaidManager persona goes nowhere.
    let frame = request_frame(
        Persona::MaidManager,
        SrcAuthority::Single { peer: peer(99) },
        MessageId(40),
        Request::ChunkPut { name: data_name(1), content: vec![] },
    );
    assert_eq!(
        vault.handle_message(&frame).await.unwrap_err(),
        VaultError::UnroutableMessage
    );
    assert_eq!(router.sent_count(), 0);
}
