//! Linearizable envelope and basic data-path behavior through the
//! dispatcher: write/read round trips, conditional writes, duplicate RPC
//! suppression, exact increment semantics, bulk reads, and enumeration.

mod common;

use common::*;
use ember_store::cluster::ClientLease;
use ember_store::protocol::*;
use ember_store::status::{RejectRules, Status};

#[tokio::test]
async fn write_then_read_returns_value_and_version() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    let wrote = write(&master, 1, b"x", b"a").await;
    assert_eq!(wrote.status, Status::Ok);
    assert_eq!(wrote.version, 1);

    let got = read(&master, 1, b"x").await;
    assert_eq!(got.status, Status::Ok);
    assert_eq!(got.payload.as_ref(), b"a");
    assert_eq!(got.version, 1);

    // Overwrite bumps the version strictly.
    let wrote = write(&master, 1, b"x", b"b").await;
    assert_eq!(wrote.version, 2);
    let got = read(&master, 1, b"x").await;
    assert_eq!(got.payload.as_ref(), b"b");
    assert_eq!(got.version, 2);
}

#[tokio::test]
async fn conditional_write_succeeds_only_on_exact_version() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    write(&master, 1, b"k", b"v1").await;

    let stale = write_full(
        &master,
        1,
        vec![b"k".to_vec()],
        b"v2",
        RejectRules::exactly_version(7),
        0,
        0,
        0,
    )
    .await;
    assert_eq!(stale.status, Status::WrongVersion);
    let got = read(&master, 1, b"k").await;
    assert_eq!(got.payload.as_ref(), b"v1");
    assert_eq!(got.version, 1);

    let fresh = write_full(
        &master,
        1,
        vec![b"k".to_vec()],
        b"v2",
        RejectRules::exactly_version(1),
        0,
        0,
        0,
    )
    .await;
    assert_eq!(fresh.status, Status::Ok);
    assert_eq!(fresh.version, 2);
}

#[tokio::test]
async fn linearizable_write_retry_returns_identical_response() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    let first = write_full(
        &master,
        1,
        vec![b"x".to_vec()],
        b"a",
        RejectRules::default(),
        7,
        5,
        0,
    )
    .await;
    assert_eq!(first.status, Status::Ok);
    assert_eq!(first.version, 1);

    // Identical retry (e.g. over a new connection): no new version, byte
    // identical response.
    let retry = write_full(
        &master,
        1,
        vec![b"x".to_vec()],
        b"a",
        RejectRules::default(),
        7,
        5,
        0,
    )
    .await;
    assert_eq!(retry, first);

    let got = read(&master, 1, b"x").await;
    assert_eq!(got.version, 1);
}

#[tokio::test]
async fn acked_rpc_results_are_pruned() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    for rpc_id in 1..=3u64 {
        let response = write_full(
            &master,
            1,
            vec![b"k".to_vec()],
            b"v",
            RejectRules::default(),
            9,
            rpc_id,
            0,
        )
        .await;
        assert_eq!(response.status, Status::Ok);
    }

    // Acking through rpc 2 prunes those records; rpc 3 is still replayable.
    let retry = write_full(
        &master,
        1,
        vec![b"k".to_vec()],
        b"v",
        RejectRules::default(),
        9,
        3,
        2,
    )
    .await;
    assert_eq!(retry.status, Status::Ok);
    assert_eq!(retry.version, 3);

    // A resend of an acknowledged rpc id is a client error.
    let stale = write_full(
        &master,
        1,
        vec![b"k".to_vec()],
        b"v",
        RejectRules::default(),
        9,
        1,
        2,
    )
    .await;
    assert_eq!(stale.status, Status::RequestFormatError);
}

#[tokio::test]
async fn increment_creates_missing_object_as_zero() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 2, 0, u64::MAX).await;

    let first = increment(&master, 2, b"c", 3, 0.0, 0, 0).await;
    assert_eq!(first.status, Status::Ok);
    assert_eq!(first.version, 1);
    assert_eq!(first.new_value_int64, 3);
    // Both views read the same 8-byte cell.
    assert_eq!(first.new_value_double, f64::from_bits(3));

    let second = increment(&master, 2, b"c", 0, 2.5, 0, 0).await;
    assert_eq!(second.status, Status::Ok);
    assert_eq!(second.version, 2);
    let expected = f64::from_bits(3) + 2.5;
    assert_eq!(second.new_value_double, expected);
    assert_eq!(second.new_value_int64, expected.to_bits() as i64);
}

#[tokio::test]
async fn increment_retry_with_same_rpc_id_applies_once() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    let first = increment(&master, 1, b"ctr", 10, 0.0, 4, 21).await;
    assert_eq!(first.status, Status::Ok);
    assert_eq!(first.new_value_int64, 10);

    let retry = increment(&master, 1, b"ctr", 10, 0.0, 4, 21).await;
    assert_eq!(retry.status, Status::Ok);
    assert_eq!(retry.new_value_int64, 10);
    assert_eq!(retry.version, first.version);

    // A new rpc id really increments.
    let next = increment(&master, 1, b"ctr", 10, 0.0, 4, 22).await;
    assert_eq!(next.new_value_int64, 20);
}

#[tokio::test]
async fn increment_rejects_non_numeric_object() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    write(&master, 1, b"s", b"not eight").await;
    let response = increment(&master, 1, b"s", 1, 0.0, 0, 0).await;
    assert_eq!(response.status, Status::InvalidObject);
}

#[tokio::test]
async fn remove_returns_version_and_clears_object() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    write(&master, 1, b"k", b"v1").await;
    write(&master, 1, b"k", b"v2").await;

    let removed = remove(&master, 1, b"k").await;
    assert_eq!(removed.status, Status::Ok);
    assert_eq!(removed.version, 2);

    let got = read(&master, 1, b"k").await;
    assert_eq!(got.status, Status::ObjectDoesntExist);

    // Recreation continues the version sequence past the tombstone.
    let recreated = write(&master, 1, b"k", b"v3").await;
    assert_eq!(recreated.version, 3);
}

#[tokio::test]
async fn reads_of_unowned_tablets_are_rejected() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    let got = read(&master, 99, b"x").await;
    assert_eq!(got.status, Status::UnknownTablet);
    let wrote = write(&master, 99, b"x", b"v").await;
    assert_eq!(wrote.status, Status::UnknownTablet);
}

#[tokio::test]
async fn read_hashes_returns_objects_in_input_order() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    for key in [b"a".as_slice(), b"b", b"c"] {
        write(&master, 1, key, key).await;
    }

    let request = ReadHashesRequest {
        table_id: 1,
        hashes: vec![hash(1, b"c"), hash(1, b"nope"), hash(1, b"a")],
    };
    let response = match master.dispatch(Request::ReadHashes(request)).await {
        Ok(Response::ReadHashes(response)) => response,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.num_hashes, 3);
    assert!(response.num_objects <= response.num_hashes);
    let keys: Vec<&[u8]> = response.objects.iter().map(|o| o.key.as_ref()).collect();
    assert_eq!(keys, vec![b"c".as_slice(), b"a".as_slice()]);
}

#[tokio::test]
async fn enumerate_walks_the_whole_tablet() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    let mut expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![b'k', i]).collect();
    for key in &expected {
        write(&master, 1, key, b"v").await;
    }

    let mut seen: Vec<Vec<u8>> = Vec::new();
    let mut continuation = 0u64;
    loop {
        let request = EnumerateRequest {
            table_id: 1,
            keys_only: false,
            tablet_first_hash: 0,
            continuation_hash: continuation,
        };
        let response = match master.dispatch(Request::Enumerate(request)).await {
            Ok(Response::Enumerate(response)) => response,
            other => panic!("unexpected response: {other:?}"),
        };
        assert_eq!(response.status, Status::Ok);
        for object in &response.objects {
            seen.push(object.key.to_vec());
        }
        if response.done {
            break;
        }
        continuation = response.next_hash;
    }

    expected.sort();
    seen.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn multi_write_and_multi_read_report_per_part_status() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    let parts = vec![
        MultiWritePart {
            table_id: 1,
            keys: vec![b"m1".to_vec()],
            value: b"v1".to_vec(),
            reject_rules: RejectRules::default(),
        },
        MultiWritePart {
            table_id: 99,
            keys: vec![b"m2".to_vec()],
            value: b"v2".to_vec(),
            reject_rules: RejectRules::default(),
        },
    ];
    let response = match master
        .dispatch(Request::MultiOp(MultiOpRequest::Write(parts)))
        .await
    {
        Ok(Response::MultiOp(MultiOpResponse::Write(results))) => results,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(response[0].status, Status::Ok);
    assert_eq!(response[1].status, Status::UnknownTablet);

    let reads = vec![
        MultiReadPart {
            table_id: 1,
            key: b"m1".to_vec(),
            reject_rules: RejectRules::default(),
        },
        MultiReadPart {
            table_id: 1,
            key: b"absent".to_vec(),
            reject_rules: RejectRules::default(),
        },
    ];
    let response = match master
        .dispatch(Request::MultiOp(MultiOpRequest::Read(reads)))
        .await
    {
        Ok(Response::MultiOp(MultiOpResponse::Read(results))) => results,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(response[0].status, Status::Ok);
    assert_eq!(response[0].value.as_ref(), b"v1");
    assert_eq!(response[1].status, Status::ObjectDoesntExist);
}

#[tokio::test]
async fn disabled_master_bounces_requests_with_retry() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    {
        let _disabler = master.disable();
        let got = read(&master, 1, b"x").await;
        assert_eq!(got.status, Status::Retry);
    }
    // Dropping the disabler re-enables service.
    let wrote = write(&master, 1, b"x", b"v").await;
    assert_eq!(wrote.status, Status::Ok);
}

#[tokio::test]
async fn requests_before_init_get_retry() {
    let cluster = TestCluster::new();
    // Build a master without registering/initializing it.
    let master = ember_store::service::MasterService::new(
        ember_store::ServerId(77),
        ember_store::MasterConfig::default(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        std::sync::Arc::new(ember_store::NullReplicator),
    );
    let response = master
        .dispatch(Request::Read(ReadRequest {
            table_id: 1,
            key: b"x".to_vec(),
            reject_rules: RejectRules::default(),
        }))
        .await;
    assert_eq!(status_of(response), Status::Retry);
}

#[tokio::test]
async fn server_statistics_serialize_for_the_coordinator() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;
    write(&master, 1, b"s", b"v").await;
    read(&master, 1, b"s").await;

    let stats = match master.dispatch(Request::GetServerStatistics).await {
        Ok(Response::ServerStatistics(stats)) => stats,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(stats.tablets.len(), 1);
    assert!(stats.tablets[0].read_ops >= 1);
    assert!(stats.tablets[0].write_ops >= 1);

    let json = serde_json::to_string(&stats).expect("serialize statistics");
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("parse statistics");
    assert_eq!(parsed["tablets"][0]["table_id"], 1);
    assert_eq!(parsed["tablets"][0]["state"], "Normal");
}

#[tokio::test]
async fn cluster_time_advances_with_client_timestamps() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1);
    take_tablet(&master, 1, 0, u64::MAX).await;

    let before = master.cluster_time();
    let request = WriteRequest {
        table_id: 1,
        keys: vec![b"t".to_vec()],
        value: b"v".to_vec(),
        reject_rules: RejectRules::default(),
        lease: ClientLease {
            lease_id: 3,
            lease_term: u64::MAX / 2,
            timestamp: 50_000,
        },
        rpc_id: 1,
        ack_id: 0,
    };
    master.dispatch(Request::Write(request)).await.expect("write");
    assert!(master.cluster_time() >= 50_000);
    assert!(master.cluster_time() >= before);
}
