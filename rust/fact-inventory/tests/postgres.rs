mod support;

use chrono::{TimeDelta, TimeZone, Utc};
use fact_inventory::{
    models::NewFactRecord,
    repository::FactRepository,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use serial_test::serial;
use std::net::IpAddr;
use support::{read_json, with_postgres_harness};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn stored_record_round_trips() {
    with_postgres_harness(|harness| async move {
        let address: IpAddr = "2001:db8::7".parse().unwrap();
        let system = object(json!({"os": "RHEL", "kernel": {"release": "4.18.0", "arch": "x86_64"}}));
        let packages = object(json!({"installed": ["vim", "git"], "total_packages": 2}));
        let created_at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        let record = NewFactRecord::new(address, system.clone(), packages.clone(), created_at);
        let stored = harness
            .repository()
            .persist(record)
            .await
            .expect("insert should succeed");
        assert_eq!(stored.created_at, created_at);

        let fetched = harness
            .repository()
            .fetch(stored.id)
            .await
            .expect("fetch should succeed")
            .expect("record should exist");
        assert_eq!(fetched.client_address, "2001:db8::7");
        assert_eq!(
            serde_json::to_vec(&fetched.system_facts).unwrap(),
            serde_json::to_vec(&system).unwrap()
        );
        assert_eq!(
            serde_json::to_vec(&fetched.package_facts).unwrap(),
            serde_json::to_vec(&packages).unwrap()
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn last_submission_time_tracks_newest_record() {
    with_postgres_harness(|harness| async move {
        let address: IpAddr = "198.51.100.20".parse().unwrap();
        let repo = harness.repository();
        assert_eq!(repo.last_submission_time(address).await.unwrap(), None);

        let first = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let second = first + TimeDelta::minutes(40);
        for at in [second, first] {
            repo.persist(NewFactRecord::new(address, Map::new(), Map::new(), at))
                .await
                .expect("insert should succeed");
        }

        assert_eq!(repo.last_submission_time(address).await.unwrap(), Some(second));
        let other: IpAddr = "198.51.100.21".parse().unwrap();
        assert_eq!(repo.last_submission_time(other).await.unwrap(), None);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn duplicate_identifier_is_a_conflict() {
    with_postgres_harness(|harness| async move {
        let address: IpAddr = "198.51.100.30".parse().unwrap();
        let record = NewFactRecord::new(address, Map::new(), Map::new(), Utc::now());
        let duplicate = record.clone();

        harness.repository().persist(record).await.unwrap();
        let err = harness.repository().persist(duplicate).await.unwrap_err();
        assert!(
            matches!(err, fact_inventory::repository::StorageError::Conflict(_)),
            "unexpected error: {err:?}"
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn concurrent_http_submissions_store_one_row() {
    with_postgres_harness(|harness| async move {
        let harness = std::sync::Arc::new(harness);
        let payload = json!({"system_facts": {"os": "Debian"}, "package_facts": {}});

        let mut handles = Vec::new();
        for port in 0..8u16 {
            let harness = std::sync::Arc::clone(&harness);
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                let peer = format!("192.0.2.44:{}", 40000 + port);
                read_json(harness.submit(&peer, &payload).await).await.0
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.expect("submission task panicked") == http::StatusCode::CREATED {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        let address: IpAddr = "192.0.2.44".parse().unwrap();
        assert!(harness
            .repository()
            .last_submission_time(address)
            .await
            .unwrap()
            .is_some());
    })
    .await;
}
