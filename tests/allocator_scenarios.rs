use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dhcpalloc::{Allocator, Config, JsonLeaseStore, LeaseConfig, LeaseStore, MacAddress, Range};

struct TestGuard(PathBuf);
impl Drop for TestGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn test_config(name: &str, to: u8, duration: Duration, grace_period: Duration) -> (Config, TestGuard) {
    let path = std::env::temp_dir().join(format!("dhcpalloc_scenario_{}.json", name));
    let _ = std::fs::remove_file(&path);
    let config = Config {
        dns_servers: vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(1, 1, 1, 1)],
        gateway: Ipv4Addr::new(10, 0, 20, 1),
        db_file: path.clone(),
        dynamic_range: Range::new(Ipv4Addr::new(10, 0, 20, 50), Ipv4Addr::new(10, 0, 20, to)),
        lease: LeaseConfig {
            duration,
            grace_period,
        },
        ..Default::default()
    };
    (config, TestGuard(path))
}

fn mac(last: u8) -> MacAddress {
    MacAddress::new([0x52, 0x54, 0x00, 0x12, 0x34, last])
}

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 20, last)
}

#[tokio::test]
async fn allocate_purge_and_reallocate() {
    let (config, _guard) = test_config("reallocate", 100, Duration::from_millis(100), Duration::ZERO);
    let store = Arc::new(JsonLeaseStore::open(&config.db_file).await.unwrap());
    let allocator = Allocator::new(store.clone(), &config, None).unwrap();

    assert_eq!(allocator.allocate(mac(1), false, None).await.unwrap(), ip(50));
    assert_eq!(allocator.allocate(mac(1), false, None).await.unwrap(), ip(50));
    assert_eq!(allocator.allocate(mac(2), false, None).await.unwrap(), ip(51));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.purge_leases(false).await.unwrap(), 2);

    let fresh = Allocator::new(store.clone(), &config, None).unwrap();
    assert_eq!(fresh.allocate(mac(1), false, None).await.unwrap(), ip(50));
    assert_eq!(fresh.allocate(mac(2), false, None).await.unwrap(), ip(51));

    tokio::time::sleep(Duration::from_millis(150)).await;
    fresh.allocate(mac(1), true, None).await.unwrap();
    fresh.allocate(mac(2), true, None).await.unwrap();
    assert_eq!(store.purge_leases(false).await.unwrap(), 0);

    store.close().await.unwrap();
}

#[tokio::test]
async fn single_address_range_cycles() {
    let (config, _guard) = test_config("cycles", 50, Duration::from_millis(100), Duration::ZERO);
    let store = Arc::new(JsonLeaseStore::open(&config.db_file).await.unwrap());
    let allocator = Allocator::new(store.clone(), &config, None).unwrap();

    assert_eq!(allocator.allocate(mac(1), false, None).await.unwrap(), ip(50));

    let error = allocator.allocate(mac(2), false, None).await.unwrap_err();
    assert!(error.is_range_exhausted());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.purge_leases(false).await.unwrap(), 1);

    assert_eq!(allocator.allocate(mac(2), false, None).await.unwrap(), ip(50));
}

#[tokio::test]
async fn renewed_addresses_survive_pressure() {
    let (config, _guard) = test_config(
        "gaps",
        59,
        Duration::from_millis(300),
        Duration::from_secs(600),
    );
    let store = Arc::new(JsonLeaseStore::open(&config.db_file).await.unwrap());
    let allocator = Allocator::new(store.clone(), &config, None).unwrap();

    let mut kept = Vec::new();
    for index in 0..10 {
        let address = allocator.allocate(mac(index), false, None).await.unwrap();
        if index % 2 == 0 {
            kept.push((mac(index), address));
        }
    }

    tokio::time::sleep(Duration::from_millis(350)).await;

    for (owner, address) in &kept {
        assert_eq!(allocator.allocate(*owner, true, None).await.unwrap(), *address);
    }

    // The odd leases are past lease end but inside their grace period.
    assert_eq!(store.purge_leases(false).await.unwrap(), 0);
    assert_eq!(store.purge_leases(true).await.unwrap(), 5);

    for index in 10..15 {
        let address = allocator.allocate(mac(index), false, None).await.unwrap();
        assert!(
            kept.iter().all(|(_, held)| *held != address),
            "renewed address {} handed out again",
            address
        );
    }

    let error = allocator.allocate(mac(99), false, None).await.unwrap_err();
    assert!(error.is_range_exhausted());
}

#[tokio::test]
async fn preferred_address_moves_after_purge() {
    let (config, _guard) = test_config("preferred", 50, Duration::from_millis(100), Duration::ZERO);
    let store = Arc::new(JsonLeaseStore::open(&config.db_file).await.unwrap());
    let allocator = Allocator::new(store.clone(), &config, None).unwrap();

    let first = allocator.allocate(mac(1), false, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.purge_leases(true).await.unwrap(), 1);

    assert_eq!(allocator.allocate(mac(1), false, Some(first)).await.unwrap(), first);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.purge_leases(true).await.unwrap(), 1);

    assert_eq!(allocator.allocate(mac(2), false, Some(first)).await.unwrap(), first);
}

#[tokio::test]
async fn persistent_lease_outside_range() {
    let (config, _guard) = test_config("persistent", 59, Duration::from_millis(100), Duration::ZERO);
    let store = Arc::new(JsonLeaseStore::open(&config.db_file).await.unwrap());
    let allocator = Allocator::new(store.clone(), &config, None).unwrap();
    let pinned = Ipv4Addr::new(1, 2, 3, 4);
    let now = chrono::Utc::now();

    store
        .set_lease(dhcpalloc::Lease::new(mac(1), pinned, now, now).with_persistent(true))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.purge_leases(false).await.unwrap(), 0);
    assert_eq!(store.purge_leases(true).await.unwrap(), 0);

    assert_eq!(allocator.allocate(mac(1), false, None).await.unwrap(), pinned);
}

#[tokio::test]
async fn bindings_survive_restart() {
    let (config, _guard) = test_config("restart", 100, Duration::from_secs(3600), Duration::ZERO);

    {
        let store = Arc::new(JsonLeaseStore::open(&config.db_file).await.unwrap());
        let allocator = Allocator::new(store.clone(), &config, None).unwrap();
        assert_eq!(allocator.allocate(mac(1), false, None).await.unwrap(), ip(50));
        assert_eq!(allocator.allocate(mac(2), false, None).await.unwrap(), ip(51));
        store.close().await.unwrap();
    }

    let store = Arc::new(JsonLeaseStore::open(&config.db_file).await.unwrap());
    let allocator = Allocator::new(store.clone(), &config, None).unwrap();

    assert_eq!(allocator.allocate(mac(2), false, None).await.unwrap(), ip(51));
    assert_eq!(allocator.allocate(mac(3), false, None).await.unwrap(), ip(52));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn parallel_callers_mixing_preferred_and_scan() {
    let (config, _guard) = test_config("parallel", 100, Duration::from_secs(3600), Duration::ZERO);
    let store = Arc::new(JsonLeaseStore::open(&config.db_file).await.unwrap());
    let allocator = Arc::new(Allocator::new(store.clone(), &config, None).unwrap());

    let mut handles = Vec::new();
    for index in 0..40u8 {
        let allocator = Arc::clone(&allocator);
        let preferred = (index % 2 == 0).then_some(ip(75));
        handles.push(tokio::spawn(async move {
            allocator.allocate(mac(index), false, preferred).await
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let address = handle.await.unwrap().unwrap();
        assert!(config.dynamic_range.contains(address));
        assert!(seen.insert(address), "duplicate address {}", address);
    }
    assert_eq!(seen.len(), 40);

    let leases = store.list_leases().await.unwrap();
    assert_eq!(leases.len(), 40);
    assert_eq!(leases.iter().filter(|lease| lease.ip == ip(75)).count(), 1);
    store.close().await.unwrap();

    let reopened = JsonLeaseStore::open(&config.db_file).await.unwrap();
    assert_eq!(reopened.list_leases().await.unwrap(), leases);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_callers_exhaust_range_exactly() {
    let (config, _guard) = test_config("parallel_exhaust", 59, Duration::from_secs(3600), Duration::ZERO);
    let store = Arc::new(JsonLeaseStore::open(&config.db_file).await.unwrap());
    let allocator = Arc::new(Allocator::new(store.clone(), &config, None).unwrap());

    let mut handles = Vec::new();
    for index in 0..16u8 {
        let allocator = Arc::clone(&allocator);
        handles.push(tokio::spawn(async move {
            allocator.allocate(mac(index), false, None).await
        }));
    }

    let mut granted = HashSet::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(address) => assert!(granted.insert(address), "duplicate address {}", address),
            Err(error) => {
                assert!(error.is_range_exhausted(), "unexpected error: {}", error);
                exhausted += 1;
            }
        }
    }

    assert_eq!(granted.len(), 10);
    assert_eq!(exhausted, 6);
    assert_eq!(store.list_leases().await.unwrap().len(), 10);
}
