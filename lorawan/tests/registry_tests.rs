use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use lorawan_ns::config::device::{AESKey, DevAddr};
use lorawan_ns::config::ServerConfig;
use lorawan_ns::error::FailureReason;
use lorawan_ns::lorawan::mac::DataFrame;
use lorawan_ns::registry::Registry;

use mock::{MockDeviceStore, TestDevice};

fn registry(store: &Arc<MockDeviceStore>) -> Registry {
    Registry::new(Arc::new(ServerConfig::default()), store.clone())
}

fn frame(device: &TestDevice, fcnt: u32) -> DataFrame {
    DataFrame::parse(&device.uplink(fcnt, false, 1, b"x")).unwrap()
}

#[tokio::test]
async fn test_concurrent_cold_uplinks_share_one_lookup() {
    let store = MockDeviceStore::new();
    let shared = DevAddr::from_u32(0x0000_2000);
    let a = TestDevice::at(1, shared);
    let b = TestDevice::at(2, shared);
    store.insert(a.attributes());
    store.insert(b.attributes());
    store.delay_candidates(Duration::from_millis(50));
    let registry = registry(&store);

    let (fa, fb) = (frame(&a, 1), frame(&b, 1));
    let (ra, rb) = tokio::join!(registry.resolve_for_frame(&fa), registry.resolve_for_frame(&fb));

    // both frames resolve, each to the device whose key signed it
    assert_eq!(ra.unwrap().dev_eui(), a.dev_eui);
    assert_eq!(rb.unwrap().dev_eui(), b.dev_eui);
    assert_eq!(store.candidate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.session_calls.load(Ordering::SeqCst), 2);
    assert_eq!(registry.loaders_in_flight(), 0);
}

#[tokio::test]
async fn test_cache_hit_skips_backend() {
    let store = MockDeviceStore::new();
    let device = TestDevice::new(1);
    store.insert(device.attributes());
    let registry = registry(&store);

    registry.resolve_for_frame(&frame(&device, 1)).await.unwrap();
    registry.resolve_for_frame(&frame(&device, 2)).await.unwrap();

    assert_eq!(store.candidate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.session_calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.resolve(device.dev_addr).map(|d| d.len()), Some(1));
}

#[tokio::test]
async fn test_cache_hit_with_wrong_key_does_not_reload() {
    let store = MockDeviceStore::new();
    let device = TestDevice::new(1);
    store.insert(device.attributes());
    let registry = registry(&store);
    registry.resolve_for_frame(&frame(&device, 1)).await.unwrap();

    let impostor = TestDevice {
        nwk_skey: AESKey::new([0xEE; 16]),
        ..device
    };
    let result = registry.resolve_for_frame(&frame(&impostor, 2)).await;
    assert_eq!(result.unwrap_err(), FailureReason::NotMatchingDeviceByAddress);
    assert_eq!(store.candidate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_backend_failure_fails_waiters_and_is_not_cached() {
    let store = MockDeviceStore::new();
    let device = TestDevice::new(1);
    store.insert(device.attributes());
    store.fail_candidates.store(true, Ordering::SeqCst);
    store.delay_candidates(Duration::from_millis(20));
    let registry = registry(&store);

    let (f1, f2) = (frame(&device, 1), frame(&device, 2));
    let (r1, r2) = tokio::join!(registry.resolve_for_frame(&f1), registry.resolve_for_frame(&f2));
    assert_eq!(r1.unwrap_err(), FailureReason::BackendUnavailable);
    assert_eq!(r2.unwrap_err(), FailureReason::BackendUnavailable);
    assert_eq!(store.candidate_calls.load(Ordering::SeqCst), 1);
    assert!(registry.resolve(device.dev_addr).is_none());

    // the next uplink retries
    store.fail_candidates.store(false, Ordering::SeqCst);
    registry.resolve_for_frame(&frame(&device, 3)).await.unwrap();
    assert_eq!(store.candidate_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_empty_lookup_is_not_cached() {
    let store = MockDeviceStore::new();
    let device = TestDevice::new(1);
    let registry = registry(&store);

    let result = registry.resolve_for_frame(&frame(&device, 1)).await;
    assert_eq!(result.unwrap_err(), FailureReason::NotMatchingDeviceByAddress);

    // provisioned afterwards: picked up without waiting for a TTL
    store.insert(device.attributes());
    registry.resolve_for_frame(&frame(&device, 2)).await.unwrap();
    assert_eq!(store.candidate_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_candidate_does_not_block_others() {
    let store = MockDeviceStore::new();
    let shared = DevAddr::from_u32(0x0000_2000);
    let fast = TestDevice::at(1, shared);
    let slow = TestDevice::at(2, shared);
    store.insert(fast.attributes());
    store.insert(slow.attributes());
    store.delay_session(slow.dev_eui, Duration::from_secs(10));
    let registry = registry(&store);

    let (ff, fs) = (frame(&fast, 1), frame(&slow, 1));
    let (rf, rs) = tokio::join!(registry.resolve_for_frame(&ff), registry.resolve_for_frame(&fs));
    assert_eq!(rf.unwrap().dev_eui(), fast.dev_eui);
    assert_eq!(rs.unwrap_err(), FailureReason::NotMatchingDeviceByAddress);
}

#[tokio::test]
async fn test_every_candidate_failing_is_backend_unavailable() {
    let store = MockDeviceStore::new();
    let device = TestDevice::new(1);
    store.insert(device.attributes());
    store.fail_session(device.dev_eui);
    let registry = registry(&store);

    let result = registry.resolve_for_frame(&frame(&device, 1)).await;
    assert_eq!(result.unwrap_err(), FailureReason::BackendUnavailable);
}

#[tokio::test]
async fn test_entry_expires_after_reload_interval() {
    let store = MockDeviceStore::new();
    let device = TestDevice::new(1);
    store.insert(device.attributes());
    let config = ServerConfig {
        dev_addr_reload_interval_ms: 50,
        ..ServerConfig::default()
    };
    let registry = Registry::new(Arc::new(config), store.clone());

    registry.resolve_for_frame(&frame(&device, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    registry.resolve_for_frame(&frame(&device, 2)).await.unwrap();

    assert_eq!(store.candidate_calls.load(Ordering::SeqCst), 2);
    // the session itself is still cached and reused
    assert_eq!(store.session_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalidate_forces_reload() {
    let store = MockDeviceStore::new();
    let device = TestDevice::new(1);
    store.insert(device.attributes());
    let registry = registry(&store);

    registry.resolve_for_frame(&frame(&device, 1)).await.unwrap();
    registry.invalidate(device.dev_eui);
    assert!(registry.get(device.dev_eui).is_none());
    assert!(registry.resolve(device.dev_addr).is_none());

    registry.resolve_for_frame(&frame(&device, 2)).await.unwrap();
    assert_eq!(store.candidate_calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.session_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_address_drops_every_device() {
    let store = MockDeviceStore::new();
    let shared = DevAddr::from_u32(0x0000_2000);
    let a = TestDevice::at(1, shared);
    let b = TestDevice::at(2, shared);
    store.insert(a.attributes());
    store.insert(b.attributes());
    let registry = registry(&store);

    registry.resolve_for_frame(&frame(&a, 1)).await.unwrap();
    registry.invalidate_address(shared);
    assert!(registry.resolve(shared).is_none());
    assert!(registry.get(a.dev_eui).is_none());
    assert!(registry.get(b.dev_eui).is_none());
}

#[tokio::test]
async fn test_join_replaces_stale_address_mapping() {
    let store = MockDeviceStore::new();
    let device = TestDevice::new(1);
    store.insert(device.attributes());
    let registry = registry(&store);
    registry.resolve_for_frame(&frame(&device, 1)).await.unwrap();

    let rejoined = TestDevice {
        dev_addr: DevAddr::from_u32(0x0000_3000),
        nwk_skey: AESKey::new([0x42; 16]),
        ..device
    };
    registry.get_or_create_for_join(rejoined.attributes());

    assert!(registry.resolve(device.dev_addr).is_none());
    let cached = registry.get(device.dev_eui).unwrap();
    assert_eq!(cached.dev_addr(), rejoined.dev_addr);
    assert_eq!(cached.lock().await.fcnt_up(), 0);
}

#[tokio::test]
async fn test_keep_alive_timeout_evicts_idle_session() {
    let store = MockDeviceStore::new();
    let short = TestDevice::new(1);
    let regular = TestDevice::new(2);
    let mut attrs = short.attributes();
    attrs.keep_alive_timeout = Some(Duration::from_millis(50));
    store.insert(attrs);
    store.insert(regular.attributes());
    let registry = registry(&store);

    registry.resolve_for_frame(&frame(&short, 1)).await.unwrap();
    registry.resolve_for_frame(&frame(&regular, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    // the session index falls back to the configured idle timeout
    assert!(registry.get(short.dev_eui).is_none());
    assert!(registry.get(regular.dev_eui).is_some());
}
