use std::sync::atomic::Ordering;
use std::time::Duration;

use lorawan_ns::class::ReceiveWindow;
use lorawan_ns::config::device::{AESKey, DevAddr, EUI64};
use lorawan_ns::config::ServerConfig;
use lorawan_ns::crypto::{self, Direction};
use lorawan_ns::device::{DeviceSession, LoRaDevice};
use lorawan_ns::dispatcher::{RadioUplink, UplinkOutcome};
use lorawan_ns::error::FailureReason;
use lorawan_ns::handler::{DataMessageHandler, DataUplink, UplinkStage};
use lorawan_ns::lorawan::commands::{self, MacCommand};
use lorawan_ns::lorawan::mac::{self, DataFrame, FCtrl, JoinAccept, MType};
use lorawan_ns::lorawan::region::DataRate;
use lorawan_ns::store::JoinInfo;
use tokio::time::Instant;

use mock::{cloud_message, metadata, radio, radio_with, Harness, TestDevice};

fn adr_on() -> FCtrl {
    FCtrl {
        adr: true,
        ..FCtrl::default()
    }
}

fn failure(outcome: &UplinkOutcome) -> (FailureReason, UplinkStage) {
    match outcome {
        UplinkOutcome::Failed(f) => (f.reason, f.stage),
        other => panic!("expected a failure, got {other:?}"),
    }
}

/// Uplink that arrived `ago` before now
fn late(payload: Vec<u8>, ago: Duration) -> RadioUplink {
    RadioUplink {
        arrival: Instant::now() - ago,
        ..radio(payload)
    }
}

#[tokio::test]
async fn test_unconfirmed_uplink_forwards_telemetry() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, false, 5, b"hello"))).await;
    assert_eq!(outcome, UplinkOutcome::Succeeded(None));

    let telemetry = h.telemetry.received();
    assert_eq!(telemetry.len(), 1);
    assert_eq!(telemetry[0].payload, b"hello");
    assert_eq!(telemetry[0].fcnt, 1);
    assert_eq!(telemetry[0].f_port, Some(5));
    assert_eq!(telemetry[0].dev_eui, dev.dev_eui);
}

#[tokio::test]
async fn test_replayed_counter_is_rejected() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    assert!(h.dispatcher.dispatch(radio(dev.uplink(5, false, 1, b"a"))).await.is_success());
    for fcnt in [5, 4] {
        let outcome = h.dispatcher.dispatch(radio(dev.uplink(fcnt, false, 1, b"a"))).await;
        assert_eq!(
            failure(&outcome),
            (FailureReason::InvalidFrameCounter, UplinkStage::FrameCounterCheck)
        );
    }
    assert_eq!(h.telemetry.received().len(), 1);
}

#[tokio::test]
async fn test_counter_gap_beyond_maximum_is_rejected() {
    let h = Harness::with_config(ServerConfig {
        max_fcnt_gap: 100,
        ..ServerConfig::default()
    });
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(101, false, 1, b"a"))).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::InvalidFrameCounter));
    assert!(h.dispatcher.dispatch(radio(dev.uplink(100, false, 1, b"a"))).await.is_success());
}

#[tokio::test]
async fn test_32bit_counter_rolls_over() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.supports_32bit_fcnt = true;
    attrs.fcnt_up = 0xFFFE;
    h.store.insert(attrs);

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(0x1_0001, false, 1, b"a"))).await;
    assert!(outcome.is_success());
    let device = h.dispatcher.registry().get(dev.dev_eui).unwrap();
    assert_eq!(device.lock().await.fcnt_up(), 0x1_0001);
}

#[tokio::test]
async fn test_confirmed_uplink_is_acknowledged_in_rx1() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, true, 1, b"ping"))).await;
    let downlink = outcome.downlink().unwrap();
    assert_eq!(downlink.window, ReceiveWindow::Rx1);
    assert_eq!(downlink.delay, Duration::from_secs(1));
    assert_eq!(downlink.tmst, 2_000_000);
    assert_eq!(downlink.frequency, 868_100_000);
    assert_eq!(downlink.data_rate, DataRate::SF7BW125);
    assert_eq!(downlink.fcnt_down, Some(0));

    let frame = dev.open_downlink(&downlink.payload, 0);
    assert_eq!(frame.mtype, MType::UnconfirmedDataDown);
    assert!(frame.fhdr.f_ctrl.ack);
    assert_eq!(frame.f_port, None);
}

#[tokio::test]
async fn test_resubmit_returns_cached_downlink_until_ceiling() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    let uplink = dev.uplink(1, true, 1, b"ping");

    let first = h.dispatcher.dispatch(radio(uplink.clone())).await;
    let payload = first.downlink().unwrap().payload.clone();

    for _ in 0..h.config.max_confirmation_resubmits {
        let again = h.dispatcher.dispatch(radio(uplink.clone())).await;
        let downlink = again.downlink().unwrap();
        assert_eq!(downlink.payload, payload);
        assert_eq!(downlink.fcnt_down, Some(0));
    }
    let over = h.dispatcher.dispatch(radio(uplink)).await;
    assert_eq!(
        over.failure_reason(),
        Some(FailureReason::ConfirmationResubmitThresholdExceeded)
    );

    // resubmits are not new telemetry
    assert_eq!(h.telemetry.received().len(), 1);
    let device = h.dispatcher.registry().get(dev.dev_eui).unwrap();
    assert_eq!(device.lock().await.fcnt_up(), 1);
}

#[tokio::test]
async fn test_unconfirmed_repeat_is_not_a_resubmit() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await;
    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::InvalidFrameCounter));
}

#[tokio::test]
async fn test_wrong_key_matches_no_device() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    let impostor = TestDevice {
        nwk_skey: AESKey::new([0xEE; 16]),
        ..dev
    };

    let outcome = h.dispatcher.dispatch(radio(impostor.uplink(1, false, 1, b"a"))).await;
    assert_eq!(
        failure(&outcome),
        (FailureReason::NotMatchingDeviceByAddress, UplinkStage::Unloaded)
    );
}

#[tokio::test]
async fn test_state_machine_checks_mic_before_touching_counters() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let handler = DataMessageHandler::new(
        h.config.clone(),
        h.store.clone(),
        h.cloud.clone(),
        h.telemetry.clone(),
    );
    let device = LoRaDevice::new(DeviceSession::from_attributes(dev.attributes(), &h.config));
    let impostor = TestDevice {
        nwk_skey: AESKey::new([0xEE; 16]),
        ..dev
    };
    let frame = DataFrame::parse(&impostor.uplink(3, false, 1, b"a")).unwrap();
    let meta = metadata(DataRate::SF7BW125, 7.5);

    let err = handler
        .handle(
            &device,
            DataUplink {
                frame: &frame,
                metadata: &meta,
                arrival: Instant::now(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.reason, FailureReason::AuthenticationFailed);
    assert_eq!(err.stage, UplinkStage::Authenticating);
    assert_eq!(device.lock().await.fcnt_up(), 0);
    assert!(h.telemetry.received().is_empty());
}

#[tokio::test]
async fn test_data_rate_outside_region_is_invalid() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let uplink = radio_with(dev.uplink(1, false, 1, b"a"), metadata(DataRate::SF12BW500, 5.0));
    let outcome = h.dispatcher.dispatch(uplink).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::InvalidFrame));
}

#[tokio::test]
async fn test_relaxed_reset_persists_synchronously() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.abp_relaxed = true;
    attrs.fcnt_up = 40;
    attrs.fcnt_down = 7;
    h.store.insert(attrs);

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(0, false, 1, b"boot"))).await;
    assert!(outcome.is_success());

    let persisted = h.store.persisted();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].1.fcnt_up, Some(0));
    assert_eq!(persisted[0].1.fcnt_down, Some(0));
    let stored = h.store.session(dev.dev_eui).unwrap();
    assert_eq!((stored.fcnt_up, stored.fcnt_down), (0, 0));

    // counting resumes from the reset
    assert!(h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await.is_success());
    assert!(h.dispatcher.dispatch(radio(dev.uplink(2, false, 1, b"a"))).await.is_success());
}

#[tokio::test]
async fn test_resent_restart_frame_is_a_resubmit() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.abp_relaxed = true;
    attrs.fcnt_up = 40;
    attrs.fcnt_down = 7;
    h.store.insert(attrs);
    let boot = dev.uplink(0, true, 1, b"boot");

    let first = h.dispatcher.dispatch(radio(boot.clone())).await;
    let payload = first.downlink().unwrap().payload.clone();
    assert_eq!(first.downlink().unwrap().fcnt_down, Some(0));

    // the device missed the ACK and sends the same frame again
    for _ in 0..h.config.max_confirmation_resubmits {
        let again = h.dispatcher.dispatch(radio(boot.clone())).await;
        let downlink = again.downlink().unwrap();
        assert_eq!(downlink.payload, payload);
        assert_eq!(downlink.fcnt_down, Some(0));
    }
    let over = h.dispatcher.dispatch(radio(boot)).await;
    assert_eq!(
        over.failure_reason(),
        Some(FailureReason::ConfirmationResubmitThresholdExceeded)
    );

    assert_eq!(h.telemetry.received().len(), 1);
    assert_eq!(h.store.persist_calls.load(Ordering::SeqCst), 1);
    let device = h.dispatcher.registry().get(dev.dev_eui).unwrap();
    assert_eq!(device.lock().await.fcnt_down(), 1);

    // an unconfirmed copy is a replay
    let replay = h.dispatcher.dispatch(radio(dev.uplink(0, false, 1, b"boot"))).await;
    assert_eq!(replay.failure_reason(), Some(FailureReason::InvalidFrameCounter));
}

#[tokio::test]
async fn test_reset_fails_when_store_unavailable() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.abp_relaxed = true;
    attrs.fcnt_up = 40;
    h.store.insert(attrs);
    h.store.fail_persist.store(true, Ordering::SeqCst);

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(0, false, 1, b"boot"))).await;
    assert_eq!(
        failure(&outcome),
        (FailureReason::BackendUnavailable, UplinkStage::FrameCounterCheck)
    );
    assert!(h.telemetry.received().is_empty());

    // nothing changed; the old counter still applies
    h.store.fail_persist.store(false, Ordering::SeqCst);
    assert!(h.dispatcher.dispatch(radio(dev.uplink(41, false, 1, b"a"))).await.is_success());
}

#[tokio::test]
async fn test_counter_restart_without_relaxed_mode_is_rejected() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.fcnt_up = 40;
    h.store.insert(attrs);

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(0, false, 1, b"boot"))).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::InvalidFrameCounter));
}

#[tokio::test]
async fn test_pending_reset_generation_applies_on_load() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.fcnt_up = 40;
    attrs.fcnt_reset_desired = Some(2);
    attrs.fcnt_reset_reported = Some(1);
    h.store.insert(attrs);

    assert!(h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await.is_success());
    let stored = h.store.session(dev.dev_eui).unwrap();
    assert_eq!(stored.fcnt_up, 1);
    assert_eq!(stored.fcnt_reset_reported, Some(2));
}

#[tokio::test]
async fn test_counters_saved_once_delta_reaches_threshold() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    for fcnt in 1..10 {
        assert!(h.dispatcher.dispatch(radio(dev.uplink(fcnt, false, 1, b"a"))).await.is_success());
    }
    assert_eq!(h.store.persist_calls.load(Ordering::SeqCst), 0);

    h.dispatcher.dispatch(radio(dev.uplink(10, false, 1, b"a"))).await;
    assert_eq!(h.store.persist_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.session(dev.dev_eui).unwrap().fcnt_up, 10);
}

#[tokio::test]
async fn test_failed_save_is_retried_on_a_later_uplink() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    h.store.fail_persist.store(true, Ordering::SeqCst);

    for fcnt in 1..=10 {
        // the uplink itself does not fail
        assert!(h.dispatcher.dispatch(radio(dev.uplink(fcnt, false, 1, b"a"))).await.is_success());
    }
    assert_eq!(h.store.session(dev.dev_eui).unwrap().fcnt_up, 0);

    h.store.fail_persist.store(false, Ordering::SeqCst);
    h.dispatcher.dispatch(radio(dev.uplink(11, false, 1, b"a"))).await;
    assert_eq!(h.store.session(dev.dev_eui).unwrap().fcnt_up, 11);
}

#[tokio::test]
async fn test_telemetry_failure_does_not_fail_uplink() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    h.telemetry.fail.store(true, Ordering::SeqCst);

    assert!(h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await.is_success());
}

#[tokio::test]
async fn test_cloud_message_delivered_with_unconfirmed_uplink() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    h.cloud.push(dev.dev_eui, cloud_message("m1", 10, b"hi"));

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await;
    let downlink = outcome.downlink().unwrap();
    let frame = dev.open_downlink(&downlink.payload, 0);
    assert_eq!(frame.f_port, Some(10));
    assert_eq!(frame.decrypt_payload(&dev.nwk_skey, &dev.app_skey, 0), b"hi");
    assert!(!frame.fhdr.f_ctrl.f_pending);
    assert_eq!(h.cloud.completed(), vec!["m1".to_string()]);
    assert_eq!(h.cloud.pending(dev.dev_eui), 0);
}

#[tokio::test]
async fn test_confirmed_cloud_message_uses_confirmed_downlink() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    let mut message = cloud_message("m1", 10, b"hi");
    message.confirmed = true;
    h.cloud.push(dev.dev_eui, message);

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await;
    let frame = dev.open_downlink(&outcome.downlink().unwrap().payload, 0);
    assert_eq!(frame.mtype, MType::ConfirmedDataDown);
}

#[tokio::test]
async fn test_second_message_sets_frame_pending() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    h.cloud.push(dev.dev_eui, cloud_message("m1", 10, b"one"));
    h.cloud.push(dev.dev_eui, cloud_message("m2", 10, b"two"));

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await;
    let frame = dev.open_downlink(&outcome.downlink().unwrap().payload, 0);
    assert!(frame.fhdr.f_ctrl.f_pending);
    assert_eq!(h.cloud.completed(), vec!["m1".to_string()]);
    assert_eq!(h.cloud.abandoned(), vec!["m2".to_string()]);
    assert_eq!(h.cloud.pending(dev.dev_eui), 1);
}

#[tokio::test]
async fn test_too_large_cloud_message_is_abandoned_for_later() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    // SF12 in EU868 leaves 51 bytes
    h.cloud.push(dev.dev_eui, cloud_message("big", 10, &[0x55; 60]));

    let uplink = radio_with(dev.uplink(1, false, 1, b"a"), metadata(DataRate::SF12BW125, 0.0));
    let outcome = h.dispatcher.dispatch(uplink).await;
    assert_eq!(outcome, UplinkOutcome::Succeeded(None));
    assert_eq!(h.cloud.abandoned(), vec!["big".to_string()]);
    assert!(h.cloud.rejected().is_empty());
    assert_eq!(h.cloud.pending(dev.dev_eui), 1);

    // at SF7 it fits
    let outcome = h.dispatcher.dispatch(radio(dev.uplink(2, false, 1, b"a"))).await;
    assert!(outcome.downlink().is_some());
    assert_eq!(h.cloud.completed(), vec!["big".to_string()]);
}

#[tokio::test]
async fn test_expiring_too_large_cloud_message_is_rejected() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    let mut message = cloud_message("big", 10, &[0x55; 60]);
    message.expires_at = Some(Instant::now() + Duration::from_millis(500));
    h.cloud.push(dev.dev_eui, message);

    let uplink = radio_with(dev.uplink(1, false, 1, b"a"), metadata(DataRate::SF12BW125, 0.0));
    h.dispatcher.dispatch(uplink).await;
    assert_eq!(h.cloud.rejected(), vec!["big".to_string()]);
    assert_eq!(h.cloud.pending(dev.dev_eui), 0);
}

#[tokio::test]
async fn test_reserved_port_cloud_message_is_rejected() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    h.cloud.push(dev.dev_eui, cloud_message("bad", 224, b"x"));

    h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await;
    assert_eq!(h.cloud.rejected(), vec!["bad".to_string()]);
}

#[tokio::test]
async fn test_downlink_disabled_skips_cloud_queue() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.downlink_enabled = false;
    h.store.insert(attrs);
    h.cloud.push(dev.dev_eui, cloud_message("m1", 10, b"hi"));

    h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await;
    assert_eq!(h.cloud.receive_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_link_check_answered_in_fopts() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let bytes = dev.uplink_with(1, false, FCtrl::default(), &[0x02], Some(1), b"a");
    let outcome = h.dispatcher.dispatch(radio(bytes)).await;
    let frame = dev.open_downlink(&outcome.downlink().unwrap().payload, 0);
    // 7.5 dB measured, SF7 needs -7.5 dB
    assert_eq!(
        commands::decode(&frame.fhdr.f_opts, Direction::Down).unwrap(),
        vec![MacCommand::LinkCheckAns {
            margin: 15,
            gateway_count: 1
        }]
    );
    assert_eq!(frame.f_port, None);
}

#[tokio::test]
async fn test_port_zero_commands_answered_in_port_zero() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    h.cloud.push(dev.dev_eui, cloud_message("m1", 10, b"hi"));

    let bytes = dev.uplink_with(1, false, FCtrl::default(), &[], Some(0), &[0x02]);
    let outcome = h.dispatcher.dispatch(radio(bytes)).await;
    let frame = dev.open_downlink(&outcome.downlink().unwrap().payload, 0);
    assert_eq!(frame.f_port, Some(0));
    assert!(frame.fhdr.f_opts.is_empty());
    assert_eq!(frame.decrypt_payload(&dev.nwk_skey, &dev.app_skey, 0), vec![0x02, 15, 1]);

    // port 0 is taken, the cloud message waits
    assert_eq!(h.cloud.abandoned(), vec!["m1".to_string()]);
    // MAC-only uplinks carry no telemetry
    assert!(h.telemetry.received().is_empty());
}

#[tokio::test]
async fn test_malformed_mac_commands_drop_the_frame() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let bytes = dev.uplink_with(1, true, FCtrl::default(), &[0xFF], Some(1), b"a");
    let outcome = h.dispatcher.dispatch(radio(bytes)).await;
    assert_eq!(
        failure(&outcome),
        (FailureReason::MalformedMacCommands, UplinkStage::Authenticating)
    );
    assert!(h.telemetry.received().is_empty());

    // the counter did not move
    assert!(h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await.is_success());
}

#[tokio::test]
async fn test_adr_raises_data_rate_then_lowers_power() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    let slow = || metadata(DataRate::SF12BW125, 10.0);
    let fast = || metadata(DataRate::SF7BW125, 10.0);
    let send = |fcnt: u32, meta| {
        let bytes = dev.uplink_with(fcnt, false, adr_on(), &[], Some(1), b"a");
        h.dispatcher.dispatch(radio_with(bytes, meta))
    };
    let adr_request = |outcome: &UplinkOutcome, fcnt_down: u32| {
        let frame = dev.open_downlink(&outcome.downlink().unwrap().payload, fcnt_down);
        commands::decode(&frame.fhdr.f_opts, Direction::Down).unwrap()
    };

    // not enough history yet
    for fcnt in 1..20 {
        assert_eq!(send(fcnt, slow()).await, UplinkOutcome::Succeeded(None));
    }
    // (10 + 20 - 5) / 3 = 8 steps: DR0 -> DR5, then 3 power steps
    let outcome = send(20, slow()).await;
    assert_eq!(
        adr_request(&outcome, 0),
        vec![MacCommand::LinkADRReq {
            data_rate: 5,
            tx_power: 3,
            ch_mask: 0x0000,
            ch_mask_cntl: 6,
            nb_trans: 1
        }]
    );
    // the device has not switched yet; the request is not repeated
    assert_eq!(send(21, slow()).await, UplinkOutcome::Succeeded(None));

    // at DR5 the history starts over: (10 + 7.5 - 5) / 3 = 4 power steps
    for fcnt in 22..41 {
        assert_eq!(send(fcnt, fast()).await, UplinkOutcome::Succeeded(None));
    }
    let outcome = send(41, fast()).await;
    assert_eq!(
        adr_request(&outcome, 1),
        vec![MacCommand::LinkADRReq {
            data_rate: 5,
            tx_power: 7,
            ch_mask: 0x0000,
            ch_mask_cntl: 6,
            nb_trans: 1
        }]
    );

    // at the region limits nothing changes any more; 50 triggers a save
    for fcnt in 42..=50 {
        assert_eq!(send(fcnt, fast()).await, UplinkOutcome::Succeeded(None));
    }
    let stored = h.store.session(dev.dev_eui).unwrap();
    assert_eq!((stored.data_rate, stored.tx_power), (Some(5), Some(7)));
}

#[tokio::test]
async fn test_adr_ack_req_gets_an_answer() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let f_ctrl = FCtrl {
        adr: true,
        adr_ack_req: true,
        ..FCtrl::default()
    };
    let bytes = dev.uplink_with(1, false, f_ctrl, &[], Some(1), b"a");
    let outcome = h.dispatcher.dispatch(radio(bytes)).await;
    let frame = dev.open_downlink(&outcome.downlink().unwrap().payload, 0);
    assert!(frame.fhdr.f_ctrl.adr);
    assert!(matches!(
        commands::decode(&frame.fhdr.f_opts, Direction::Down).unwrap()[..],
        [MacCommand::LinkADRReq {
            data_rate: 5,
            tx_power: 0,
            ..
        }]
    ));
}

#[tokio::test]
async fn test_late_unconfirmed_uplink_still_counts() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    h.cloud.push(dev.dev_eui, cloud_message("m1", 10, b"hi"));

    let outcome = h
        .dispatcher
        .dispatch(late(dev.uplink(1, false, 1, b"a"), Duration::from_secs(2)))
        .await;
    assert_eq!(outcome, UplinkOutcome::Succeeded(None));
    assert_eq!(h.telemetry.received().len(), 1);
    // no time to look at the queue
    assert_eq!(h.cloud.receive_calls.load(Ordering::SeqCst), 0);
    let device = h.dispatcher.registry().get(dev.dev_eui).unwrap();
    assert_eq!(device.lock().await.fcnt_up(), 1);
}

#[tokio::test]
async fn test_late_confirmed_uplink_misses_window() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let outcome = h
        .dispatcher
        .dispatch(late(dev.uplink(1, true, 1, b"a"), Duration::from_secs(2)))
        .await;
    assert_eq!(
        failure(&outcome),
        (FailureReason::ReceiveWindowMissed, UplinkStage::Processing)
    );
}

#[tokio::test]
async fn test_rx2_used_when_rx1_is_out_of_reach() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let outcome = h
        .dispatcher
        .dispatch(late(dev.uplink(1, true, 1, b"a"), Duration::from_millis(900)))
        .await;
    let downlink = outcome.downlink().unwrap();
    assert_eq!(downlink.window, ReceiveWindow::Rx2);
    assert_eq!(downlink.frequency, 869_525_000);
    assert_eq!(downlink.data_rate, DataRate::SF12BW125);
    assert_eq!(downlink.tmst, 1_000_000 + 2_000_000);
}

#[tokio::test]
async fn test_preferred_rx2_is_honored() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.preferred_window = 2;
    attrs.rx2_data_rate = Some(3);
    h.store.insert(attrs);

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, true, 1, b"a"))).await;
    let downlink = outcome.downlink().unwrap();
    assert_eq!(downlink.window, ReceiveWindow::Rx2);
    assert_eq!(downlink.data_rate_index, 3);
    assert_eq!(downlink.data_rate, DataRate::SF9BW125);
}

#[tokio::test]
async fn test_foreign_network_is_rejected_unless_allowed() {
    let foreign = DevAddr::from_u32(0xFE00_0001);
    let dev = TestDevice::at(1, foreign);

    let h = Harness::new();
    h.store.insert(dev.attributes());
    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await;
    assert_eq!(
        failure(&outcome),
        (FailureReason::InvalidNetworkId, UplinkStage::Unloaded)
    );
    assert_eq!(h.store.candidate_calls.load(Ordering::SeqCst), 0);

    let h = Harness::with_config(ServerConfig {
        allowed_dev_addrs: vec![foreign],
        ..ServerConfig::default()
    });
    h.store.insert(dev.attributes());
    assert!(h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await.is_success());
}

#[tokio::test]
async fn test_device_of_another_gateway_is_released() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.gateway_id = Some("elsewhere".into());
    h.store.insert(attrs);

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, false, 1, b"a"))).await;
    assert_eq!(
        failure(&outcome),
        (FailureReason::BelongsToAnotherGateway, UplinkStage::Authenticating)
    );
    assert!(h.dispatcher.registry().get(dev.dev_eui).is_none());
    assert!(h.telemetry.received().is_empty());
}

#[tokio::test]
async fn test_shared_device_allocates_counters_through_store() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.gateway_id = None;
    h.store.insert(attrs);

    let outcome = h.dispatcher.dispatch(radio(dev.uplink(1, true, 1, b"a"))).await;
    assert_eq!(outcome.downlink().unwrap().fcnt_down, Some(0));
    assert_eq!(h.store.allocate_calls.load(Ordering::SeqCst), 1);
    // a remote allocation is always written back
    assert_eq!(h.store.session(dev.dev_eui).unwrap().fcnt_down, 1);

    h.store.allocation_taken.store(true, Ordering::SeqCst);
    let outcome = h.dispatcher.dispatch(radio(dev.uplink(2, true, 1, b"a"))).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::HandledByAnotherGateway));
}

#[tokio::test]
async fn test_shared_device_reset_clears_counter_cache() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    let mut attrs = dev.attributes();
    attrs.gateway_id = None;
    attrs.abp_relaxed = true;
    attrs.fcnt_up = 12;
    h.store.insert(attrs);

    assert!(h.dispatcher.dispatch(radio(dev.uplink(0, false, 1, b"a"))).await.is_success());
    assert_eq!(h.store.reset_cache_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_uplinks_of_one_device_never_interleave() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());

    let pending: Vec<_> = (1..=5)
        .map(|fcnt| h.dispatcher.submit(radio(dev.uplink(fcnt, false, 1, b"a"))))
        .collect();
    let mut outcomes = Vec::new();
    for p in pending {
        outcomes.push(p.wait().await);
    }

    // whatever the order, the highest counter always wins and counters only grow
    assert!(outcomes[4].is_success());
    let fcnts: Vec<u32> = h.telemetry.received().iter().map(|t| t.fcnt).collect();
    assert_eq!(fcnts.len(), outcomes.iter().filter(|o| o.is_success()).count());
    assert!(fcnts.windows(2).all(|w| w[0] < w[1]));
    let device = h.dispatcher.registry().get(dev.dev_eui).unwrap();
    assert_eq!(device.lock().await.fcnt_up(), 5);
    assert_eq!(h.store.candidate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_undecodable_payload_is_invalid_frame() {
    let h = Harness::new();
    let outcome = h.dispatcher.dispatch(radio(vec![0x40, 0x01])).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::InvalidFrame));
}

fn join_setup(h: &Harness) -> (EUI64, EUI64, AESKey) {
    let dev_eui = EUI64::new([0xB0, 0, 0, 0, 0, 0, 0, 1]);
    let join_eui = EUI64::new([0x70, 0, 0, 0, 0, 0, 0, 9]);
    let app_key = AESKey::new([0x2B; 16]);
    let mut info = JoinInfo::new(app_key, join_eui);
    info.gateway_id = Some(h.config.gateway_id.clone());
    info.last_dev_nonce = Some(7);
    h.store.insert_join_info(dev_eui, info);
    (dev_eui, join_eui, app_key)
}

#[tokio::test]
async fn test_join_installs_session_and_answers() {
    let h = Harness::new();
    let (dev_eui, join_eui, app_key) = join_setup(&h);

    let request = mac::build_join_request(&app_key, join_eui, dev_eui, 8);
    let outcome = h.dispatcher.dispatch(radio(request)).await;
    let downlink = outcome.downlink().unwrap();
    assert_eq!(downlink.window, ReceiveWindow::Rx1);
    assert_eq!(downlink.delay, Duration::from_secs(5));
    assert_eq!(downlink.fcnt_down, None);

    let accept = JoinAccept::decode(&app_key, &downlink.payload).unwrap();
    assert_eq!(accept.net_id, h.config.net_id);
    assert_eq!(accept.dev_addr.nwk_id(), h.config.net_id.nwk_id());

    // persisted before the accept went out
    let stored = h.store.session(dev_eui).unwrap();
    assert_eq!(stored.dev_addr, accept.dev_addr);
    assert_eq!(stored.dev_nonce, Some(8));
    assert_eq!((stored.fcnt_up, stored.fcnt_down), (0, 0));

    // the device derives the same keys and can talk right away
    let (nwk_skey, app_skey) =
        crypto::derive_session_keys(&app_key, &accept.app_nonce, accept.net_id, 8);
    let dev = TestDevice {
        dev_eui,
        dev_addr: accept.dev_addr,
        nwk_skey,
        app_skey,
    };
    let outcome = h.dispatcher.dispatch(radio(dev.uplink(0, false, 1, b"hello"))).await;
    assert!(outcome.is_success());
    assert_eq!(h.telemetry.received()[0].payload, b"hello");
}

#[tokio::test]
async fn test_join_rejections() {
    let h = Harness::new();
    let (dev_eui, join_eui, app_key) = join_setup(&h);

    let reused = mac::build_join_request(&app_key, join_eui, dev_eui, 7);
    let outcome = h.dispatcher.dispatch(radio(reused)).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::JoinDevNonceReused));

    let wrong_key = mac::build_join_request(&AESKey::new([1; 16]), join_eui, dev_eui, 9);
    let outcome = h.dispatcher.dispatch(radio(wrong_key)).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::AuthenticationFailed));

    let unknown = mac::build_join_request(&app_key, join_eui, EUI64::new([9; 8]), 9);
    let outcome = h.dispatcher.dispatch(radio(unknown)).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::UnknownDevice));

    let late_join = RadioUplink {
        arrival: Instant::now() - Duration::from_secs(6),
        ..radio(mac::build_join_request(&app_key, join_eui, dev_eui, 10))
    };
    let outcome = h.dispatcher.dispatch(late_join).await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::ReceiveWindowMissed));
    assert!(h.store.persisted().is_empty());
}

#[tokio::test]
async fn test_submitted_uplink_reports_pending_then_outcome() {
    let h = Harness::new();
    let dev = TestDevice::new(1);
    h.store.insert(dev.attributes());
    h.store.delay_candidates(Duration::from_millis(30));

    let mut pending = h.dispatcher.submit(radio(dev.uplink(1, false, 1, b"a")));
    assert!(pending.try_outcome().is_none());
    assert!(pending.wait().await.is_success());
}
