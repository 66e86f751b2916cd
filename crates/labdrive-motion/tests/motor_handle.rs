//! Motor handle actor against an in-memory register bank.

use labdrive_core::mock::MockTransport;
use labdrive_core::{ErrorKind, SharedTransport, Transport};
use labdrive_motion::scan::{
    CONTROL_ENABLE, CONTROL_QUICK_STOP, CONTROL_TOGGLE, FRAMING_WORD, STATUS_FAULT,
};
use labdrive_motion::{HandleConfig, MotorDrive, MotorHandle, OperatingMode, PinLevel};
use std::sync::Arc;
use std::time::Duration;

const INPUT: u16 = 100;

fn config() -> HandleConfig {
    HandleConfig {
        input_base: INPUT,
        pin_register: 50,
        ..HandleConfig::default()
    }
}

async fn open() -> (Arc<MockTransport>, MotorHandle) {
    let mock = Arc::new(MockTransport::opened());
    let transport: SharedTransport = mock.clone();
    let handle = MotorHandle::open("traverse", transport, config())
        .await
        .unwrap();
    (mock, handle)
}

#[tokio::test(start_paused = true)]
async fn open_enables_speed_mode() {
    let (mock, handle) = open().await;
    assert_eq!(mock.register(0), FRAMING_WORD);
    let control = mock.register(4);
    assert_eq!(control >> 8, OperatingMode::Speed.code() as u16);
    assert_ne!(control & CONTROL_ENABLE, 0);
    assert_eq!(control & CONTROL_QUICK_STOP, 0);
    assert_eq!((mock.register(5), mock.register(6)), (0, 0));
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn set_speed_writes_rate_and_flips_toggle() {
    let (mock, handle) = open().await;
    let before = mock.register(4) & CONTROL_TOGGLE;

    handle.set_speed(0.05, 0.025).await.unwrap();
    assert_eq!((mock.register(5), mock.register(6)), (0, 3000));
    assert_eq!((mock.register(9), mock.register(10)), (0, 1500));
    assert_ne!(mock.register(4) & CONTROL_TOGGLE, before);

    handle.set_speed(-0.05, 0.025).await.unwrap();
    assert_eq!(
        (mock.register(5), mock.register(6)),
        (0xFFFF, (-3000i32 as u32 & 0xFFFF) as u16)
    );
    assert_eq!(mock.register(4) & CONTROL_TOGGLE, before);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn position_comes_from_input_block() {
    let (mock, handle) = open().await;
    mock.set_register(INPUT + 7, 0);
    mock.set_register(INPUT + 8, 5000);
    assert!((handle.position().await.unwrap() - 0.005).abs() < 1e-12);

    // -5000 counts
    mock.set_register(INPUT + 7, 0xFFFF);
    mock.set_register(INPUT + 8, 0xEC78);
    assert!((handle.position().await.unwrap() + 0.005).abs() < 1e-12);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn quick_stop_latches_until_reset() {
    let (mock, handle) = open().await;
    handle.set_speed(0.05, 0.025).await.unwrap();
    handle.quick_stop().await.unwrap();
    assert_ne!(mock.register(4) & CONTROL_QUICK_STOP, 0);
    assert_eq!(mock.register(6), 0);

    let err = handle.set_speed(0.01, 0.025).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    handle.reset_fault().await.unwrap();
    assert_eq!(mock.register(4) & CONTROL_QUICK_STOP, 0);
    handle.set_speed(0.01, 0.025).await.unwrap();
    assert_eq!(mock.register(6), 600);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_refreshes_status() {
    let (mock, handle) = open().await;
    assert!(!handle.status().await.unwrap().fault);

    mock.set_register(INPUT + 4, STATUS_FAULT);
    mock.set_register(INPUT + 10, 7);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = handle.status().await.unwrap();
    assert!(status.fault);
    assert_eq!(status.fault_code, 7);
    let err = handle.set_speed(0.01, 0.025).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    mock.set_register(INPUT + 4, 0);
    handle.reset_fault().await.unwrap();
    assert!(!handle.status().await.unwrap().fault);
    handle.set_speed(0.01, 0.025).await.unwrap();
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn pin_is_written_in_millivolts() {
    let (mock, handle) = open().await;
    handle.set_pin(PinLevel::High).await.unwrap();
    assert_eq!(mock.register(50), 5000);
    handle.set_pin(PinLevel::Idle).await.unwrap();
    assert_eq!(mock.register(50), 2500);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent() {
    let (mock, handle) = open().await;
    handle.set_speed(0.05, 0.025).await.unwrap();
    handle.close().await.unwrap();
    assert!(handle.is_closed());
    // zero speed was commanded on the way out
    assert_eq!(mock.register(6), 0);
    assert!(!mock.is_open());

    handle.close().await.unwrap();
    let err = handle.position().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}

#[tokio::test(start_paused = true)]
async fn dropped_handle_still_zeroes_speed() {
    let (mock, handle) = open().await;
    handle.set_speed(0.05, 0.025).await.unwrap();
    assert_eq!(mock.register(6), 3000);

    drop(handle);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!((mock.register(5), mock.register(6)), (0, 0));
}
