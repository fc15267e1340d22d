//! Command dispatcher, state machine and polling against a simulated MD-100

mod common;

use cctalk_core::core::device::md100::OperationMode;
use cctalk_core::core::device::{DeviceError, DeviceNotification, DeviceState};
use cctalk_core::core::transport::TransportError;
use common::{
    connected_master, eventually, md100_rig, reply, FakeBus, Reply, SimulatedMd100,
    COMMAND_TIMEOUT, DEVICE,
};
use std::time::Duration;
use tokio::sync::broadcast;

async fn next_bill_accepted(rx: &mut broadcast::Receiver<DeviceNotification>) -> Option<(u8, u32)> {
    let deadline = tokio::time::sleep(Duration::from_secs(1));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            received = rx.recv() => match received {
                Ok(DeviceNotification::BillAccepted { bill_type, nominal }) => {
                    return Some((bill_type, nominal));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            },
        }
    }
}

#[tokio::test]
async fn test_typed_commands() {
    let sim = SimulatedMd100::new();
    let (_bus, _master, device) = md100_rig(&sim).await;
    let slave = device.slave();

    assert!(slave.simple_poll().await.unwrap());
    let comms = slave.request_comms_revision().await.unwrap();
    assert_eq!((comms.release, comms.major, comms.minor), (1, 4, 2));
    assert_eq!(slave.request_manufacturer_id().await.unwrap(), "SUZO");
    assert_eq!(slave.request_option_flags().await.unwrap(), 0x01);

    let scaling = slave.request_country_scaling_factor("RU").await.unwrap();
    assert_eq!(scaling.factor(), 1);
    assert_eq!(scaling.decimals, 2);

    assert_eq!(device.read_serial_number().await.unwrap(), "321");
    assert_eq!(
        device.read_checksums().await.unwrap(),
        vec!["0807", "0605", "0403", "0201"]
    );
    let software = device.read_software_revision().await.unwrap();
    assert_eq!(software.firmware.trim(), "MD-100 V1.07");
    assert_eq!(software.dispenser.trim(), "DISP 1.2");
}

#[tokio::test]
async fn test_country_code_too_long() {
    let sim = SimulatedMd100::new();
    let (bus, _master, device) = md100_rig(&sim).await;

    let err = device
        .slave()
        .request_country_scaling_factor("RUS")
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::InvalidArgument(_)));
    assert!(bus.requests_with(156).is_empty());
}

#[tokio::test]
async fn test_short_replies_are_incomplete() {
    let bus = FakeBus::new(true, |_| reply(&[1]));
    let master = connected_master(&bus).await;
    let slave = master.add_slave(DEVICE).with_timeout(COMMAND_TIMEOUT);

    let err = slave.request_comms_revision().await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::IncompleteMessage { expected: 3, received: 1, .. }
    ));
    let err = slave.read_buffered_bill_events().await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::IncompleteMessage { expected: 11, received: 1, .. }
    ));
}

#[tokio::test]
async fn test_bill_table_commands() {
    let sim = SimulatedMd100::new();
    let (bus, _master, device) = md100_rig(&sim).await;

    let bill = device.request_bill_type(4).await.unwrap();
    assert_eq!(bill.country, "RU");
    assert_eq!(bill.value_code, 500);

    let empty = device.request_bill_type(12).await.unwrap();
    assert!(empty.country.is_empty());
    assert_eq!(empty.value_code, 0);

    device.apply_inhibit_mask(0b10_0101).await.unwrap();
    let sent = bus.requests_with(231);
    assert_eq!(sent.last().unwrap().data(), &[0x25, 0x00, 0x00]);
    assert_eq!(device.read_inhibit_mask().await.unwrap(), 0b10_0101);
    assert!(device.is_accepting());
    let table = device.bill_types();
    assert!(table.get(1).unwrap().enabled);
    assert!(!table.get(2).unwrap().enabled);

    let sizes = device.request_fill_sizes().await.unwrap();
    assert_eq!(sizes.len(), 21);
    assert_eq!(device.bill_types().fill_size(0x12), 12);
    assert_eq!(device.bill_types().fill_size(0x13), 5);
}

#[tokio::test]
async fn test_mode_change_requires_ready_device() {
    let sim = SimulatedMd100::new();
    let (bus, _master, device) = md100_rig(&sim).await;

    let err = device.set_operation_mode(OperationMode::Unload).await.unwrap_err();
    assert!(matches!(err, DeviceError::NotReady));
    assert!(bus.requests_with(153).is_empty());

    device.poll_once().await.unwrap();
    assert!(device.is_ready());
    let mode = device.change_operation_mode(OperationMode::Unload).await.unwrap();
    assert_eq!(mode, OperationMode::Unload);
    assert_eq!(device.info().operation_mode, OperationMode::Unload);
}

#[tokio::test]
async fn test_polling_tracks_device_state() {
    let sim = SimulatedMd100::new();
    let (_bus, _master, device) = md100_rig(&sim).await;
    let mut rx = device.subscribe();

    device.start_polling();
    assert!(device.is_polling());
    assert!(eventually(|| device.is_ready()).await);

    sim.schedule(&[(0x20, 0), (0x22, 0)]);
    assert!(eventually(|| device.state() == DeviceState::Init).await);
    assert!(!device.is_ready());

    sim.schedule(&[(0x27, 0)]);
    assert!(eventually(|| device.is_ready()).await);

    let mut saw_poll_response = false;
    while let Ok(notification) = rx.try_recv() {
        if matches!(notification, DeviceNotification::PollResponse { .. }) {
            saw_poll_response = true;
        }
    }
    assert!(saw_poll_response);

    device.stop_polling().await;
    assert!(!device.is_polling());
}

#[tokio::test]
async fn test_log_holds_each_event_once() {
    let sim = SimulatedMd100::new();
    let (_bus, _master, device) = md100_rig(&sim).await;
    sim.schedule(&[(0x26, 0), (0x27, 0), (0x28, 0)]);

    for _ in 0..6 {
        device.poll_once().await.unwrap();
    }
    let numbers: Vec<u8> = device
        .state_machine()
        .events()
        .iter()
        .map(|e| e.number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(device.state(), DeviceState::Locked);
    assert!(!device.state_machine().has_new_event());
}

#[tokio::test]
async fn test_empty_event_buffer_clears_log() {
    let sim = SimulatedMd100::new();
    let (_bus, _master, device) = md100_rig(&sim).await;
    device.poll_once().await.unwrap();
    assert_eq!(device.state_machine().events().len(), 1);

    {
        let mut state = sim.state.lock();
        state.counter = 0;
        state.events.clear();
    }
    assert_eq!(device.poll_once().await.unwrap(), 0);
    assert!(device.state_machine().events().is_empty());
}

#[tokio::test]
async fn test_bill_accepted_notification() {
    let sim = SimulatedMd100::new();
    let (_bus, _master, device) = md100_rig(&sim).await;
    device.request_bill_type(4).await.unwrap();
    let mut rx = device.subscribe();

    device.start_polling();
    sim.schedule(&[(0x26, 0), (0x00, 4), (0x27, 0)]);

    assert_eq!(next_bill_accepted(&mut rx).await, Some((4, 500)));
    device.stop_polling().await;
}

#[tokio::test]
async fn test_dispensed_bill_is_not_reported_as_accepted() {
    let sim = SimulatedMd100::new();
    let (_bus, _master, device) = md100_rig(&sim).await;
    let mut rx = device.subscribe();

    device.start_polling();
    sim.schedule(&[(0x30, 0), (0x26, 0), (0x12, 18), (0x2B, 0)]);
    assert_eq!(next_bill_accepted(&mut rx).await, None);
    device.stop_polling().await;
}

#[tokio::test]
async fn test_poll_of_silent_device() {
    let bus = FakeBus::new(true, |_| Reply::Silent);
    let master = connected_master(&bus).await;
    let slave = master.add_slave(DEVICE).with_timeout(Duration::from_millis(50));
    let device = cctalk_core::Md100::new(slave, Default::default());

    let err = device.poll_once().await.unwrap_err();
    assert!(err.is_no_response());
    assert!(matches!(err, DeviceError::Transport(TransportError::NoResponse)));
}

#[tokio::test]
async fn test_terminating_master_stops_polling() {
    let sim = SimulatedMd100::new();
    let (_bus, master, device) = md100_rig(&sim).await;

    device.start_polling();
    assert!(eventually(|| device.is_ready()).await);
    master.terminate().await;
    assert!(eventually(|| !device.is_polling()).await);
}
