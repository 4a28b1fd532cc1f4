//! Port lifecycle tests: open, close, clients and operation serialization.

use std::time::Duration;

use qmi_datapath::{
    ClientFlag, DataFormatAction, Error, ExpectedDataFormat, KernelDataMode, OpenFlags, Protocol,
    Result, Service,
};
use tokio_util::sync::CancellationToken;

use crate::common::{DeviceState, FakeNetDevice, MockDevice, open_port, port};

fn reopen_flags(encapsulation: OpenFlags) -> OpenFlags {
    OpenFlags::VERSION_INFO | OpenFlags::PROXY | OpenFlags::NET_NO_QOS_HEADER | encapsulation
}

#[tokio::test]
async fn test_open_plain() -> Result<()> {
    let (port, _netlink) = port(MockDevice::qmi_wwan_rmnet());
    assert!(!port.is_open());

    port.open(false, &CancellationToken::new()).await?;

    assert!(port.is_open());
    assert_eq!(
        port.device().state().open_calls,
        vec![OpenFlags::VERSION_INFO | OpenFlags::PROXY]
    );

    // Opening again is a no-op.
    port.open(false, &CancellationToken::new()).await?;
    assert_eq!(port.device().state().open_calls.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_open_checks_data_format() -> Result<()> {
    let (port, _netlink) = port(MockDevice::qmi_wwan_rmnet());
    let port = port.with_net_device(FakeNetDevice::qmi_wwan());

    port.open(true, &CancellationToken::new()).await?;

    assert!(port.is_open());
    assert_eq!(port.device().state().open_calls.len(), 1);
    assert_eq!(port.kernel_data_mode(), KernelDataMode::RAW_IP);
    assert_eq!(port.link_layer_protocol(), Protocol::RawIp);
    assert!(port.supported_kernel_data_modes().is_some());
    Ok(())
}

#[tokio::test]
async fn test_open_falls_back_to_ctl_format() -> Result<()> {
    let device = MockDevice::new(DeviceState {
        query_fails: true,
        ..Default::default()
    });
    let (port, _netlink) = port(device);
    let port = port.with_net_device(FakeNetDevice::qmi_wwan());

    port.open(true, &CancellationToken::new()).await?;

    let device = port.device().snapshot();
    assert_eq!(device.close_calls, 1);
    assert_eq!(
        device.open_calls,
        vec![
            OpenFlags::VERSION_INFO | OpenFlags::PROXY,
            reopen_flags(OpenFlags::NET_RAW_IP),
        ]
    );
    assert!(port.is_open());
    assert_eq!(port.link_layer_protocol(), Protocol::RawIp);
    Ok(())
}

#[tokio::test]
async fn test_open_retries_other_encapsulation() -> Result<()> {
    let device = MockDevice::new(DeviceState {
        query_fails: true,
        rejected_open_flags: OpenFlags::NET_RAW_IP,
        ..Default::default()
    });
    let (port, _netlink) = port(device);
    let port = port.with_net_device(FakeNetDevice::qmi_wwan());

    port.open(true, &CancellationToken::new()).await?;

    let device = port.device().snapshot();
    assert_eq!(
        device.open_calls,
        vec![
            OpenFlags::VERSION_INFO | OpenFlags::PROXY,
            reopen_flags(OpenFlags::NET_RAW_IP),
            reopen_flags(OpenFlags::NET_802_3),
        ]
    );
    assert_eq!(port.link_layer_protocol(), Protocol::Framed8023);
    Ok(())
}

#[tokio::test]
async fn test_open_unknown_kernel_format() -> Result<()> {
    let device = MockDevice::new(DeviceState {
        expected: ExpectedDataFormat::Unknown,
        ..Default::default()
    });
    let (port, _netlink) = port(device);
    let port = port.with_net_device(FakeNetDevice::qmi_wwan());

    port.open(true, &CancellationToken::new()).await?;

    let device = port.device().snapshot();
    assert!(device.get_calls.is_empty());
    assert_eq!(device.open_calls[1], reopen_flags(OpenFlags::NET_802_3));
    assert_eq!(port.link_layer_protocol(), Protocol::Framed8023);
    Ok(())
}

#[tokio::test]
async fn test_open_failure_closes_device() -> Result<()> {
    let device = MockDevice::new(DeviceState {
        rejected_open_flags: OpenFlags::PROXY,
        ..Default::default()
    });
    let (port, _netlink) = port(device);

    let err = port
        .open(false, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_protocol_rejected());
    assert!(!port.is_open());
    assert_eq!(port.device().state().close_calls, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_operations_are_busy() -> Result<()> {
    let device = MockDevice::new(DeviceState {
        open_delay: Some(Duration::from_secs(1)),
        ..Default::default()
    });
    let (port, _netlink) = port(device);
    let data = FakeNetDevice::qmi_wwan();
    let cancel = CancellationToken::new();

    let (opened, close, setup) = tokio::join!(
        port.open(false, &cancel),
        async {
            tokio::task::yield_now().await;
            port.close().await
        },
        async {
            tokio::task::yield_now().await;
            port.setup_data_format(&data, DataFormatAction::Query, &cancel)
                .await
        },
    );

    opened?;
    assert!(close.unwrap_err().is_busy());
    assert!(setup.unwrap_err().is_busy());

    // Guard released once open finished.
    port.close().await?;
    assert!(!port.is_open());
    Ok(())
}

#[tokio::test]
async fn test_operations_need_open_port() -> Result<()> {
    let (port, _netlink) = port(MockDevice::qmi_wwan_rmnet());
    let data = FakeNetDevice::qmi_wwan();
    let cancel = CancellationToken::new();

    let err = port
        .setup_data_format(&data, DataFormatAction::SetMultiplex, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongState(_)));

    let err = port
        .allocate_client(Service::Wds, ClientFlag::Default, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongState(_)));

    // Closing a closed port does nothing.
    port.close().await?;
    assert_eq!(port.device().state().close_calls, 0);
    Ok(())
}

#[tokio::test]
async fn test_client_table() -> Result<()> {
    let (port, _netlink) = open_port(MockDevice::qmi_wwan_rmnet()).await;
    let cancel = CancellationToken::new();

    let v4 = port
        .allocate_client(Service::Wds, ClientFlag::WdsIpv4, &cancel)
        .await?;
    let v6 = port
        .allocate_client(Service::Wds, ClientFlag::WdsIpv6, &cancel)
        .await?;
    assert_ne!(v4.cid, v6.cid);
    assert_eq!(port.peek_client(Service::Wds, ClientFlag::WdsIpv4), Some(v4));

    let err = port
        .allocate_client(Service::Wds, ClientFlag::WdsIpv4, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    assert!(err.is_resource_conflict());

    port.release_client(Service::Wds, ClientFlag::WdsIpv4).await;
    assert_eq!(port.peek_client(Service::Wds, ClientFlag::WdsIpv4), None);
    assert_eq!(port.device().state().released, vec![v4]);

    // Releasing an empty slot does nothing.
    port.release_client(Service::Wds, ClientFlag::WdsIpv4).await;
    assert_eq!(port.device().state().released.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_client_allocated_during_close_is_released() -> Result<()> {
    let (port, _netlink) = open_port(MockDevice::qmi_wwan_rmnet()).await;
    {
        let mut state = port.device().state();
        state.allocate_delay = Some(Duration::from_millis(100));
        state.release_fails = true;
    }
    let cancel = CancellationToken::new();

    let (allocated, closed) = tokio::join!(
        port.allocate_client(Service::Wds, ClientFlag::Default, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            port.close().await
        },
    );

    closed?;
    // The release failure is only logged; the caller sees the closed port.
    assert!(matches!(allocated.unwrap_err(), Error::WrongState(_)));
    let device = port.device().snapshot();
    assert_eq!(device.released.len(), 1);
    assert_eq!(device.released[0].service, Service::Wds);
    assert_eq!(port.peek_client(Service::Wds, ClientFlag::Default), None);
    Ok(())
}

#[tokio::test]
async fn test_close_releases_everything() -> Result<()> {
    let (port, _netlink) = open_port(MockDevice::qmi_wwan_pooled()).await;
    let data = FakeNetDevice::qmi_wwan();
    let cancel = CancellationToken::new();

    let wds = port
        .allocate_client(Service::Wds, ClientFlag::Default, &cancel)
        .await?;
    port.setup_data_format(&data, DataFormatAction::SetMultiplex, &cancel)
        .await?;
    port.setup_link(&data, "qmimux", &cancel).await?;
    assert_eq!(port.allocated_links(), 1);

    port.close().await?;

    let device = port.device().snapshot();
    assert!(!port.is_open());
    assert!(device.released.contains(&wds));
    assert!(device.allocated.is_empty());
    assert!(device.links.is_empty());
    assert_eq!(device.deleted_links.len(), 4);
    assert_eq!(device.close_calls, 1);
    assert_eq!(port.allocated_links(), 0);
    assert_eq!(port.kernel_data_mode(), KernelDataMode::empty());
    Ok(())
}

#[tokio::test]
async fn test_reset_restores_default() -> Result<()> {
    let (port, netlink) = open_port(MockDevice::qmi_wwan_rmnet()).await;
    let data = FakeNetDevice::qmi_wwan();
    let cancel = CancellationToken::new();

    port.setup_data_format(&data, DataFormatAction::SetMultiplex, &cancel)
        .await?;
    let link = port.setup_link(&data, "qmapmux0.", &cancel).await?;
    let requests = netlink.requests().len();

    port.reset(&data, &cancel).await?;

    assert_eq!(port.kernel_data_mode(), KernelDataMode::RAW_IP);
    assert_eq!(port.allocated_links(), 0);
    assert!(port.device().state().deleted_links.contains(&link));
    assert_eq!(netlink.requests().len(), requests + 1);
    Ok(())
}
