//! Link requests against a real rtnetlink socket.

use std::time::Duration;

use qmi_datapath::netlink::{LinkControl, NetlinkTransport};
use qmi_datapath::{KernelDevice, Result, SysfsNetDevice};

const TIMEOUT: Duration = Duration::from_secs(5);

fn loopback_index() -> Result<u32> {
    SysfsNetDevice::new("lo")?.ifindex()
}

#[tokio::test]
async fn test_set_loopback_up() -> Result<()> {
    require_root!();

    let transport = NetlinkTransport::new();
    assert!(transport.is_available());

    transport
        .set_link(loopback_index()?, true, None, TIMEOUT)
        .await?;
    assert_eq!(transport.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unknown_interface() -> Result<()> {
    require_root!();

    let transport = NetlinkTransport::new();
    let err = transport
        .set_link(0x7fff_fff0, true, None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
    assert_eq!(transport.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests() -> Result<()> {
    require_root!();

    let transport = NetlinkTransport::shared();
    let index = loopback_index()?;
    let (a, b, c) = tokio::join!(
        transport.set_link(index, true, None, TIMEOUT),
        transport.set_link(index, true, None, TIMEOUT),
        transport.set_link(index, true, None, TIMEOUT),
    );
    a?;
    b?;
    c?;
    assert_eq!(transport.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unprivileged_request_fails() -> Result<()> {
    if crate::common::is_root() {
        return Ok(());
    }

    let transport = NetlinkTransport::new();
    let err = transport
        .set_link(loopback_index()?, true, None, TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), Some(libc::EPERM));
    Ok(())
}
