// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! dnsmasq-backed [`DhcpService`] implementation.
//!
//! One dnsmasq process per bridge, self-daemonizing, identified by a pid
//! file under the supervisor's run directory. Attach verifies that the
//! recorded pid is alive *and* still runs our configuration file, so a
//! recycled pid cannot be mistaken for a live instance after a crash.

use crate::{DhcpError, DhcpService};
use cnci_id::{Id, Tenant};
use ipnet::Ipv4Net;
use net::InterfaceName;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const DEFAULT_RUN_DIR: &str = "/var/run/cnci/dnsmasq";
const DEFAULT_BINARY: &str = "dnsmasq";
const LEASE_TIME: &str = "12h";
const ATTACH_RETRIES: usize = 10;
const ATTACH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// dnsmasq supervisor.
#[derive(Clone, Debug)]
pub struct Dnsmasq {
    run_dir: PathBuf,
    binary: PathBuf,
}

impl Default for Dnsmasq {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            binary: PathBuf::from(DEFAULT_BINARY),
        }
    }
}

/// One supervised instance, identified by its state files.
#[derive(Clone, Debug)]
pub struct DnsmasqHandle {
    bridge: InterfaceName,
    subnet: Ipv4Net,
    conf_path: PathBuf,
    pid_path: PathBuf,
    lease_path: PathBuf,
}

impl DnsmasqHandle {
    #[must_use]
    pub fn bridge(&self) -> &InterfaceName {
        &self.bridge
    }

    #[must_use]
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }
}

impl Dnsmasq {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep state files under `run_dir` instead of the default.
    #[must_use]
    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = run_dir.into();
        self
    }

    /// Launch `binary` instead of the `dnsmasq` found on PATH.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn handle_for(&self, bridge: &InterfaceName, bridge_id: &str, subnet: Ipv4Net) -> DnsmasqHandle {
        DnsmasqHandle {
            bridge: bridge.clone(),
            subnet,
            conf_path: self.run_dir.join(format!("{bridge_id}.conf")),
            pid_path: self.run_dir.join(format!("{bridge_id}.pid")),
            lease_path: self.run_dir.join(format!("{bridge_id}.leases")),
        }
    }

    async fn recorded_pid(handle: &DnsmasqHandle) -> Option<i32> {
        let raw = tokio::fs::read_to_string(&handle.pid_path).await.ok()?;
        raw.trim().parse().ok()
    }

    /// Attach to a running instance, verifying liveness and identity.
    async fn attach(handle: &DnsmasqHandle) -> Result<(), DhcpError> {
        let not_running = || DhcpError::NotRunning {
            bridge: handle.bridge.clone(),
        };
        let pid = Self::recorded_pid(handle).await.ok_or_else(not_running)?;
        kill(Pid::from_raw(pid), None).map_err(|_| not_running())?;
        let cmdline = tokio::fs::read(format!("/proc/{pid}/cmdline"))
            .await
            .map_err(|_| not_running())?;
        let conf = handle.conf_path.as_os_str().as_encoded_bytes();
        if !cmdline
            .windows(conf.len())
            .any(|window| window == conf)
        {
            // pid recycled by an unrelated process
            return Err(not_running());
        }
        Ok(())
    }

    async fn restart(
        &self,
        handle: &DnsmasqHandle,
        tenant: Id<Tenant>,
    ) -> Result<(), DhcpError> {
        if let Err(err) = self.stop_instance(handle).await {
            debug!("pre-start cleanup for {}: {err}", handle.bridge);
        }
        let state_err = |source| DhcpError::State {
            path: self.run_dir.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.run_dir)
            .await
            .map_err(state_err)?;
        let config = render_config(handle, tenant)?;
        tokio::fs::write(&handle.conf_path, config)
            .await
            .map_err(state_err)?;

        let status = Command::new(&self.binary)
            .arg(format!("--conf-file={}", handle.conf_path.display()))
            .status()
            .await
            .map_err(|source| DhcpError::Launch {
                bridge: handle.bridge.clone(),
                source,
            })?;
        if !status.success() {
            return Err(DhcpError::Exited {
                bridge: handle.bridge.clone(),
                status,
            });
        }

        // dnsmasq daemonizes; the pid file appears shortly after the parent
        // exits
        for _ in 0..ATTACH_RETRIES {
            if Self::attach(handle).await.is_ok() {
                info!("dnsmasq serving {} on {}", handle.subnet, handle.bridge);
                return Ok(());
            }
            tokio::time::sleep(ATTACH_RETRY_DELAY).await;
        }
        Err(DhcpError::NotRunning {
            bridge: handle.bridge.clone(),
        })
    }

    async fn stop_instance(&self, handle: &DnsmasqHandle) -> Result<(), DhcpError> {
        match Self::recorded_pid(handle).await {
            Some(pid) => match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(source) => return Err(DhcpError::Signal { pid, source }),
            },
            None => debug!("no dnsmasq pid recorded for {}", handle.bridge),
        }
        for path in [&handle.pid_path, &handle.conf_path, &handle.lease_path] {
            if let Err(err) = tokio::fs::remove_file(path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {err}", path.display());
                }
            }
        }
        Ok(())
    }
}

impl DhcpService for Dnsmasq {
    type Handle = DnsmasqHandle;

    async fn start_or_attach(
        &self,
        bridge: &InterfaceName,
        bridge_id: &str,
        tenant: Id<Tenant>,
        subnet: Ipv4Net,
    ) -> Result<DnsmasqHandle, DhcpError> {
        let handle = self.handle_for(bridge, bridge_id, subnet);
        match Self::attach(&handle).await {
            Ok(()) => {
                info!("attached to running dnsmasq for {bridge}");
                Ok(handle)
            }
            Err(_) => {
                self.restart(&handle, tenant).await?;
                Ok(handle)
            }
        }
    }

    async fn stop(&self, handle: &DnsmasqHandle) -> Result<(), DhcpError> {
        self.stop_instance(handle).await
    }
}

/// The first and last leasable addresses in `subnet`.
///
/// The network address and the first host (reserved for the gateway) are
/// skipped, as is the broadcast address.
fn dhcp_range(subnet: Ipv4Net) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());
    let start = network.checked_add(2)?;
    let end = broadcast.checked_sub(1)?;
    if start > end || end <= network {
        return None;
    }
    Some((Ipv4Addr::from(start), Ipv4Addr::from(end)))
}

fn render_config(handle: &DnsmasqHandle, tenant: Id<Tenant>) -> Result<String, DhcpError> {
    let (start, end) = dhcp_range(handle.subnet).ok_or(DhcpError::SubnetTooSmall {
        subnet: handle.subnet,
    })?;
    Ok(format!(
        "# tenant {tenant}\n\
         interface={bridge}\n\
         bind-interfaces\n\
         except-interface=lo\n\
         dhcp-range={start},{end},{netmask},{lease}\n\
         pid-file={pid}\n\
         dhcp-leasefile={leases}\n",
        bridge = handle.bridge,
        netmask = handle.subnet.netmask(),
        lease = LEASE_TIME,
        pid = handle.pid_path.display(),
        leases = handle.lease_path.display(),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::Path;
    use std::str::FromStr;

    fn handle(subnet: &str) -> DnsmasqHandle {
        let supervisor = Dnsmasq::new().with_run_dir("/tmp/cnci-test");
        supervisor.handle_for(
            &InterfaceName::try_from("cnbr1").unwrap(),
            "br_192.168.8.0+21",
            subnet.parse().unwrap(),
        )
    }

    #[test]
    fn state_paths_derive_from_bridge_id() {
        let handle = handle("192.168.8.0/21");
        assert_eq!(
            handle.conf_path,
            Path::new("/tmp/cnci-test/br_192.168.8.0+21.conf")
        );
        assert_eq!(
            handle.pid_path,
            Path::new("/tmp/cnci-test/br_192.168.8.0+21.pid")
        );
        assert_eq!(
            handle.lease_path,
            Path::new("/tmp/cnci-test/br_192.168.8.0+21.leases")
        );
    }

    #[test]
    fn range_skips_gateway_and_broadcast() {
        let (start, end) = dhcp_range("192.168.8.0/21".parse().unwrap()).unwrap();
        assert_eq!(start, Ipv4Addr::new(192, 168, 8, 2));
        assert_eq!(end, Ipv4Addr::new(192, 168, 15, 254));

        let (start, end) = dhcp_range("10.0.0.0/30".parse().unwrap()).unwrap();
        assert_eq!(start, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(end, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn tiny_subnets_refused() {
        assert!(dhcp_range("10.0.0.0/31".parse().unwrap()).is_none());
        assert!(dhcp_range("10.0.0.1/32".parse().unwrap()).is_none());
    }

    #[test]
    fn config_names_every_state_file() {
        let handle = handle("10.1.0.0/24");
        let tenant = Id::<Tenant>::from_str("9b7f6a02-3e24-4ad5-90ba-77e0c55f4d02").unwrap();
        let config = render_config(&handle, tenant).unwrap();
        assert!(config.contains("# tenant 9b7f6a02-3e24-4ad5-90ba-77e0c55f4d02"));
        assert!(config.contains("interface=cnbr1"));
        assert!(config.contains("dhcp-range=10.1.0.2,10.1.0.254,255.255.255.0,12h"));
        assert!(config.contains("pid-file=/tmp/cnci-test/br_192.168.8.0+21.pid"));
        assert!(config.contains("dhcp-leasefile=/tmp/cnci-test/br_192.168.8.0+21.leases"));
    }

    #[tokio::test]
    async fn attach_refuses_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Dnsmasq::new().with_run_dir(dir.path());
        let handle = supervisor.handle_for(
            &InterfaceName::try_from("cnbr1").unwrap(),
            "br_10.1.0.0+24",
            "10.1.0.0/24".parse().unwrap(),
        );
        // no pid file at all
        assert!(matches!(
            Dnsmasq::attach(&handle).await,
            Err(DhcpError::NotRunning { .. })
        ));
        // a pid that cannot exist
        tokio::fs::write(&handle.pid_path, "999999999\n").await.unwrap();
        assert!(matches!(
            Dnsmasq::attach(&handle).await,
            Err(DhcpError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn stop_without_instance_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Dnsmasq::new().with_run_dir(dir.path());
        let handle = supervisor.handle_for(
            &InterfaceName::try_from("cnbr1").unwrap(),
            "br_10.1.0.0+24",
            "10.1.0.0/24".parse().unwrap(),
        );
        supervisor.stop_instance(&handle).await.unwrap();
    }
}
