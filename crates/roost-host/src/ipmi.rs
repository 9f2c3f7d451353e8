//! Out-of-band power control for fencing.
//!
//! Fencing calls `chassis power status|off|on|reset` against the target
//! node's stored management credentials, each call bounded by a timeout so
//! an unreachable BMC cannot stall the fence scan.

use std::time::Duration;

use crate::cmd::Commander;
use crate::error::Result;

/// Chassis power state as the management controller reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

/// Management credentials for one node, as mirrored in the store.
#[derive(Debug, Clone)]
pub struct IpmiTarget {
    pub host: String,
    pub user: String,
    pub password: String,
}

/// IPMI chassis-power client.
#[derive(Clone)]
pub struct IpmiClient {
    commander: Commander,
    timeout: Duration,
}

impl IpmiClient {
    pub fn new(commander: Commander, timeout: Duration) -> Self {
        Self { commander, timeout }
    }

    /// Whether the management endpoint answers at all.
    pub async fn verify(&self, target: &IpmiTarget) -> bool {
        matches!(
            self.power_status(target).await,
            Ok(PowerState::On | PowerState::Off)
        )
    }

    pub async fn power_status(&self, target: &IpmiTarget) -> Result<PowerState> {
        let out = self.chassis(target, "status").await?;
        if !out.success() {
            return Ok(PowerState::Unknown);
        }
        // "Chassis Power is on" / "Chassis Power is off"
        let text = out.stdout.to_ascii_lowercase();
        if text.contains("is on") {
            Ok(PowerState::On)
        } else if text.contains("is off") {
            Ok(PowerState::Off)
        } else {
            Ok(PowerState::Unknown)
        }
    }

    pub async fn power_off(&self, target: &IpmiTarget) -> Result<bool> {
        Ok(self.chassis(target, "off").await?.success())
    }

    pub async fn power_on(&self, target: &IpmiTarget) -> Result<bool> {
        Ok(self.chassis(target, "on").await?.success())
    }

    pub async fn power_reset(&self, target: &IpmiTarget) -> Result<bool> {
        Ok(self.chassis(target, "reset").await?.success())
    }

    async fn chassis(
        &self,
        target: &IpmiTarget,
        action: &str,
    ) -> Result<crate::cmd::CommandOutput> {
        self.commander
            .run(
                &[
                    "ipmitool",
                    "-I",
                    "lanplus",
                    "-H",
                    &target.host,
                    "-U",
                    &target.user,
                    "-P",
                    &target.password,
                    "chassis",
                    "power",
                    action,
                ],
                self.timeout,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CommandOutput;

    fn target() -> IpmiTarget {
        IpmiTarget {
            host: "h3-lom.mgmt".to_string(),
            user: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_power_status_parsing() {
        let (commander, mock) = Commander::mock();
        let client = IpmiClient::new(commander, Duration::from_secs(1));

        mock.respond(
            "ipmitool -I lanplus -H h3-lom.mgmt",
            CommandOutput::ok("Chassis Power is on\n"),
        );
        assert_eq!(client.power_status(&target()).await.unwrap(), PowerState::On);
        assert!(client.verify(&target()).await);
    }

    #[tokio::test]
    async fn test_unreachable_bmc_is_unknown() {
        let (commander, mock) = Commander::mock();
        mock.respond("ipmitool", CommandOutput::failed(1, "Unable to establish"));
        let client = IpmiClient::new(commander, Duration::from_secs(1));

        assert_eq!(
            client.power_status(&target()).await.unwrap(),
            PowerState::Unknown
        );
        assert!(!client.verify(&target()).await);
    }

    #[tokio::test]
    async fn test_power_off_command_shape() {
        let (commander, mock) = Commander::mock();
        let client = IpmiClient::new(commander, Duration::from_secs(1));

        assert!(client.power_off(&target()).await.unwrap());
        assert!(mock.saw(
            "ipmitool -I lanplus -H h3-lom.mgmt -U admin -P secret chassis power off"
        ));
    }
}
