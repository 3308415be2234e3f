use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;

const SYSFS_NET: &str = "/sys/class/net";

/// Hardware address of the device's primary network interface, read once at
/// startup. Used as the opaque key in all cloud calls; immutable for the
/// process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn detect(interface: Option<&str>) -> Result<DeviceIdentity> {
        Self::detect_in(Path::new(SYSFS_NET), interface)
    }

    fn detect_in(sysfs_net: &Path, interface: Option<&str>) -> Result<DeviceIdentity> {
        if let Some(name) = interface {
            let address = read_address(&sysfs_net.join(name))
                .with_context(|| format!("Reading hardware address of interface {}", name))?;
            return match address {
                Some(address) => Ok(DeviceIdentity(address)),
                None => bail!("Interface {} has no usable hardware address", name),
            };
        }

        let mut names: Vec<String> = fs::read_dir(sysfs_net)
            .with_context(|| format!("Listing network interfaces in {}", sysfs_net.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "lo")
            .collect();
        names.sort();

        for name in &names {
            if let Ok(Some(address)) = read_address(&sysfs_net.join(name)) {
                return Ok(DeviceIdentity(address));
            }
        }
        bail!("No network interface with a usable hardware address found")
    }

    /// Identity from an explicit address, bypassing detection.
    pub fn from_address(address: impl Into<String>) -> DeviceIdentity {
        DeviceIdentity(address.into().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn read_address(interface_dir: &Path) -> Result<Option<String>> {
    let raw = fs::read_to_string(interface_dir.join("address"))?;
    let address = raw.trim().to_lowercase();
    if address.is_empty() || address == "00:00:00:00:00:00" {
        return Ok(None);
    }
    Ok(Some(address))
}
