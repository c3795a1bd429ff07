//! Host machine identity
//!
//! Used for the default client identifier and for naming discovery entities.

use std::env;

/// Names identifying the host this bridge runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    /// Short machine name, e.g. `DESKTOP-01`
    pub machine_name: String,
    /// Domain or workgroup name, equal to the machine name when there is none
    pub domain_name: String,
    /// `"{domain} {machine}"`, or just the machine name when no domain is set
    pub full_name: String,
}

impl MachineIdentity {
    pub fn new(machine_name: impl Into<String>, domain_name: impl Into<String>) -> Self {
        let machine_name = machine_name.into();
        let domain_name = domain_name.into();
        let full_name = if domain_name.is_empty() || domain_name == machine_name {
            machine_name.clone()
        } else {
            format!("{domain_name} {machine_name}")
        };
        let domain_name = if domain_name.is_empty() {
            machine_name.clone()
        } else {
            domain_name
        };

        Self {
            machine_name,
            domain_name,
            full_name,
        }
    }

    /// Detect the identity of the current host.
    ///
    /// `COMPUTERNAME` wins when set, otherwise the OS hostname is used.
    pub fn detect() -> Self {
        let machine = env::var("COMPUTERNAME")
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().trim().to_string());
        let machine = if machine.is_empty() {
            "localhost".to_string()
        } else {
            machine
        };

        let domain = env::var("USERDOMAIN").unwrap_or_default();
        Self::new(machine, domain.trim())
    }

    /// Machine name used in entity names, domain-qualified when requested
    pub fn display_name(&self, domain_prefix: bool) -> &str {
        if domain_prefix {
            &self.full_name
        } else {
            &self.machine_name
        }
    }
}
