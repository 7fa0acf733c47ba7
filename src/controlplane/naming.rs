//! Deterministic naming of array objects
//!
//! Host, group and view names are derived from the requester's host name
//! and the array-assigned host id. Nothing maps names to ids locally; the
//! array's name uniqueness decides whether a logical object exists.

use crate::config::NamingConfig;
use sha2::{Digest, Sha256};

/// Array-safe host name.
///
/// Names within `max_len` made of `[A-Za-z0-9._-]` are kept as-is, anything
/// else is replaced by its SHA-256 hex digest truncated to `max_len`.
pub fn encode_host_name(name: &str, max_len: usize) -> String {
    let safe = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if safe && !name.is_empty() && name.len() <= max_len {
        return name.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    let mut hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex.truncate(max_len);
    hex
}

/// Array operating-system code for a host OS name; unknown names map to linux
pub fn os_type_code(os: &str) -> &'static str {
    match os.trim().to_lowercase().as_str() {
        "windows" => "1",
        "solaris" => "2",
        "hp-ux" => "3",
        "aix" => "4",
        "xenserver" => "5",
        "mac" | "mac os" => "6",
        "vmware esx" | "vmware" | "esx" => "7",
        _ => "0",
    }
}

/// Names of the per-host grouping objects
#[derive(Debug, Clone)]
pub struct ResourceNaming {
    config: NamingConfig,
}

impl ResourceNaming {
    pub fn new(config: NamingConfig) -> Self {
        Self { config }
    }

    pub fn host_name(&self, requested: &str) -> String {
        encode_host_name(requested, self.config.max_name_length)
    }

    pub fn host_group(&self, host_id: &str) -> String {
        format!("{}{}", self.config.host_group_prefix, host_id)
    }

    pub fn lun_group(&self, host_id: &str) -> String {
        format!("{}{}", self.config.lun_group_prefix, host_id)
    }

    pub fn mapping_view(&self, host_id: &str) -> String {
        format!("{}{}", self.config.mapping_view_prefix, host_id)
    }
}

impl Default for ResourceNaming {
    fn default() -> Self {
        Self::new(NamingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_safe_names_kept() {
        assert_eq!(encode_host_name("node-01.dc1", 31), "node-01.dc1");
    }

    #[test]
    fn test_long_or_unsafe_names_hashed() {
        let long = "compute-node-with-a-very-long-hostname-01";
        let encoded = encode_host_name(long, 31);
        assert_eq!(encoded.len(), 31);
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(encoded, encode_host_name(long, 31));

        let unsafe_name = encode_host_name("node 01", 31);
        assert_ne!(unsafe_name, "node 01");
        assert_eq!(unsafe_name.len(), 31);
    }

    #[test]
    fn test_group_names() {
        let naming = ResourceNaming::default();
        assert_eq!(naming.host_group("12"), "HostGroup_12");
        assert_eq!(naming.lun_group("12"), "LunGroup_12");
        assert_eq!(naming.mapping_view("12"), "MappingView_12");
    }

    #[test]
    fn test_os_type_codes() {
        assert_eq!(os_type_code("Linux"), "0");
        assert_eq!(os_type_code("windows"), "1");
        assert_eq!(os_type_code("VMware ESX"), "7");
        assert_eq!(os_type_code("plan9"), "0");
    }
}
