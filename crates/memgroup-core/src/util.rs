//! Utility functions shared across memgroup crates

use crate::error::{GroupError, Result};

const MIB: u64 = 1024 * 1024;

/// Check if running as root
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Get current UID
pub fn get_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Parse memory size string (e.g., "100M", "1G")
///
/// A bare number is a byte count.
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, MIB)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| GroupError::InvalidConfig(format!("Invalid memory size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| GroupError::InvalidConfig(format!("Memory size overflow: {}", s)))
}

/// Parse the controller's memory cap argument.
///
/// A bare number is taken as MiB; anything with a unit suffix goes through
/// [`parse_memory_size`].
pub fn parse_memory_cap(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    let cap = if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let mb: u64 = trimmed
            .parse()
            .map_err(|_| GroupError::InvalidConfig(format!("Invalid memory cap: {}", s)))?;
        mb.checked_mul(MIB)
            .ok_or_else(|| GroupError::InvalidConfig(format!("Memory cap overflow: {}", s)))?
    } else {
        parse_memory_size(trimmed)?
    };

    if cap == 0 {
        return Err(GroupError::InvalidConfig(
            "Memory cap must be greater than 0".to_string(),
        ));
    }
    Ok(cap)
}

/// Check that a group name can be used as a single directory component
pub fn validate_group_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GroupError::InvalidConfig(
            "Group name cannot be empty".to_string(),
        ));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(GroupError::InvalidConfig(format!(
            "Invalid group name: {:?}",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_size_units() {
        assert_eq!(parse_memory_size("100").unwrap(), 100);
        assert_eq!(parse_memory_size("100B").unwrap(), 100);
        assert_eq!(parse_memory_size("10K").unwrap(), 10 * 1024);
        assert_eq!(parse_memory_size("100M").unwrap(), 100 * MIB);
        assert_eq!(parse_memory_size("2G").unwrap(), 2 * 1024 * MIB);
    }

    #[test]
    fn test_parse_memory_size_case_and_whitespace() {
        assert_eq!(parse_memory_size("  1m ").unwrap(), MIB);
        assert_eq!(parse_memory_size("1g").unwrap(), 1024 * MIB);
    }

    #[test]
    fn test_parse_memory_size_invalid() {
        assert!(parse_memory_size("not_a_number").is_err());
        assert!(parse_memory_size("10X").is_err());
        assert!(parse_memory_size("99999999999999999999G").is_err());
    }

    #[test]
    fn test_parse_memory_cap_bare_number_is_mib() {
        assert_eq!(parse_memory_cap("50").unwrap(), 50 * MIB);
        assert_eq!(parse_memory_cap(" 1 ").unwrap(), MIB);
    }

    #[test]
    fn test_parse_memory_cap_with_suffix() {
        assert_eq!(parse_memory_cap("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_memory_cap("1G").unwrap(), 1024 * MIB);
    }

    #[test]
    fn test_parse_memory_cap_rejects_zero_and_garbage() {
        assert!(parse_memory_cap("0").is_err());
        assert!(parse_memory_cap("0M").is_err());
        assert!(parse_memory_cap("").is_err());
        assert!(parse_memory_cap("-5").is_err());
        assert!(parse_memory_cap("fifty").is_err());
    }

    #[test]
    fn test_validate_group_name() {
        assert!(validate_group_name("managed-group").is_ok());
        assert!(validate_group_name("managed group").is_ok());
        assert!(validate_group_name("").is_err());
        assert!(validate_group_name(".").is_err());
        assert!(validate_group_name("..").is_err());
        assert!(validate_group_name("a/b").is_err());
    }

    #[test]
    fn test_is_root_matches_uid() {
        assert_eq!(is_root(), get_uid() == 0);
    }
}
