//! Conversion between human readable addresses and their integer
//! encoding.
//!
//! IPv4 addresses occupy the low 32 bits; anything above `u32::MAX` is
//! an IPv6 address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::IpError;

/// Parses `ip` into its integer encoding.
pub fn ip_to_int(ip: &str) -> Result<u128, IpError> {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok(u128::from(u32::from(v4))),
        Ok(IpAddr::V6(v6)) => Ok(u128::from(v6)),
        Err(_) => Err(IpError::Invalid(ip.to_string())),
    }
}

/// Formats an integer produced by [`ip_to_int`] back into a string.
pub fn format_ip(ip: u128) -> String {
    match u32::try_from(ip) {
        Ok(v4) => Ipv4Addr::from(v4).to_string(),
        Err(_) => Ipv6Addr::from(ip).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4() {
        let n = ip_to_int("10.0.0.1").unwrap();
        assert_eq!(n, 0x0a00_0001);
        assert_eq!(format_ip(n), "10.0.0.1");
    }

    #[test]
    fn test_ipv6() {
        let n = ip_to_int("fd00::5").unwrap();
        assert!(n > u128::from(u32::MAX));
        assert_eq!(format_ip(n), "fd00::5");
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(ip_to_int("10.0.0"), Err(IpError::Invalid(s)) if s == "10.0.0"));
        assert!(ip_to_int("").is_err());
    }
}
