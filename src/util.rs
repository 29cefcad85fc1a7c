use crate::error::HostkitError;

const SUFFIXES: [(&str, u32); 5] = [("", 0), ("K", 1), ("M", 2), ("G", 3), ("T", 4)];

/// Parse a QEMU-style size (`"50G"`, `"512M"`, `"16g"`, `"1073741824"`) into bytes.
///
/// Binary units; an optional trailing `B` is accepted (`"4GB"`).
pub fn parse_size(s: &str) -> Result<u64, HostkitError> {
    let s = s.trim();
    let invalid = |why: &str| HostkitError::Validation {
        message: format!("invalid size '{s}': {why}"),
    };

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    if digits.is_empty() {
        return Err(invalid("expected a number"));
    }

    let suffix = suffix.to_ascii_uppercase();
    let unit = suffix.strip_suffix('B').filter(|u| !u.is_empty()).unwrap_or(&suffix);
    let power = SUFFIXES
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, p)| *p)
        .ok_or_else(|| invalid("unknown suffix (use K, M, G or T)"))?;

    let num: u64 = digits.parse().map_err(|_| invalid("number too large"))?;
    if num == 0 {
        return Err(invalid("must be greater than zero"));
    }
    num.checked_mul(1024u64.pow(power))
        .ok_or_else(|| invalid("overflows"))
}

/// Machine architecture of the running host, in QEMU's naming.
pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_qemu_style_suffixes() {
        assert_eq!(parse_size("50G").unwrap(), 50 << 30);
        assert_eq!(parse_size("16g").unwrap(), 16 << 30);
        assert_eq!(parse_size("512M").unwrap(), 512 << 20);
        assert_eq!(parse_size("4GB").unwrap(), 4 << 30);
        assert_eq!(parse_size("2T").unwrap(), 2 << 40);
        assert_eq!(parse_size("4096").unwrap(), 4096);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "G", "10X", "0G", "1.5G", "-1G", "99999999999999999999"] {
            assert!(parse_size(bad).is_err(), "'{bad}' should be rejected");
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_size("99999999T").is_err());
    }
}
