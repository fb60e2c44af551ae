//! SPIR-V header checks
//!
//! Catches truncated or mislabelled kernel files before the driver sees
//! them. Not a full validator; run spirv-val for that.

use crate::error::VulkanErrorKind;

const SPIRV_MAGIC: u32 = 0x0723_0203;
const HEADER_BYTES: usize = 20;

/// Check magic, version (1.0 to 1.6), alignment and id bound.
pub fn validate_spirv(bytes: &[u8]) -> Result<(), VulkanErrorKind> {
    if bytes.len() < HEADER_BYTES {
        return Err(VulkanErrorKind::InvalidSpirv(format!(
            "too small: {} bytes (header is {})",
            bytes.len(),
            HEADER_BYTES
        )));
    }
    if bytes.len() % 4 != 0 {
        return Err(VulkanErrorKind::InvalidSpirv(format!(
            "size {} not 4-byte aligned",
            bytes.len()
        )));
    }

    let word = |i: usize| u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]]);
    let magic = word(0);
    if magic != SPIRV_MAGIC {
        return Err(VulkanErrorKind::InvalidSpirv(format!(
            "bad magic 0x{:08x}",
            magic
        )));
    }
    let version = word(1);
    let (major, minor) = ((version >> 16) & 0xFF, (version >> 8) & 0xFF);
    if major != 1 || minor > 6 {
        return Err(VulkanErrorKind::InvalidSpirv(format!(
            "unsupported version {}.{}",
            major, minor
        )));
    }
    let bound = word(3);
    if bound == 0 {
        return Err(VulkanErrorKind::InvalidSpirv("id bound is 0".to_string()));
    }

    log::trace!(
        "SPIR-V ok: version {}.{}, bound {}, {} bytes",
        major,
        minor,
        bound,
        bytes.len()
    );
    Ok(())
}

/// Little-endian words of a validated module.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, VulkanErrorKind> {
    validate_spirv(bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<u8> {
        vec![
            0x03, 0x02, 0x23, 0x07, // magic
            0x00, 0x00, 0x01, 0x00, // 1.0
            0x00, 0x00, 0x00, 0x00, // generator
            0x01, 0x00, 0x00, 0x00, // bound
            0x00, 0x00, 0x00, 0x00, // schema
        ]
    }

    fn reason(bytes: &[u8]) -> String {
        match validate_spirv(bytes) {
            Err(VulkanErrorKind::InvalidSpirv(r)) => r,
            other => panic!("expected InvalidSpirv, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_header_is_valid() {
        assert!(validate_spirv(&header()).is_ok());
        assert_eq!(spirv_words(&header()).unwrap()[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_rejections() {
        assert!(reason(&header()[..8]).contains("too small"));

        let mut unaligned = header();
        unaligned.push(0);
        assert!(reason(&unaligned).contains("aligned"));

        let mut magic = header();
        magic[0] = 0;
        assert!(reason(&magic).contains("magic"));

        let mut bound = header();
        bound[12] = 0;
        assert!(reason(&bound).contains("bound"));
    }

    #[test]
    fn test_version_window() {
        let mut v = header();
        v[5] = 6;
        assert!(validate_spirv(&v).is_ok());
        v[5] = 7;
        assert!(validate_spirv(&v).is_err());
        v[5] = 0;
        v[6] = 2;
        assert!(validate_spirv(&v).is_err());
    }
}
