//! The VM identity string stored in every archive header.
//!
//! Version strings shorter than the buffer are stored verbatim. Longer ones are truncated
//! and suffixed with eight hex digits of a MurmurHash3 of the full string, so two builds
//! whose versions share a long prefix still produce different identities.

/// Size of the identity buffer, including the terminating NUL.
pub const JVM_IDENT_MAX: usize = 256;

/// Seed of the identity hash. It must never change, or no archive would load across runs.
pub const IDENT_HASH_SEED: u32 = 8191;

/// Bytes of the version kept when it has to be truncated.
const TRUNCATED_PREFIX_LEN: usize = JVM_IDENT_MAX - 9;

/// MurmurHash3, x86 32-bit variant.
pub fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let mut k1 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);

        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, b) in tail.iter().enumerate() {
            k1 ^= (*b as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    fmix32(h1)
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Compute the identity buffer for `vm_version`.
pub fn make_ident(vm_version: &str) -> [u8; JVM_IDENT_MAX] {
    let mut ident = [0u8; JVM_IDENT_MAX];
    let bytes = vm_version.as_bytes();
    if bytes.len() < JVM_IDENT_MAX - 1 {
        ident[..bytes.len()].copy_from_slice(bytes);
    } else {
        let hash = murmur3_32(IDENT_HASH_SEED, bytes);
        ident[..TRUNCATED_PREFIX_LEN].copy_from_slice(&bytes[..TRUNCATED_PREFIX_LEN]);
        let suffix = format!("{:08x}", hash);
        ident[TRUNCATED_PREFIX_LEN..JVM_IDENT_MAX - 1].copy_from_slice(suffix.as_bytes());
    }
    ident
}

/// Is the buffer NUL terminated in its last byte?
pub fn is_terminated(ident: &[u8; JVM_IDENT_MAX]) -> bool {
    ident[JVM_IDENT_MAX - 1] == 0
}

/// The identity as text, up to the first NUL.
pub fn ident_to_string(ident: &[u8]) -> String {
    let len = ident.iter().position(|b| *b == 0).unwrap_or(ident.len());
    String::from_utf8_lossy(&ident[..len]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur3_reference_values() {
        assert_eq!(murmur3_32(0, b""), 0);
        assert_eq!(murmur3_32(0, b"hello"), 0x248b_fa47);
        assert_eq!(murmur3_32(IDENT_HASH_SEED, b"hello"), 0x2791_0354);
        assert_eq!(murmur3_32(IDENT_HASH_SEED, b"abc"), 0xb330_a5ba);
        assert_eq!(murmur3_32(IDENT_HASH_SEED, "a".repeat(300).as_bytes()), 0xbf3c_2597);
    }

    #[test]
    fn short_version_is_copied() {
        let ident = make_ident("OpenJDK 64-Bit Server VM (11.0.2+9) for linux-amd64");
        assert_eq!(
            ident_to_string(&ident),
            "OpenJDK 64-Bit Server VM (11.0.2+9) for linux-amd64"
        );
        assert!(is_terminated(&ident));
    }

    #[test]
    fn boundary_lengths() {
        // 254 bytes still fit verbatim
        let v = "b".repeat(254);
        assert_eq!(ident_to_string(&make_ident(&v)), v);
        // 255 bytes do not
        let v = "b".repeat(255);
        let s = ident_to_string(&make_ident(&v));
        assert_eq!(s.len(), 255);
        assert_eq!(&s[247..], format!("{:08x}", murmur3_32(IDENT_HASH_SEED, v.as_bytes())));
    }

    #[test]
    fn long_version_is_hashed() {
        let v = "a".repeat(300);
        let ident = make_ident(&v);
        let s = ident_to_string(&ident);
        assert_eq!(&s[..247], &v[..247]);
        assert_eq!(&s[247..], "bf3c2597");
        assert!(is_terminated(&ident));

        // same prefix, different tail: different identity
        let mut other = "a".repeat(299);
        other.push('z');
        assert_ne!(make_ident(&other), ident);
    }
}
