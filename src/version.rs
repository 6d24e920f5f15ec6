//! Dotted-numeric version comparison used for driver version detection
//! (e.g. Cassandra v2 vs v3 schema table selection).

use std::cmp::Ordering;

/// Compare two dotted-numeric version strings component-wise.
///
/// Shorter strings are treated as zero-padded against the longer one up to
/// the shared prefix length, then compared numerically: `8.0.2` vs `8` is
/// `0` because the shared prefix (`8` == `8`) is equal and there is nothing
/// further to compare against on the shorter side.
pub fn version_compare(a: &str, b: &str) -> i32 {
    let pa: Vec<u64> = a.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    let pb: Vec<u64> = b.split('.').map(|p| p.parse().unwrap_or(0)).collect();

    let shared = pa.len().min(pb.len());
    for i in 0..shared {
        match pa[i].cmp(&pb[i]) {
            Ordering::Less => return -1,
            Ordering::Greater => return 1,
            Ordering::Equal => continue,
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn law_table() {
        assert_eq!(version_compare("8.0.2", "8.0.1"), 1);
        assert_eq!(version_compare("8.0.2", "8.0.3"), -1);
        assert_eq!(version_compare("8.0.2", "8"), 0);
        assert_eq!(version_compare("12", "8"), 1);
        assert_eq!(version_compare("8", "12"), -1);
    }

    #[test]
    fn antisymmetric() {
        for (a, b) in [("8.0.2", "8.0.1"), ("1.2.3", "1.2.3"), ("2", "10")] {
            assert_eq!(version_compare(a, b), -version_compare(b, a));
        }
    }

    #[test]
    fn equal_up_to_shorter_prefix_is_zero() {
        assert_eq!(version_compare("3.11.0", "3"), 0);
        assert_eq!(version_compare("3", "3.11.0"), 0);
    }
}
