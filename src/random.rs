//! Bounded random integers.
//!
//! Draws only as many bytes as the bit width of `max` needs from the TLS
//! provider's nonce-grade generator, falling back to `fastrand` when that
//! call fails. The result is reduced modulo `max`, so values are not exactly
//! uniform when `max` is not a power of two.

use rustls::crypto::SecureRandom;

/// Random value in `[0, max)`, or 0 when `max <= 1`.
pub fn bounded_random(max: i64) -> i64 {
    let provider = rustls::crypto::ring::default_provider();
    bounded_random_from(provider.secure_random, max)
}

/// [`bounded_random`] with an explicit entropy source.
pub fn bounded_random_from(source: &dyn SecureRandom, max: i64) -> i64 {
    if max <= 1 {
        return 0;
    }
    let bound = max as u64;

    let needed = bytes_for(bound);
    let mut buf = [0u8; 8];
    let r = match source.fill(&mut buf[..needed]) {
        Ok(()) => buf[..needed]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        Err(_) => {
            tracing::debug!("secure random unavailable, using fallback generator");
            fastrand::u64(..)
        }
    };

    (r % bound) as i64
}

/// Bytes needed to cover the bit width of `max`, capped at the integer width.
fn bytes_for(max: u64) -> usize {
    let bits = u64::BITS - max.leading_zeros();
    (bits.div_ceil(8) as usize).clamp(1, std::mem::size_of::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::crypto::GetRandomFailed;

    #[derive(Debug)]
    struct Broken;

    impl SecureRandom for Broken {
        fn fill(&self, _buf: &mut [u8]) -> Result<(), GetRandomFailed> {
            Err(GetRandomFailed)
        }
    }

    #[test]
    fn small_bounds_return_zero() {
        for max in [-5, 0, 1] {
            assert_eq!(bounded_random(max), 0);
        }
    }

    #[test]
    fn values_stay_in_range() {
        for max in [2, 3, 7, 255, 256, 257, 65_537, i64::MAX] {
            for _ in 0..200 {
                let v = bounded_random(max);
                assert!((0..max).contains(&v), "{} out of [0, {})", v, max);
            }
        }
    }

    #[test]
    fn fallback_generator_stays_in_range() {
        for _ in 0..200 {
            let v = bounded_random_from(&Broken, 10);
            assert!((0..10).contains(&v));
        }
    }

    #[test]
    fn byte_count_follows_bit_width() {
        assert_eq!(bytes_for(2), 1);
        assert_eq!(bytes_for(255), 1);
        assert_eq!(bytes_for(256), 2);
        assert_eq!(bytes_for(u64::MAX), 8);
    }
}
