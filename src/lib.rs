pub mod analysis;
pub mod args;
pub mod buffer;
pub mod capture;
pub mod collector;
pub mod complex;
pub mod config;
pub mod error;
pub mod link;
pub mod loopback;
pub mod monitoring;
pub mod sampler;
pub mod sequencer;
pub mod transport;

pub use error::{Error, Result};

/// One decimated, polarity-corrected ADC reading
pub type Sample = i32;

/// Raw ADC clock rate in Hz
pub const SAMPLE_RATE: u32 = 200_000;
/// Decimation factors the ADC's filtered output supports
pub const DECIMATIONS: [u32; 4] = [256, 1024, 4096, 16384];
/// Width of one shifted-in ADC word
pub const WORD_BITS: u32 = 32;
/// Notification payload: one little-endian i32
pub const PAYLOAD_SIZE: usize = 4;
pub const DATAGRAM_PORT: u16 = 12345;
/// End-of-stream payload on the datagram path
pub const SENTINEL: &str = "FINISHED";
pub const INITIATION: &str = "SEND DATA";
pub const DEVICE_NAME: &str = "iq_digitizer";

/// Number of samples (I and Q halves counted separately) in a session.
///
/// Integer form of `(fs / decimation) * duration * 2`, truncated.
pub fn session_target(sample_rate: u32, decimation: u32, duration: u32) -> usize {
    if decimation == 0 {
        return 0;
    }
    (sample_rate as u64 * duration as u64 * 2 / decimation as u64) as usize
}

/// Sign-extend the low `bits` bits of a raw shift register word
pub fn to_signed(raw: u32, bits: u32) -> i32 {
    debug_assert!((1..=32).contains(&bits));
    let shift = 32 - bits;
    ((raw << shift) as i32) >> shift
}

/// The ADC front end is inverted; every sample is the negated reading
pub fn correct_polarity(raw: u32) -> Sample {
    to_signed(raw, WORD_BITS).wrapping_neg()
}

pub fn encode_sample(sample: Sample) -> [u8; PAYLOAD_SIZE] {
    sample.to_le_bytes()
}

/// Decode a notification payload, `None` if it isn't exactly one sample wide
pub fn decode_sample(payload: &[u8]) -> Option<Sample> {
    let bytes: [u8; PAYLOAD_SIZE] = payload.try_into().ok()?;
    Some(Sample::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_matches_rig_defaults() {
        // 200 kHz / 1024 * 20 s * 2 = 7812.5, truncated
        assert_eq!(session_target(200_000, 1024, 20), 7812);
        assert_eq!(session_target(200_000, 256, 10), 15625);
        assert_eq!(session_target(SAMPLE_RATE, 4096, 0), 0);
        assert_eq!(session_target(SAMPLE_RATE, 0, 20), 0);
    }

    #[test]
    fn target_is_even_for_integral_rates() {
        for &decimation in &[1u32, 2, 4, 8, 16, 32, 64] {
            for duration in 1..20 {
                let n = session_target(SAMPLE_RATE, decimation, duration);
                assert_eq!(n % 2, 0);
                assert_eq!(n, (SAMPLE_RATE / decimation * duration * 2) as usize);
            }
        }
    }

    #[test]
    fn sign_extension() {
        assert_eq!(to_signed(0xFFFF_FFFF, 32), -1);
        assert_eq!(to_signed(0x7FFF_FFFF, 32), i32::MAX);
        assert_eq!(to_signed(0x8000_0000, 32), i32::MIN);
        assert_eq!(to_signed(0x0000_0800, 12), -2048);
        assert_eq!(to_signed(0x0000_07FF, 12), 2047);
    }

    #[test]
    fn polarity_is_inverted() {
        assert_eq!(correct_polarity(5), -5);
        assert_eq!(correct_polarity(-100i32 as u32), 100);
        assert_eq!(correct_polarity(i32::MIN as u32), i32::MIN);
    }

    #[test]
    fn notification_payload_preserves_value() {
        for v in [0, 1, -1, 5, -3, 100, -100, i32::MAX, i32::MIN + 1] {
            let negated = v.wrapping_neg();
            assert_eq!(decode_sample(&encode_sample(negated)), Some(negated));
        }
        assert_eq!(encode_sample(1), [1, 0, 0, 0]);
    }

    #[test]
    fn short_payloads_do_not_decode() {
        assert_eq!(decode_sample(&[1, 2, 3]), None);
        assert_eq!(decode_sample(&[1, 2, 3, 4, 5]), None);
        assert_eq!(decode_sample(&[]), None);
    }
}
