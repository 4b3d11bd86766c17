//! Backend time units
//!
//! Positions exchanged with the rendering backend are expressed in ticks,
//! a fixed rate of 28,224,000 ticks per second. The rate divides evenly
//! into every common sample rate (44.1 kHz, 48 kHz, 96 kHz, ...), so a
//! sample boundary is always a whole number of ticks. The public player
//! API speaks seconds; conversion happens at the boundary.

/// Ticks per second
pub const TICK_RATE: i64 = 28_224_000;

/// Ticks per millisecond
pub const TICKS_PER_MS: i64 = TICK_RATE / 1000;

/// Convert milliseconds to ticks (lossless)
///
/// ```rust
/// use segue_common::timing::ms_to_ticks;
///
/// assert_eq!(ms_to_ticks(1), 28_224);
/// assert_eq!(ms_to_ticks(1000), 28_224_000);
/// assert_eq!(ms_to_ticks(-1000), -28_224_000);
/// ```
pub fn ms_to_ticks(milliseconds: i64) -> i64 {
    milliseconds * TICKS_PER_MS
}

/// Convert ticks to milliseconds using truncating division
///
/// ```rust
/// use segue_common::timing::ticks_to_ms;
///
/// assert_eq!(ticks_to_ms(28_224), 1);
/// assert_eq!(ticks_to_ms(28_223), 0);
/// ```
pub fn ticks_to_ms(ticks: i64) -> i64 {
    ticks / TICKS_PER_MS
}

/// Convert ticks to seconds
///
/// ```rust
/// use segue_common::timing::ticks_to_seconds;
///
/// assert_eq!(ticks_to_seconds(141_120_000), 5.0);
/// ```
pub fn ticks_to_seconds(ticks: i64) -> f64 {
    ticks as f64 / TICK_RATE as f64
}

/// Convert seconds to ticks, rounded to the nearest tick
///
/// ```rust
/// use segue_common::timing::seconds_to_ticks;
///
/// assert_eq!(seconds_to_ticks(0.5), 14_112_000);
/// ```
pub fn seconds_to_ticks(seconds: f64) -> i64 {
    (seconds * TICK_RATE as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_rate_divides_common_sample_rates() {
        for rate in [8000_i64, 11025, 22050, 44100, 48000, 88200, 96000, 192000] {
            assert_eq!(TICK_RATE % rate, 0, "{} Hz does not divide the tick rate", rate);
        }
    }

    #[test]
    fn test_ms_round_trip() {
        for ms in [0_i64, 1, 999, 3000, 180_000] {
            assert_eq!(ticks_to_ms(ms_to_ticks(ms)), ms);
        }
    }

    #[test]
    fn test_seconds_rounding() {
        assert_eq!(seconds_to_ticks(30.0), 30 * TICK_RATE);
        assert!((ticks_to_seconds(seconds_to_ticks(12.345)) - 12.345).abs() < 1e-6);
    }
}
