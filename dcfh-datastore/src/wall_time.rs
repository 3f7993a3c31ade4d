//! Packed wall clock timestamps.
//!
//! A 64 bit word holds 34 bits of seconds since 1885-01-01 UTC and 30
//! bits of nanoseconds. The 1885 epoch keeps the seconds field unsigned
//! while still covering all plausible file timestamps; the representable
//! range ends around the year 2429.

/// Seconds between 1885-01-01 and the Unix epoch.
pub const EPOCH_OFFSET: u64 = 2_682_374_400;

const NANOS_BITS: u32 = 30;
const SECONDS_MAX: u64 = (1 << 34) - 1;
const NANOS_MASK: u64 = (1 << NANOS_BITS) - 1;

/// Pack a Unix timestamp. Seconds before the 1885 floor (or past the 34
/// bit ceiling) are clamped; callers that care report the clamp.
pub fn pack(epoch_secs: i64, nanos: i64) -> u64 {
    let shifted = epoch_secs.saturating_add(EPOCH_OFFSET as i64);
    let secs = shifted.clamp(0, SECONDS_MAX as i64) as u64;
    let nanos = nanos.clamp(0, 999_999_999) as u64;
    (secs << NANOS_BITS) | nanos
}

/// Whether a Unix timestamp survives packing without clamping.
pub fn representable(epoch_secs: i64) -> bool {
    let shifted = epoch_secs as i128 + EPOCH_OFFSET as i128;
    shifted >= 0 && shifted <= SECONDS_MAX as i128
}

/// Unpack into Unix seconds and nanoseconds.
pub fn unpack(wall: u64) -> (i64, u32) {
    let secs = (wall >> NANOS_BITS) as i64 - EPOCH_OFFSET as i64;
    let nanos = (wall & NANOS_MASK) as u32;
    (secs, nanos)
}

/// Range check used by entry validation: Unix epoch up to `now` plus one
/// year, nanoseconds strictly below one billion.
pub fn in_valid_range(wall: u64, now: i64) -> bool {
    let (secs, nanos) = unpack(wall);
    if nanos >= 1_000_000_000 {
        return false;
    }
    secs >= 0 && secs <= now + 365 * 24 * 3600
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let cases = [(0i64, 0i64), (1_000_000_000, 999_999_999), (1, 1)];
        for (secs, nanos) in cases {
            let wall = pack(secs, nanos);
            assert_eq!(unpack(wall), (secs, nanos as u32));
        }
    }

    #[test]
    fn clamps_before_epoch_floor() {
        let wall = pack(-(EPOCH_OFFSET as i64) - 1000, 0);
        assert_eq!(unpack(wall), (-(EPOCH_OFFSET as i64), 0));
        assert!(!representable(-(EPOCH_OFFSET as i64) - 1000));
        assert!(representable(0));
    }

    #[test]
    fn range_check() {
        let now = 1_700_000_000;
        assert!(in_valid_range(pack(now, 0), now));
        assert!(!in_valid_range(pack(-1, 0), now));
        assert!(!in_valid_range(pack(now + 2 * 365 * 24 * 3600, 0), now));
        // nanoseconds field can technically hold values past 10^9
        let bogus = (pack(now, 0) & !NANOS_MASK) | 1_000_100_000;
        assert!(!in_valid_range(bogus, now));
    }
}
