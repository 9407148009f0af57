//! Time-ordered correlation ids.
//!
//! A [`MessageId`] is 128 bits laid out as
//!
//! ```text
//!  48 bits  | 4 bits  | 12 bits  | 2 bits  | 14 bits | 48 bits
//!  unix ms  | version | seq high | variant | seq low | random
//! ```
//!
//! and renders in the usual 8-4-4-4-12 lowercase hex form. Ids from one
//! [`MessageIdGenerator`] sort by their timestamp‖sequence bits in the order
//! they were generated; the random tail only lowers the odds of collision
//! between processes.
//!
//! The generator keeps its state in a single atomic word and advances it with
//! compare-and-swap. The only blocking point is when a millisecond's 2^26
//! sequence numbers are used up: the caller sleeps until the clock moves on.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Sequence numbers available per millisecond.
pub const SEQUENCE_CAPACITY: u64 = 1 << SEQUENCE_BITS;

const SEQUENCE_BITS: u32 = 26;
const SEQUENCE_MASK: u64 = SEQUENCE_CAPACITY - 1;
const SEQ_LOW_BITS: u32 = 14;
const SEQ_LOW_MASK: u64 = (1 << SEQ_LOW_BITS) - 1;
const SEQ_HIGH_MASK: u64 = (1 << 12) - 1;
const LOW48_MASK: u64 = (1 << 48) - 1;
const VERSION: u128 = 0x7;
const VARIANT: u128 = 0b10;

/// Sleep slice while waiting out an exhausted millisecond.
const OVERFLOW_SLEEP: Duration = Duration::from_micros(100);

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u128);

impl MessageId {
    fn compose(timestamp_ms: u64, sequence: u64, random: u64) -> Self {
        let seq_high = (sequence >> SEQ_LOW_BITS) & SEQ_HIGH_MASK;
        let seq_low = sequence & SEQ_LOW_MASK;
        let bits = (u128::from(timestamp_ms & LOW48_MASK) << 80)
            | (VERSION << 76)
            | (u128::from(seq_high) << 64)
            | (VARIANT << 62)
            | (u128::from(seq_low) << 48)
            | u128::from(random & LOW48_MASK);
        Self(bits)
    }

    /// Raw 128-bit value.
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Millisecond the id was issued in.
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> 80) as u64
    }

    /// Position within its millisecond.
    pub fn sequence(&self) -> u64 {
        let high = ((self.0 >> 64) as u64) & SEQ_HIGH_MASK;
        let low = ((self.0 >> 48) as u64) & SEQ_LOW_MASK;
        (high << SEQ_LOW_BITS) | low
    }

    /// Timestamp‖sequence: the part of the id that carries ordering.
    pub fn ordering_key(&self) -> u128 {
        (u128::from(self.timestamp_ms()) << SEQUENCE_BITS) | u128::from(self.sequence())
    }

    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_u128(self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_uuid().hyphenated())
    }
}

impl FromStr for MessageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_valid(s) {
            return Err(format!("'{s}' is not a well-formed message id"));
        }
        Uuid::parse_str(s)
            .map(|u| MessageId(u.as_u128()))
            .map_err(|e| e.to_string())
    }
}

/// Snapshot of a generator's shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceState {
    /// Millisecond of the most recently issued id.
    pub last_timestamp_ms: u64,
    /// Sequence number most recently issued in that millisecond.
    pub sequence_counter: u64,
}

/// Issues [`MessageId`]s. Share one instance (behind an `Arc`) among every
/// caller that needs ids from the same ordering domain.
///
/// The state word packs `(ms - base) << 26 | last_sequence`, where `base` is
/// the clock reading at construction; this leaves 38 bits (about 8.7 years)
/// of generator lifetime.
pub struct MessageIdGenerator {
    clock: Arc<dyn Clock>,
    base_ms: u64,
    state: AtomicU64,
}

impl fmt::Debug for MessageIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageIdGenerator")
            .field("state", &self.sequence_state())
            .finish()
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdGenerator {
    /// Generator on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Generator on a caller-supplied clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        // One millisecond behind "now" so the first id starts a fresh
        // millisecond at sequence 0.
        let base_ms = clock.now_ms().saturating_sub(1);
        Self {
            clock,
            base_ms,
            state: AtomicU64::new(0),
        }
    }

    fn pack(rel_ms: u64, sequence: u64) -> u64 {
        (rel_ms << SEQUENCE_BITS) | sequence
    }

    fn unpack(word: u64) -> (u64, u64) {
        (word >> SEQUENCE_BITS, word & SEQUENCE_MASK)
    }

    fn now_rel(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.base_ms)
    }

    /// Current shared state.
    pub fn sequence_state(&self) -> SequenceState {
        let (rel, seq) = Self::unpack(self.state.load(Ordering::Acquire));
        SequenceState {
            last_timestamp_ms: self.base_ms + rel,
            sequence_counter: seq,
        }
    }

    /// Issue the next id.
    pub fn generate(&self) -> MessageId {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (stored_rel, last_seq) = Self::unpack(current);
            let now_rel = self.now_rel();

            let (rel, seq) = if now_rel > stored_rel {
                (now_rel, 0)
            } else if last_seq + 1 >= SEQUENCE_CAPACITY {
                self.wait_past(stored_rel);
                continue;
            } else {
                // Same millisecond, or the clock stepped backwards: stay on
                // the stored millisecond so ordering holds.
                (stored_rel, last_seq + 1)
            };

            if self
                .state
                .compare_exchange_weak(
                    current,
                    Self::pack(rel, seq),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return MessageId::compose(self.base_ms + rel, seq, rand::random::<u64>());
            }
        }
    }

    /// Issue an id with a human-readable suffix, e.g. `<id>-eval`.
    pub fn generate_tagged(&self, tag: &str) -> String {
        format!("{}-{}", self.generate(), tag)
    }

    /// Block until the clock is past `rel_ms`.
    fn wait_past(&self, rel_ms: u64) {
        tracing::debug!(
            timestamp_ms = self.base_ms + rel_ms,
            "Sequence exhausted, waiting for next millisecond"
        );
        while self.now_rel() <= rel_ms {
            std::thread::sleep(OVERFLOW_SLEEP);
        }
    }

    #[cfg(test)]
    fn force_state(&self, timestamp_ms: u64, sequence: u64) {
        self.state.store(
            Self::pack(timestamp_ms - self.base_ms, sequence),
            Ordering::Release,
        );
    }
}

/// Whether `s` is a canonical message id: 8-4-4-4-12 lowercase hex with the
/// version and variant nibbles set.
pub fn is_valid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, &b) in bytes.iter().enumerate() {
        let ok = match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => b.is_ascii_digit() || (b'a'..=b'f').contains(&b),
        };
        if !ok {
            return false;
        }
    }
    bytes[14] == b'7' && matches!(bytes[19], b'8' | b'9' | b'a' | b'b')
}

/// Recover the issuing millisecond from an id string. Accepts an optional
/// `-tag` suffix after the id.
pub fn extract_timestamp_ms(s: &str) -> Option<u64> {
    let (head, rest) = if s.len() >= 36 && s.is_char_boundary(36) {
        s.split_at(36)
    } else {
        return None;
    };
    if !rest.is_empty() && !rest.starts_with('-') {
        return None;
    }
    if !is_valid(head) {
        return None;
    }
    let hex: String = head[..13].chars().filter(|c| *c != '-').collect();
    u64::from_str_radix(&hex, 16).ok()
}

/// [`extract_timestamp_ms`] as a UTC datetime.
pub fn extract_datetime(s: &str) -> Option<DateTime<Utc>> {
    let ms = i64::try_from(extract_timestamp_ms(s)?).ok()?;
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Instant;

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn at(ms: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(ms)))
        }

        fn set(&self, ms: u64) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_layout_and_format() {
        let clock = ManualClock::at(1_700_000_000_123);
        let gen = MessageIdGenerator::with_clock(clock);
        let id = gen.generate();
        let text = id.to_string();
        assert!(is_valid(&text), "{text}");
        assert_eq!(id.timestamp_ms(), 1_700_000_000_123);
        assert_eq!(id.sequence(), 0);
        assert_eq!(id.as_uuid().get_version_num(), 7);
        assert_eq!(text.parse::<MessageId>().unwrap(), id);
        assert_eq!(extract_timestamp_ms(&text), Some(1_700_000_000_123));
    }

    #[test]
    fn test_sequence_spans_both_fields() {
        let id = MessageId::compose(5, (3 << 14) | 9, 0);
        assert_eq!(id.sequence(), (3 << 14) | 9);
        let top = MessageId::compose(5, SEQUENCE_CAPACITY - 1, u64::MAX);
        assert_eq!(top.sequence(), SEQUENCE_CAPACITY - 1);
        assert_eq!(top.timestamp_ms(), 5);
        assert!(is_valid(&top.to_string()));
    }

    #[test]
    fn test_same_millisecond_increments() {
        let clock = ManualClock::at(42_000);
        let gen = MessageIdGenerator::with_clock(clock.clone());
        let seqs: Vec<u64> = (0..3).map(|_| gen.generate().sequence()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        clock.set(42_001);
        let next = gen.generate();
        assert_eq!(next.timestamp_ms(), 42_001);
        assert_eq!(next.sequence(), 0);
    }

    #[test]
    fn test_clock_stepping_back_keeps_order() {
        let clock = ManualClock::at(2_000);
        let gen = MessageIdGenerator::with_clock(clock.clone());
        let first = gen.generate();
        clock.set(1_500);
        let second = gen.generate();
        assert_eq!(second.timestamp_ms(), 2_000);
        assert!(second.ordering_key() > first.ordering_key());
        assert!(second.to_string() > first.to_string());
    }

    #[test]
    fn test_overflow_blocks_until_next_millisecond() {
        let clock = ManualClock::at(10_000);
        let gen = MessageIdGenerator::with_clock(clock.clone());
        gen.force_state(10_000, SEQUENCE_CAPACITY - 1);

        let advancer = {
            let clock = clock.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                clock.set(10_001);
            })
        };

        let started = Instant::now();
        let id = gen.generate();
        let waited = started.elapsed();
        advancer.join().unwrap();

        assert!(waited >= Duration::from_millis(40), "returned after {waited:?}");
        assert_eq!(id.timestamp_ms(), 10_001);
        assert_eq!(id.sequence(), 0);
        assert_eq!(
            gen.sequence_state(),
            SequenceState {
                last_timestamp_ms: 10_001,
                sequence_counter: 0
            }
        );
    }

    #[test]
    fn test_concurrent_producers_are_ordered_and_unique() {
        let gen = Arc::new(MessageIdGenerator::new());
        let producers: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&gen);
                std::thread::spawn(move || (0..5_000).map(|_| gen.generate()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for producer in producers {
            let ids = producer.join().unwrap();
            for pair in ids.windows(2) {
                assert!(pair[0].ordering_key() < pair[1].ordering_key());
                assert!(pair[0].to_string() < pair[1].to_string());
            }
            for id in ids {
                assert!(seen.insert(id.ordering_key()), "duplicate {id}");
            }
        }
        assert_eq!(seen.len(), 40_000);
    }

    #[test]
    fn test_producers_interleaved_in_real_time_stay_ordered() {
        let gen = Arc::new(MessageIdGenerator::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let producers: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&gen);
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let mut log = log.lock().unwrap();
                        log.push(gen.generate());
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 16_000);
        for pair in log.windows(2) {
            assert!(
                pair[0].ordering_key() < pair[1].ordering_key(),
                "{} then {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_validation_rejects_malformed() {
        let good = MessageIdGenerator::new().generate().to_string();
        assert!(is_valid(&good));
        assert!(!is_valid(&good.to_uppercase()));
        assert!(!is_valid(&good.replace('-', "")));
        assert!(!is_valid(&good[..35]));

        let mut wrong_version = good.clone().into_bytes();
        wrong_version[14] = b'4';
        assert!(!is_valid(std::str::from_utf8(&wrong_version).unwrap()));

        let mut wrong_variant = good.into_bytes();
        wrong_variant[19] = b'c';
        assert!(!is_valid(std::str::from_utf8(&wrong_variant).unwrap()));
    }

    #[test]
    fn test_tagged_ids() {
        let clock = ManualClock::at(1_650_000_000_000);
        let gen = MessageIdGenerator::with_clock(clock);
        let tagged = gen.generate_tagged("shell");
        assert!(tagged.ends_with("-shell"));
        assert!(!is_valid(&tagged));
        assert_eq!(extract_timestamp_ms(&tagged), Some(1_650_000_000_000));
        let dt = extract_datetime(&tagged).unwrap();
        assert_eq!(dt.timestamp_millis(), 1_650_000_000_000);

        let bad_suffix = format!("{}x", &tagged[..36]);
        assert_eq!(extract_timestamp_ms(&bad_suffix), None);
        assert_eq!(extract_timestamp_ms("X"), None);
    }
}
