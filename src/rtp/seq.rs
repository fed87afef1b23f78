use std::sync::Mutex;

use crate::util::NonCryptographicRng;

/// Produces monotonically increasing 16-bit sequence numbers and counts
/// rollovers of the 16-bit space.
///
/// `next()` returns the current counter and advances it. The rollover count
/// increments at the call that returns 0xFFFF (the advance wraps to 0), so
/// the count observed via [`Sequencer::rollovers`] reflects the last
/// completed `next()`.
///
/// Concurrent callers serialize on an internal mutex.
#[derive(Debug)]
pub struct Sequencer {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    sequence_number: u16,
    roll_over_count: u64,
}

impl Sequencer {
    /// A sequencer whose first returned value is `start`.
    pub fn new(start: u16) -> Self {
        Sequencer {
            state: Mutex::new(State {
                sequence_number: start,
                roll_over_count: 0,
            }),
        }
    }

    /// A sequencer starting at a uniformly random value in `[0, 2^15 - 1]`.
    ///
    /// Only half the sequence number space is used, to avoid colliding with
    /// SRTP replay windows when a stream restarts.
    pub fn random() -> Self {
        Sequencer::new(NonCryptographicRng::u16() & 0x7FFF)
    }

    /// The next sequence number.
    pub fn next(&self) -> u16 {
        let mut state = self.state.lock().unwrap();
        let seq = state.sequence_number;
        state.sequence_number = state.sequence_number.wrapping_add(1);
        if state.sequence_number == 0 {
            state.roll_over_count += 1;
        }
        seq
    }

    /// How many times the 16-bit counter has wrapped from 0xFFFF to 0.
    pub fn rollovers(&self) -> u64 {
        self.state.lock().unwrap().roll_over_count
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequential_values() {
        let seq = Sequencer::new(100);
        assert_eq!(seq.next(), 100);
        assert_eq!(seq.next(), 101);
        assert_eq!(seq.next(), 102);
        assert_eq!(seq.rollovers(), 0);
    }

    #[test]
    fn rollover_counted_at_wrap() {
        let seq = Sequencer::new(0xFFFE);
        assert_eq!(seq.next(), 0xFFFE);
        assert_eq!(seq.rollovers(), 0);
        assert_eq!(seq.next(), 0xFFFF);
        assert_eq!(seq.rollovers(), 1);
        assert_eq!(seq.next(), 0x0000);
        assert_eq!(seq.rollovers(), 1);
    }

    #[test]
    fn one_rollover_iff_start_plus_n_wraps() {
        // exactly one rollover iff start + n >= 2^16
        let cases = [(0xFF00u16, 0x100usize, 1u64), (0xFF00, 0xFF, 0), (0, 65536, 1)];

        for (start, n, expected) in cases {
            let seq = Sequencer::new(start);
            for _ in 0..n {
                seq.next();
            }
            assert_eq!(
                seq.rollovers(),
                expected,
                "start={start:#06x} n={n}"
            );
        }
    }

    #[test]
    fn random_start_within_half_space() {
        for _ in 0..64 {
            let seq = Sequencer::random();
            assert!(seq.next() < 0x8000);
        }
    }

    #[test]
    fn shared_between_threads() {
        use std::sync::Arc;

        let seq = Arc::new(Sequencer::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let seq = seq.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    seq.next();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(seq.next(), 4000);
    }
}
