use std::collections::HashSet;

/// Wrapping 16-bit sequence counter that skips numbers still in use.
#[derive(Debug, Default)]
pub struct SequenceNumberGenerator {
    next: u16,
    in_use: HashSet<u16>,
}

impl SequenceNumberGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> Option<u16> {
        if self.in_use.len() > u16::MAX as usize {
            return None;
        }
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    pub fn release(&mut self, sequence: u16) -> bool {
        self.in_use.remove(&sequence)
    }

    pub fn is_used(&self, sequence: u16) -> bool {
        self.in_use.contains(&sequence)
    }

    pub fn used(&self) -> usize {
        self.in_use.len()
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wraps_around_and_skips_used_numbers() {
        let mut generator = SequenceNumberGenerator {
            next: u16::MAX,
            in_use: HashSet::from([0]),
        };
        assert_eq!(generator.acquire(), Some(u16::MAX));
        assert_eq!(generator.acquire(), Some(1));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut generator = SequenceNumberGenerator::new();
        for _ in 0..=u16::MAX as usize {
            assert!(generator.acquire().is_some());
        }
        assert_eq!(generator.acquire(), None);
        assert!(generator.release(42));
        assert_eq!(generator.acquire(), Some(42));
    }

    proptest! {
        #[test]
        fn acquired_numbers_never_collide(ops in prop::collection::vec(any::<bool>(), 1..500)) {
            let mut generator = SequenceNumberGenerator::new();
            let mut live: Vec<u16> = Vec::new();
            for acquire in ops {
                if acquire || live.is_empty() {
                    let seq = generator.acquire().unwrap();
                    prop_assert!(!live.contains(&seq), "sequence {} handed out twice", seq);
                    live.push(seq);
                } else {
                    let seq = live.remove(0);
                    prop_assert!(generator.release(seq));
                }
            }
            prop_assert_eq!(generator.used(), live.len());
        }
    }
}
