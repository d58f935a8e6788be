#![no_main]
use std::collections::HashSet;
use std::hash::{BuildHasherDefault, Hasher};

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use quotient_filter::Filter;

const CHECK_EVERY: usize = 16;

/// Hashes a `u64` key to itself, so the filter stores exact 16-bit
/// fingerprints and the model can predict every answer, including misses.
#[derive(Default)]
struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 8) | u64::from(b);
        }
    }

    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }
}

#[derive(Debug, Arbitrary)]
struct Input {
    qbits: u8,
    ops: Vec<(bool, u16)>,
}

fuzz_target!(|input: Input| {
    let Input { qbits, ops } = input;
    let qbits = qbits.clamp(1, 10);
    let rbits = 16 - qbits;
    let hasher = BuildHasherDefault::<IdentityHasher>::default();
    let Ok(mut f) = Filter::with_hasher(hasher, qbits, rbits) else {
        return;
    };
    let mut model: HashSet<u16> = HashSet::new();
    for (i, &(add, key)) in ops.iter().enumerate() {
        if add {
            match f.add(u64::from(key)) {
                Ok(added) => assert_eq!(added, model.insert(key)),
                Err(_) => assert_eq!(model.len() as u64, f.capacity()),
            }
        } else {
            assert_eq!(f.remove(u64::from(key)), model.remove(&key));
        }
        assert_eq!(f.len() as usize, model.len());
        if i % CHECK_EVERY == 0 {
            f.check_invariants();
            for &k in &model {
                assert!(f.contains(u64::from(k)));
            }
        }
    }
    f.check_invariants();
    let mut prints: Vec<u64> = f.fingerprints().collect();
    prints.sort_unstable();
    let mut expected: Vec<u64> = model.iter().map(|&k| u64::from(k)).collect();
    expected.sort_unstable();
    assert_eq!(prints, expected);
});
