#![no_main]
use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use quotient_filter::Filter;

#[derive(Debug, Arbitrary)]
struct Input {
    rbits: u8,
    writes: Vec<(u16, u64)>,
}

// Differential check of the bit-packed slot array against a plain
// one-slot-per-word model, across remainder widths that straddle words.
fuzz_target!(|input: Input| {
    let Input { rbits, writes } = input;
    let rbits = rbits.clamp(1, 58);
    let Ok(mut f) = Filter::new(6, rbits) else {
        return;
    };
    let cap = f.capacity();
    let slot_bits = u32::from(rbits) + 3;
    let slot_mask = !u64::MAX.checked_shl(slot_bits).unwrap_or(0);
    let mut reference = vec![0u64; cap as usize];
    for &(index, value) in &writes {
        let index = u64::from(index) % cap;
        let value = value & slot_mask;
        f.set_raw_slot(index, value);
        reference[index as usize] = value;
        for i in 0..cap {
            assert_eq!(f.raw_slot(i), reference[i as usize], "rbits {rbits} slot {i}");
        }
    }
});
