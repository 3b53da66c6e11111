//! Property tests: address codec and store round-trips.

use proptest::prelude::*;
use segdb_core::{AddressFormat, RecordStore, StoreConfig, NO_ADDRESS};

#[derive(Debug, Clone)]
enum Op {
    Put(usize, Vec<u8>),
    Delete(usize),
    Compact,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..32usize, prop::collection::vec(any::<u8>(), 0..120))
            .prop_map(|(index, data)| Op::Put(index, data)),
        2 => (0..32usize).prop_map(Op::Delete),
        1 => Just(Op::Compact),
    ]
}

fn format_strategy() -> impl Strategy<Value = AddressFormat> {
    (16u8..=40, 1u8..=16, 1u8..=8)
        .prop_filter_map("widths must fit in 64 bits", |(offset, segment, size)| {
            AddressFormat::new(offset, segment, size).ok()
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn codec_roundtrip(
        format in format_strategy(),
        offset_seed in any::<u64>(),
        segment_seed in any::<u32>(),
        size_seed in any::<usize>(),
    ) {
        let offset = offset_seed % (format.max_offset() + 1);
        let segment = segment_seed % format.max_segments();
        let size = size_seed % (format.max_embedded_size() * 2 + 1);

        let address = format.encode(offset, segment, size);
        prop_assert_eq!(format.offset(address), offset);
        prop_assert_eq!(format.segment(address), segment);

        let expected_size = (size > 0 && size <= format.max_embedded_size()).then_some(size);
        prop_assert_eq!(format.data_size(address), expected_size);
        if offset > 0 || expected_size.is_some() || segment > 0 {
            prop_assert_ne!(address, NO_ADDRESS);
        }
    }

    #[test]
    fn last_write_wins(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let config = StoreConfig::new()
            .initial_length(32)
            .segment_capacity(1024)
            .batch_size(4);
        let store = RecordStore::in_memory(config).unwrap();
        let mut model: Vec<Option<Vec<u8>>> = vec![None; 32];

        for (scn, op) in ops.into_iter().enumerate() {
            let scn = scn as u64 + 1;
            match op {
                Op::Put(index, data) => {
                    store.put(index, &data, scn).unwrap();
                    model[index] = Some(data);
                }
                Op::Delete(index) => {
                    store.delete(index, scn).unwrap();
                    model[index] = None;
                }
                Op::Compact => {
                    store.compact_now().unwrap();
                    store.persist().unwrap();
                }
            }
        }
        store.compact_now().unwrap();
        store.persist().unwrap();

        for (index, expected) in model.iter().enumerate() {
            let actual = store.get(index);
            prop_assert_eq!(actual.as_ref(), expected.as_ref());
            prop_assert_eq!(store.has_data(index), expected.is_some());
        }
        let payload: u64 = model.iter().flatten().map(|data| data.len() as u64).sum();
        prop_assert_eq!(store.live_bytes(), payload);
    }
}
