//! Property tests: serialized key sets parse back losslessly for every
//! supported version, and strengthening is monotone.

use fgalera_keyset::{KeyData, KeySetIn, KeySetOut, KeySetVersion};
use fgalera_types::KeyStrength;
use proptest::prelude::*;

fn arb_strength() -> impl Strategy<Value = KeyStrength> {
    prop_oneof![
        Just(KeyStrength::Shared),
        Just(KeyStrength::Reference),
        Just(KeyStrength::Update),
        Just(KeyStrength::Exclusive),
    ]
}

fn arb_key() -> impl Strategy<Value = (Vec<Vec<u8>>, KeyStrength)> {
    (
        prop::collection::vec(prop::collection::vec(any::<u8>(), 1..24), 1..4),
        arb_strength(),
    )
}

fn arb_version() -> impl Strategy<Value = (KeySetVersion, u8)> {
    prop_oneof![
        Just((KeySetVersion::Flat8, 3)),
        Just((KeySetVersion::Flat8A, 3)),
        Just((KeySetVersion::Flat8, 4)),
        Just((KeySetVersion::Flat8A, 4)),
        Just((KeySetVersion::Flat16, 5)),
        Just((KeySetVersion::Flat16A, 5)),
    ]
}

proptest! {
    #[test]
    fn gather_then_init_preserves_count_and_size(
        keys in prop::collection::vec(arb_key(), 0..16),
        (version, ws_version) in arb_version(),
    ) {
        let mut kso = KeySetOut::new(version, ws_version);
        for (parts, strength) in &keys {
            let views: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
            kso.append(&KeyData::new(&views, *strength));
        }

        let bytes = kso.gather();
        prop_assert_eq!(bytes.len(), kso.size());

        let ksi = KeySetIn::init(&bytes).unwrap();
        prop_assert_eq!(KeySetIn::count(&ksi), kso.count());
        let parts: Vec<_> = ksi.collect::<Result<_, _>>().unwrap();
        prop_assert_eq!(parts.len(), kso.count());
    }

    #[test]
    fn serialization_is_deterministic(
        keys in prop::collection::vec(arb_key(), 1..12),
    ) {
        let encode = || {
            let mut kso = KeySetOut::new(KeySetVersion::Flat16A, 5);
            for (parts, strength) in &keys {
                let views: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
                kso.append(&KeyData::new(&views, *strength));
            }
            kso.gather()
        };
        prop_assert_eq!(encode(), encode());
    }

    #[test]
    fn strengthening_same_path_adds_one_part_per_tier(
        parts in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..16), 1..4),
    ) {
        let views: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        let mut kso = KeySetOut::new(KeySetVersion::Flat16A, 5);

        kso.append(&KeyData::new(&views, KeyStrength::Shared));
        let base = kso.count();

        for (i, s) in [KeyStrength::Reference, KeyStrength::Update, KeyStrength::Exclusive]
            .into_iter()
            .enumerate()
        {
            kso.append(&KeyData::new(&views, s));
            prop_assert_eq!(kso.count(), base + i + 1);
            // Appending the same tier again changes nothing.
            kso.append(&KeyData::new(&views, s));
            prop_assert_eq!(kso.count(), base + i + 1);
        }
    }
}
