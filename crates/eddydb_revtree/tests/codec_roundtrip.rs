//! Property test: encoding is stable across a decode/encode round-trip.

use eddydb_revtree::{raw, RevBody, RevFlags, RevId, Revision};
use proptest::prelude::*;

/// Builds a structurally valid revision list from raw generator choices:
/// node 0 is the root, every later node picks an earlier parent.
fn build_revs(choices: &[(u8, bool, u8, u64)]) -> Vec<Revision> {
    let mut revs: Vec<Revision> = Vec::with_capacity(choices.len());
    for (i, &(parent_choice, deleted, body_kind, seq)) in choices.iter().enumerate() {
        let parent = (i > 0).then(|| u16::from(parent_choice) % i as u16);
        let rev_id = RevId::parse(format!("{}-r{i:02x}", i + 1)).unwrap();
        let body = match body_kind % 3 {
            0 => RevBody::None,
            1 => RevBody::Inline(vec![b'x'; (body_kind as usize) * 7]),
            _ => RevBody::Stored {
                offset: u64::from(body_kind) * 1000,
                size: u64::from(body_kind),
            },
        };
        let mut flags = RevFlags::empty();
        if deleted {
            flags = flags | RevFlags::DELETED;
        }
        revs.push(Revision {
            rev_id,
            parent,
            flags,
            sequence: seq,
            body,
        });
    }
    // Mark childless revisions as leaves.
    let with_children: Vec<u16> = revs.iter().filter_map(|r| r.parent).collect();
    for (i, rev) in revs.iter_mut().enumerate() {
        if !with_children.contains(&(i as u16)) {
            rev.flags = rev.flags | RevFlags::LEAF;
        }
    }
    revs
}

proptest! {
    #[test]
    fn encode_decode_encode_is_stable(
        choices in prop::collection::vec(
            (any::<u8>(), any::<bool>(), any::<u8>(), 1u64..1_000_000),
            1..12,
        )
    ) {
        let revs = build_revs(&choices);
        let blob = raw::encode(&revs);
        let decoded = raw::decode(&blob, 0).unwrap();
        prop_assert_eq!(raw::encode(&decoded), blob);
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = raw::decode(&data, 0);
    }
}
