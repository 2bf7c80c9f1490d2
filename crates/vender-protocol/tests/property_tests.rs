//! Property-based tests for slim frames.

use proptest::prelude::*;
use vender_protocol::frame::{FLAG_KEEPALIVE, FLAG_SIG};
use vender_protocol::{Frame, SlimError, StaticSecret};

fn frame_strategy() -> impl Strategy<Value = Frame> {
    (
        any::<u16>(),
        prop_oneof![Just(0u8), Just(FLAG_KEEPALIVE)],
        prop_oneof![Just(0u64), any::<u64>()],
        any::<u16>(),
        any::<u32>(),
        proptest::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(seq, flags, session, ack_seq, acks, payload)| Frame {
            seq,
            flags,
            session,
            ack_seq,
            acks,
            payload: payload.into(),
        })
}

proptest! {
    /// Decoding an encoded frame yields the same frame once implied flags
    /// are applied.
    #[test]
    fn prop_roundtrip(f in frame_strategy()) {
        let b = f.marshal(None).unwrap();
        prop_assert_eq!(b.len(), f.size());
        let back = Frame::unmarshal(&b, None).unwrap();
        let expect = Frame { flags: f.implied_flags(), ..f };
        prop_assert_eq!(back, expect);
    }

    /// Any single flipped bit in a signed frame is rejected.
    #[test]
    fn prop_signed_mutation_rejected(f in frame_strategy(), bit in any::<usize>()) {
        let secret = StaticSecret::new("password");
        let signed = Frame { flags: f.flags | FLAG_SIG, ..f };
        let mut b = signed.marshal(Some(&secret)).unwrap().to_vec();
        prop_assert!(Frame::unmarshal(&b, Some(&secret)).is_ok());

        let bit = bit % (b.len() * 8);
        b[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(Frame::unmarshal(&b, Some(&secret)).is_err());
    }

    #[test]
    fn prop_unmarshal_never_panics(b in proptest::collection::vec(any::<u8>(), 0..128)) {
        let _ = Frame::unmarshal(&b, None);
    }
}

#[test]
fn test_wrong_secret_rejected() {
    let f = Frame {
        seq: 5,
        flags: FLAG_SIG,
        payload: "x".into(),
        ..Default::default()
    };
    let b = f.marshal(Some(&StaticSecret::new("password"))).unwrap();
    let other = StaticSecret::new("password2");
    assert!(matches!(
        Frame::unmarshal(&b, Some(&other)),
        Err(SlimError::SignatureInvalid)
    ));
}
