//! Property tests for the wire codec and configuration fingerprint.

use proptest::prelude::*;

use netsync::core::bits::{read_header, write_header, BitReader, BitWriter};
use netsync::network::channel::registration_order;
use netsync::network::message::{AddObject, ApprovalLayout, ConnectionApproved, ConnectionRequest};
use netsync::network::{ChannelConfig, TransportKind};
use netsync::{ChannelKind, NetworkConfig};

#[derive(Debug, Clone)]
enum Field {
    Bits(u64, u32),
    Bool(bool),
    Var(u64),
    Bytes(Vec<u8>),
}

fn field() -> impl Strategy<Value = Field> {
    prop_oneof![
        (any::<u64>(), 1u32..=64).prop_map(|(v, n)| {
            let mask = if n == 64 { u64::MAX } else { (1u64 << n) - 1 };
            Field::Bits(v & mask, n)
        }),
        any::<bool>().prop_map(Field::Bool),
        any::<u64>().prop_map(Field::Var),
        prop::collection::vec(any::<u8>(), 0..24).prop_map(Field::Bytes),
    ]
}

fn channel_kind() -> impl Strategy<Value = ChannelKind> {
    prop_oneof![
        Just(ChannelKind::Reliable),
        Just(ChannelKind::ReliableSequenced),
        Just(ChannelKind::Unreliable),
        Just(ChannelKind::StateUpdate),
    ]
}

fn user_channels() -> impl Strategy<Value = Vec<ChannelConfig>> {
    prop::collection::btree_map("[a-z]{1,8}", channel_kind(), 0..6).prop_map(|map| {
        map.into_iter()
            .map(|(name, kind)| ChannelConfig::new(&name, kind))
            .collect()
    })
}

proptest! {
    #[test]
    fn test_mixed_fields_read_back_in_order(fields in prop::collection::vec(field(), 0..32)) {
        let mut writer = BitWriter::new();
        for f in &fields {
            match f {
                Field::Bits(v, n) => writer.write_bits(*v, *n),
                Field::Bool(b) => writer.write_bool(*b),
                Field::Var(v) => writer.write_var_u64(*v),
                Field::Bytes(b) => writer.write_bytes(b),
            }
        }

        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        for f in &fields {
            match f {
                Field::Bits(v, n) => prop_assert_eq!(reader.read_bits(*n).unwrap(), *v),
                Field::Bool(b) => prop_assert_eq!(reader.read_bool().unwrap(), *b),
                Field::Var(v) => prop_assert_eq!(reader.read_var_u64().unwrap(), *v),
                Field::Bytes(b) => prop_assert_eq!(&reader.read_bytes().unwrap(), b),
            }
        }
        prop_assert!(reader.remaining_bits() < 8);
    }

    #[test]
    fn test_header_leaves_body_aligned(tag in any::<u32>(), body in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut writer = BitWriter::new();
        write_header(&mut writer, tag);
        writer.write_raw(&body);

        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        prop_assert_eq!(read_header(&mut reader).unwrap(), tag);
        prop_assert_eq!(reader.rest(), &body[..]);
    }

    #[test]
    fn test_decoders_never_panic_on_garbage(
        bytes in prop::collection::vec(any::<u8>(), 0..128),
        scene_switching in any::<bool>(),
        encryption in any::<bool>(),
        signing in any::<bool>(),
        spawning in any::<bool>(),
    ) {
        let layout = ApprovalLayout { scene_switching, encryption, signing, spawning };
        let _ = ConnectionApproved::decode(&mut BitReader::new(&bytes), layout);
        let _ = AddObject::decode(&mut BitReader::new(&bytes), spawning);
        let _ = read_header(&mut BitReader::new(&bytes));

        let mut reader = BitReader::new(&bytes);
        if let Ok(hash) = ConnectionRequest::read_hash(&mut reader) {
            let _ = ConnectionRequest::read_tail(hash, &mut reader, encryption, spawning);
        }
    }

    #[test]
    fn test_channel_order_ignores_config_order(channels in user_channels(), seed in any::<u64>()) {
        let mut shuffled = channels.clone();
        // Deterministic shuffle driven by the seed.
        let len = shuffled.len();
        if len > 1 {
            for i in 0..len {
                let j = ((seed >> (i % 8 * 8)) as usize + i) % len;
                shuffled.swap(i, j);
            }
        }

        let a = registration_order(ChannelKind::ReliableSequenced, &channels);
        let b = registration_order(ChannelKind::ReliableSequenced, &shuffled);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn test_config_hash_ignores_channel_order(channels in user_channels()) {
        let forward = NetworkConfig {
            transport: TransportKind::Custom,
            channels: channels.clone(),
            ..NetworkConfig::default()
        };
        let reversed = NetworkConfig {
            channels: channels.into_iter().rev().collect(),
            ..forward.clone()
        };
        prop_assert_eq!(forward.config_hash().unwrap(), reversed.config_hash().unwrap());
    }
}
