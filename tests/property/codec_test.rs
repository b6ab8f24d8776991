// tests/property/codec_test.rs

//! Property-based tests for the command codec
//! Tests that any command survives the wire, and that arbitrary bytes never panic the decoder

use bytes::BytesMut;
use proptest::prelude::*;
use questlink::core::protocol::{ArgValue, CodecKind, Command, CommandCodec, Reserved};
use tokio_util::codec::{Decoder, Encoder};

fn arg_value() -> impl Strategy<Value = ArgValue> {
    prop_oneof![
        Just(ArgValue::Null),
        any::<bool>().prop_map(ArgValue::Bool),
        any::<i32>().prop_map(ArgValue::Int),
        any::<i64>().prop_map(ArgValue::Long),
        any::<f32>()
            .prop_filter("NaN never compares equal", |f| !f.is_nan())
            .prop_map(ArgValue::Float),
        any::<f64>()
            .prop_filter("NaN never compares equal", |d| !d.is_nan())
            .prop_map(ArgValue::Double),
        ".{0,200}".prop_map(ArgValue::Str),
        "\\{\"[a-z]{1,8}\":[0-9]{1,6}\\}".prop_map(ArgValue::Structured),
    ]
}

fn reserved() -> impl Strategy<Value = Reserved> {
    prop_oneof![
        Just(Reserved::ClConnect),
        Just(Reserved::ClUpdate),
        Just(Reserved::Ping),
        Just(Reserved::SvrConnected),
        Just(Reserved::SvrExecuteRemote),
        Just(Reserved::Message),
    ]
}

fn command() -> impl Strategy<Value = Command> {
    (
        reserved(),
        proptest::collection::vec(("[a-zA-Z][a-zA-Z0-9_]{0,30}", arg_value()), 0..20),
    )
        .prop_map(|(kind, args)| {
            let mut command = Command::new(kind);
            for (key, value) in args {
                command.put(key, value);
            }
            command
        })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_typed_codec_roundtrip(command in command()) {
        let mut codec = CommandCodec::new(CodecKind::Typed);
        let mut buf = BytesMut::new();
        codec.encode(command.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded, command);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn test_plain_codec_preserves_string_forms(command in command()) {
        let mut codec = CommandCodec::new(CodecKind::Plain);
        let mut buf = BytesMut::new();
        codec.encode(command.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded.command_type(), command.command_type());
        prop_assert_eq!(decoded.len(), command.len());
        for ((key, sent), (decoded_key, received)) in command.arguments().zip(decoded.arguments()) {
            prop_assert_eq!(key, decoded_key);
            prop_assert_eq!(received, &ArgValue::Str(sent.to_wire_string()));
        }
    }

    #[test]
    fn test_split_delivery_decodes_once(command in command(), split in 0usize..512) {
        let mut codec = CommandCodec::new(CodecKind::Typed);
        let encoded = codec.encode_to_vec(&command).unwrap();
        let split = split.min(encoded.len());

        let mut buf = BytesMut::from(&encoded[..split]);
        let early = codec.decode(&mut buf).unwrap();
        if split < encoded.len() {
            prop_assert!(early.is_none());
            buf.extend_from_slice(&encoded[split..]);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, command);
        } else {
            prop_assert_eq!(early, Some(command));
        }
    }

    #[test]
    fn test_arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        for kind in [CodecKind::Plain, CodecKind::Typed] {
            let mut codec = CommandCodec::new(kind);
            let mut buf = BytesMut::from(&bytes[..]);
            // Errors are fine; panics and unbounded loops are not.
            for _ in 0..bytes.len() + 1 {
                match codec.decode(&mut buf) {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}
