use crate::encoding::*;

/// # Scenario
/// Every primitive round-trips to the exact value and reports the exact
/// number of bytes consumed.
#[test]
fn primitives_round_trip() {
    let mut buf = Vec::new();
    0xABu8.encode_to(&mut buf).unwrap();
    0xDEAD_BEEFu32.encode_to(&mut buf).unwrap();
    0x0123_4567_89AB_CDEFu64.encode_to(&mut buf).unwrap();
    true.encode_to(&mut buf).unwrap();
    false.encode_to(&mut buf).unwrap();

    let mut offset = 0;
    let (b, n) = u8::decode_from(&buf[offset..]).unwrap();
    assert_eq!((b, n), (0xAB, 1));
    offset += n;
    let (w, n) = u32::decode_from(&buf[offset..]).unwrap();
    assert_eq!((w, n), (0xDEAD_BEEF, 4));
    offset += n;
    let (q, n) = u64::decode_from(&buf[offset..]).unwrap();
    assert_eq!((q, n), (0x0123_4567_89AB_CDEF, 8));
    offset += n;
    let (t, n) = bool::decode_from(&buf[offset..]).unwrap();
    assert!(t);
    offset += n;
    let (f, n) = bool::decode_from(&buf[offset..]).unwrap();
    assert!(!f);
    offset += n;
    assert_eq!(offset, buf.len());
}

/// # Scenario
/// Byte strings and `String` carry a u32 length prefix.
#[test]
fn byte_strings_round_trip() {
    let bytes = vec![1u8, 2, 3, 4, 5];
    let encoded = encode_to_vec(&bytes).unwrap();
    assert_eq!(encoded.len(), 4 + 5);
    let (decoded, n) = Vec::<u8>::decode_from(&encoded).unwrap();
    assert_eq!(decoded, bytes);
    assert_eq!(n, encoded.len());

    let s = String::from("hello");
    let encoded = encode_to_vec(&s).unwrap();
    let (decoded, _) = String::decode_from(&encoded).unwrap();
    assert_eq!(decoded, s);
}

/// # Scenario
/// `Option<T>` uses a one-byte tag; sequences a u32 count.
#[test]
fn containers_round_trip() {
    let some: Option<u64> = Some(42);
    let none: Option<u64> = None;
    let (decoded, _) = Option::<u64>::decode_from(&encode_to_vec(&some).unwrap()).unwrap();
    assert_eq!(decoded, Some(42));
    let (decoded, _) = Option::<u64>::decode_from(&encode_to_vec(&none).unwrap()).unwrap();
    assert_eq!(decoded, None);

    let items: Vec<u64> = vec![1, 2, 3];
    let mut buf = Vec::new();
    encode_seq(&items, &mut buf).unwrap();
    let (decoded, n) = decode_seq::<u64>(&buf).unwrap();
    assert_eq!(decoded, items);
    assert_eq!(n, buf.len());
}

/// # Scenario
/// A truncated buffer yields `UnexpectedEof`, never a panic.
#[test]
fn truncated_input_is_an_error() {
    let err = u64::decode_from(&[1, 2, 3]).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));

    let mut buf = Vec::new();
    vec![0u8; 100].encode_to(&mut buf).unwrap();
    let err = Vec::<u8>::decode_from(&buf[..50]).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
}

/// # Scenario
/// Invalid bool bytes and unknown Option tags are rejected.
#[test]
fn invalid_tags_are_rejected() {
    let err = bool::decode_from(&[0x02]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidBool(0x02)));

    let err = Option::<u64>::decode_from(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidTag { .. }));
}
