use crate::encoding::{
    self, Decode, Encode, EncodingError, MAX_BYTE_LEN, decode_from_slice, decode_vec,
    encode_to_vec, encode_vec,
};

#[test]
fn test_unsigned_roundtrip() {
    for v in [0u8, 1, 0x7F, 0xFF] {
        let bytes = encode_to_vec(&v).unwrap();
        assert_eq!(bytes.len(), 1);
        let (back, n) = u8::decode_from(&bytes).unwrap();
        assert_eq!((back, n), (v, 1));
    }

    for v in [0u16, 1, 0xBEEF, u16::MAX] {
        let bytes = encode_to_vec(&v).unwrap();
        assert_eq!(bytes, v.to_le_bytes());
        let (back, _) = u16::decode_from(&bytes).unwrap();
        assert_eq!(back, v);
    }

    for v in [0u32, 42, 0xDEAD_BEEF, u32::MAX] {
        let bytes = encode_to_vec(&v).unwrap();
        assert_eq!(bytes, v.to_le_bytes());
        let (back, _) = u32::decode_from(&bytes).unwrap();
        assert_eq!(back, v);
    }

    for v in [0u64, 1 << 40, u64::MAX] {
        let bytes = encode_to_vec(&v).unwrap();
        assert_eq!(bytes, v.to_le_bytes());
        let (back, _) = u64::decode_from(&bytes).unwrap();
        assert_eq!(back, v);
    }
}

#[test]
fn test_bool_rejects_garbage() {
    assert!(bool::decode_from(&[0]).unwrap().0 == false);
    assert!(bool::decode_from(&[1]).unwrap().0 == true);
    assert!(matches!(
        bool::decode_from(&[2]),
        Err(EncodingError::InvalidBool(2))
    ));
}

#[test]
fn test_bytes_and_string_roundtrip() {
    let data = b"hello \x00 world".to_vec();
    let bytes = encode_to_vec(&data).unwrap();
    assert_eq!(&bytes[..4], &(data.len() as u32).to_le_bytes());
    let (back, consumed) = Vec::<u8>::decode_from(&bytes).unwrap();
    assert_eq!(back, data);
    assert_eq!(consumed, bytes.len());

    let s = String::from("akkaradb");
    let bytes = encode_to_vec(&s).unwrap();
    let (back, _) = String::decode_from(&bytes).unwrap();
    assert_eq!(back, s);
}

#[test]
fn test_string_rejects_bad_utf8() {
    let mut buf = Vec::new();
    vec![0xFFu8, 0xFE].encode_to(&mut buf).unwrap();
    assert!(matches!(
        String::decode_from(&buf),
        Err(EncodingError::InvalidUtf8(_))
    ));
}

#[test]
fn test_truncated_input_is_eof_not_panic() {
    assert!(matches!(
        u64::decode_from(&[1, 2, 3]),
        Err(EncodingError::UnexpectedEof { .. })
    ));

    // Length prefix promises more bytes than the buffer holds.
    let mut buf = Vec::new();
    b"abcdef".to_vec().encode_to(&mut buf).unwrap();
    buf.truncate(6);
    assert!(matches!(
        Vec::<u8>::decode_from(&buf),
        Err(EncodingError::UnexpectedEof { .. })
    ));
}

#[test]
fn test_oversized_length_rejected() {
    let mut buf = (MAX_BYTE_LEN + 1).to_le_bytes().to_vec();
    buf.extend_from_slice(&[0u8; 16]);
    assert!(matches!(
        Vec::<u8>::decode_from(&buf),
        Err(EncodingError::LengthOverflow(_))
    ));
}

#[test]
fn test_vec_of_structs_roundtrip() {
    let items: Vec<u64> = vec![3, 1, 4, 1, 5, 9, 2, 6];
    let mut buf = Vec::new();
    encode_vec(&items, &mut buf).unwrap();
    let (back, consumed) = decode_vec::<u64>(&buf).unwrap();
    assert_eq!(back, items);
    assert_eq!(consumed, buf.len());
}

#[test]
fn test_fixed_array_has_no_prefix() {
    let arr = *b"AKSS";
    let bytes = encode_to_vec(&arr).unwrap();
    assert_eq!(bytes, b"AKSS");
    let (back, n) = <[u8; 4]>::decode_from(&bytes).unwrap();
    assert_eq!((back, n), (arr, 4));
}

#[test]
fn test_multi_value_cursor_advance() {
    let mut buf = Vec::new();
    7u32.encode_to(&mut buf).unwrap();
    b"key".as_slice().encode_to(&mut buf).unwrap();
    true.encode_to(&mut buf).unwrap();

    let mut off = 0;
    let (a, n) = u32::decode_from(&buf[off..]).unwrap();
    off += n;
    let (b, n): (Vec<u8>, usize) = decode_from_slice(&buf[off..]).unwrap();
    off += n;
    let (c, n) = bool::decode_from(&buf[off..]).unwrap();
    off += n;

    assert_eq!(a, 7);
    assert_eq!(b, b"key");
    assert!(c);
    assert_eq!(off, buf.len());

    // helper: encoding module is self-consistent
    let again = encoding::encode_to_vec(&7u32).unwrap();
    assert_eq!(again, 7u32.to_le_bytes());
}
