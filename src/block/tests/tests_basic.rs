use crate::block::{
    self, AkHdr32, BLOCK_PAYLOAD_MAX, BLOCK_SIZE, BlockPacker, FLAG_TOMBSTONE, HDR_SIZE,
    decode_record, encode_record_into, key_fp64, mini_key,
};
use std::hash::Hasher;

fn append(packer: &mut BlockPacker, key: &[u8], value: &[u8], seq: u64, flags: u8) -> bool {
    packer.append(key, value, seq, flags, key_fp64(key), mini_key(key))
}

#[test]
fn test_header_layout_roundtrip() {
    let hdr = AkHdr32 {
        k_len: 3,
        v_len: 5,
        seq: 42,
        flags: FLAG_TOMBSTONE,
        key_fp64: 0x0123_4567_89AB_CDEF,
        mini_key: mini_key(b"abc"),
    };

    let mut buf = [0u8; HDR_SIZE];
    hdr.write_to(&mut buf);

    // Field offsets are part of the on-disk format.
    assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 3);
    assert_eq!(u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]), 5);
    assert_eq!(u64::from_le_bytes(buf[6..14].try_into().unwrap()), 42);
    assert_eq!(buf[14], FLAG_TOMBSTONE);
    assert_eq!(buf[15], 0);

    let back = AkHdr32::read_from(&buf).unwrap();
    assert_eq!(back, hdr);
    assert!(back.is_tombstone());
}

#[test]
fn test_mini_key_le_zero_padded() {
    assert_eq!(mini_key(b""), 0);
    assert_eq!(mini_key(b"a"), 0x61);
    assert_eq!(mini_key(b"ab"), 0x6261);
    assert_eq!(
        mini_key(b"abcdefgh"),
        u64::from_le_bytes(*b"abcdefgh")
    );
    // Bytes past the eighth do not participate.
    assert_eq!(mini_key(b"abcdefghZZZZ"), mini_key(b"abcdefgh"));
}

#[test]
fn test_key_fp64_is_siphash24_with_fixed_seed() {
    // Deterministic across calls and distinct across keys.
    assert_eq!(key_fp64(b"k1"), key_fp64(b"k1"));
    assert_ne!(key_fp64(b"k1"), key_fp64(b"k2"));

    // Matches a direct SipHash-2-4 computation under the same seed: the
    // fingerprint is the hash, not a derivative of it.
    let mut h = siphasher::sip::SipHasher24::new_with_keys(
        0x416B_6B61_7261_4442,
        0x6C61_6E65_5F66_7036,
    );
    h.write(b"k1");
    assert_eq!(key_fp64(b"k1"), h.finish());
}

#[test]
fn test_record_encode_decode_roundtrip() {
    let mut buf = Vec::new();
    encode_record_into(
        &mut buf,
        b"key",
        b"value",
        7,
        0,
        key_fp64(b"key"),
        mini_key(b"key"),
    );
    assert_eq!(buf.len(), HDR_SIZE + 3 + 5);

    let (rec, consumed) = decode_record(&buf).unwrap();
    assert_eq!(consumed, buf.len());
    assert_eq!(rec.key, b"key");
    assert_eq!(rec.value, b"value");
    assert_eq!(rec.seq, 7);
    assert!(!rec.is_tombstone());
}

#[test]
fn test_pack_seal_unpack_roundtrip() {
    let mut packer = BlockPacker::new();
    assert!(packer.is_empty());

    assert!(append(&mut packer, b"alpha", b"1", 1, 0));
    assert!(append(&mut packer, b"beta", b"", 2, FLAG_TOMBSTONE));
    assert!(append(&mut packer, b"gamma", &vec![0xAB; 100], 3, 0));

    let sealed = packer.seal();
    assert_eq!(sealed.len(), BLOCK_SIZE);
    assert!(packer.is_empty());

    let views: Vec<_> = block::unpack(&sealed)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(views.len(), 3);

    assert_eq!(views[0].key, b"alpha");
    assert_eq!(views[0].value, b"1");
    assert_eq!(views[0].header.seq, 1);

    assert!(views[1].is_tombstone());
    assert_eq!(views[1].value, b"");

    assert_eq!(views[2].value, vec![0xAB; 100]);
    assert_eq!(views[2].header.key_fp64, key_fp64(b"gamma"));
    assert_eq!(views[2].header.mini_key, mini_key(b"gamma"));
}

#[test]
fn test_append_refuses_when_full() {
    let mut packer = BlockPacker::new();

    // One record that nearly fills the payload region.
    let big = vec![0x42u8; BLOCK_PAYLOAD_MAX - HDR_SIZE - 1 - 64];
    assert!(append(&mut packer, b"k", &big, 1, 0));

    // The next record does not fit; the packer must refuse, not truncate.
    assert!(!append(&mut packer, b"k2", &vec![0u8; 128], 2, 0));
    assert_eq!(packer.record_count(), 1);

    // After sealing, the refused record fits a fresh block.
    let _ = packer.seal();
    assert!(append(&mut packer, b"k2", &vec![0u8; 128], 2, 0));
}

#[test]
fn test_exact_fit_boundary() {
    let mut packer = BlockPacker::new();

    // 32 + kLen + vLen exactly equals the payload budget.
    let value = vec![1u8; BLOCK_PAYLOAD_MAX - HDR_SIZE - 8];
    assert!(append(&mut packer, b"frontier", &value, 9, 0));
    assert_eq!(packer.payload_len(), BLOCK_PAYLOAD_MAX);

    // Not even an empty record fits now.
    assert!(!append(&mut packer, b"", b"", 10, 0));

    let sealed = packer.seal();
    let views: Vec<_> = block::unpack(&sealed)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].header.seq, 9);
    assert_eq!(views[0].value.len(), value.len());
}

#[test]
fn test_empty_block_unpacks_to_nothing() {
    let blk = block::empty_block();
    assert_eq!(blk.len(), BLOCK_SIZE);
    assert!(block::verify(&blk));
    assert_eq!(block::unpack(&blk).unwrap().count(), 0);
}

#[test]
fn test_sealed_blocks_are_deterministic() {
    let build = || {
        let mut p = BlockPacker::new();
        append(&mut p, b"a", b"1", 1, 0);
        append(&mut p, b"b", b"2", 2, 0);
        p.seal()
    };
    assert_eq!(build(), build());
}
