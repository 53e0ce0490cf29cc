//! Cross-checks decoded instruction length against `iced-x86`, a proven
//! third-party x86 decoder, for a handful of concrete encodings (spec.md P10
//! style golden-oracle coverage). Never used from non-test code.

use cfg_decoder::{Parser, SliceBytes};
use cfg_types::SegmentedAddress;
use iced_x86::{Decoder, DecoderOptions};

fn assert_same_length(bytes: &[u8]) {
    let addr = SegmentedAddress::new(0, 0);
    let src = SliceBytes::new(addr, bytes);
    let ours = Parser::parse(&src, addr).unwrap();

    let mut iced = Decoder::with_ip(16, bytes, 0, DecoderOptions::NONE);
    let theirs = iced.decode();

    assert_eq!(
        ours.length as u32,
        theirs.len() as u32,
        "length mismatch for {bytes:02x?}: ours={} iced={}",
        ours.length,
        theirs.len()
    );
}

#[test]
fn nop_matches_iced() {
    assert_same_length(&[0x90]);
}

#[test]
fn hlt_matches_iced() {
    assert_same_length(&[0xF4]);
}

#[test]
fn mov_ax_imm16_matches_iced() {
    assert_same_length(&[0xB8, 0x34, 0x12]);
}

#[test]
fn add_al_imm8_matches_iced() {
    assert_same_length(&[0x04, 0x12]);
}

#[test]
fn call_near_rel16_matches_iced() {
    assert_same_length(&[0xE8, 0x34, 0x12]);
}

#[test]
fn prefixed_mov_reg_imm_matches_iced() {
    assert_same_length(&[0x66, 0xB8, 0x01, 0x00, 0x00, 0x00]);
}
