//! Fuzz target for the streaming packet decoder
//!
//! Feeds arbitrary bytes in arbitrary chunk sizes and checks that the decoder:
//! - never panics
//! - yields the same packets regardless of chunking
//! - re-encodes every packet to the bytes it consumed

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pitaya_proto::{Packet, PacketDecoder};

#[derive(Debug, Arbitrary)]
struct Input {
    data: Vec<u8>,
    chunks: Vec<u8>,
}

fn decode_all(data: &[u8], chunks: &[u8]) -> (Vec<Packet>, bool) {
    let mut decoder = PacketDecoder::new();
    let mut packets = Vec::new();
    let mut offset = 0;
    let mut sizes = chunks.iter().map(|c| usize::from(*c).max(1)).cycle();

    while offset < data.len() {
        let size = if chunks.is_empty() { data.len() } else { sizes.next().unwrap_or(1) };
        let end = (offset + size).min(data.len());
        decoder.extend(&data[offset..end]);
        offset = end;

        loop {
            match decoder.next_packet() {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => break,
                Err(_) => return (packets, true),
            }
        }
    }
    (packets, false)
}

fuzz_target!(|input: Input| {
    let (whole, whole_failed) = decode_all(&input.data, &[]);
    let (chunked, chunked_failed) = decode_all(&input.data, &input.chunks);

    assert_eq!(whole_failed, chunked_failed);
    assert_eq!(whole, chunked);

    let mut consumed = 0;
    for packet in &whole {
        let bytes = packet.to_bytes().expect("decoded packet must re-encode");
        assert_eq!(&input.data[consumed..consumed + bytes.len()], &bytes[..]);
        consumed += bytes.len();
    }
});
