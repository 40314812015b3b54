//! Frame codec scenarios over the public API

use bytes::Bytes;
use gimbalcam::codec::{fragment, Packet, PacketTrailer, Reassembler, TRAILER_SIZE};

fn feed(reassembler: &mut Reassembler, packets: &[Packet]) -> Vec<Bytes> {
    let mut yielded = Vec::new();
    for packet in packets {
        if let Ok(Some(blob)) = reassembler.push(packet.clone()) {
            yielded.push(blob);
        }
    }
    yielded
}

/// Walk packets through their actual wire encoding before feeding them back.
fn over_the_wire(packets: &[Packet]) -> Vec<Packet> {
    packets
        .iter()
        .map(|p| Packet::from_bytes(p.to_bytes()).expect("wire packet parses back"))
        .collect()
}

#[test]
fn small_blob_single_packet() {
    let packets = fragment(Bytes::from_static(b"hello"), 14).unwrap();
    assert_eq!(packets.len(), 1);

    let wire = packets[0].to_bytes();
    assert_eq!(wire.len(), 14);
    assert_eq!(&wire[..5], b"hello");
    // trailer: some salt, then total-1 = 000 and index = 000
    assert_eq!(&wire[8..], b"000000");

    let mut reassembler = Reassembler::new();
    let yielded = feed(&mut reassembler, &over_the_wire(&packets));
    assert_eq!(yielded, vec![Bytes::from_static(b"hello")]);
}

#[test]
fn three_packet_blob_any_permutation() {
    let blob = Bytes::from_static(b"0123456789abc");
    let packets = fragment(blob.clone(), 14).unwrap();
    assert_eq!(packets.len(), 3);
    for packet in &packets {
        assert_eq!(packet.trailer.total, 3);
    }

    let permutations: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    for order in permutations {
        let shuffled: Vec<Packet> = order.iter().map(|&i| packets[i].clone()).collect();
        let mut reassembler = Reassembler::new();
        let yielded = feed(&mut reassembler, &over_the_wire(&shuffled));
        assert_eq!(yielded, vec![blob.clone()], "order {order:?}");
    }
}

#[test]
fn interleaved_blobs_both_complete() {
    let b1 = Bytes::from(vec![b'A'; 20]);
    let b2 = Bytes::from(vec![b'Z'; 20]);

    let p1 = fragment(b1.clone(), 14).unwrap();
    let mut p2 = fragment(b2.clone(), 14).unwrap();
    if p2[0].trailer.salt == p1[0].trailer.salt {
        let salt = (p2[0].trailer.salt + 1) % 1000;
        for packet in &mut p2 {
            packet.trailer.salt = salt;
        }
    }

    let interleaved = vec![
        p1[0].clone(),
        p2[0].clone(),
        p1[2].clone(),
        p2[1].clone(),
        p2[2].clone(),
        p1[1].clone(),
        p1[3].clone(),
        p2[3].clone(),
    ];

    let mut reassembler = Reassembler::new();
    let yielded = feed(&mut reassembler, &over_the_wire(&interleaved));

    assert_eq!(yielded.len(), 2);
    assert!(yielded.contains(&b1));
    assert!(yielded.contains(&b2));
}

#[test]
fn roundtrip_across_sizes_and_orders() {
    // includes the smallest legal packet size (one payload byte) and an
    // empty blob
    for (len, max_size) in [(0, 14), (1, 10), (5, 10), (100, 14), (4096, 64), (9999, 1024)] {
        let blob: Bytes = (0..len).map(|i| (i % 256) as u8).collect::<Vec<_>>().into();
        let packets = fragment(blob.clone(), max_size).unwrap();

        // reversed delivery, every packet duplicated except the one that
        // completes the frame (a duplicate after completion is a legitimate
        // fresh frame to the receiver)
        let reversed: Vec<Packet> = packets.iter().rev().cloned().collect();
        let mut delivery = Vec::new();
        for (i, packet) in reversed.iter().enumerate() {
            delivery.push(packet.clone());
            if i + 1 != reversed.len() {
                delivery.push(packet.clone());
            }
        }

        let mut reassembler = Reassembler::new();
        let yielded = feed(&mut reassembler, &over_the_wire(&delivery));
        assert_eq!(yielded, vec![blob], "len {len} max {max_size}");
        assert_eq!(reassembler.pending(), 0);
    }
}

#[test]
fn any_proper_subset_yields_nothing() {
    let blob: Bytes = (0..50u8).collect::<Vec<_>>().into();
    let packets = fragment(blob, 14).unwrap();
    assert_eq!(packets.len(), 10);

    for skipped in 0..packets.len() {
        let subset: Vec<Packet> = packets
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skipped)
            .map(|(_, p)| p.clone())
            .collect();

        let mut reassembler = Reassembler::new();
        let yielded = feed(&mut reassembler, &subset);
        assert!(yielded.is_empty(), "skipping packet {skipped}");
        assert!(reassembler.pending() <= 8);
    }
}

#[test]
fn trailer_parses_back_for_all_salts_and_totals() {
    for salt in 0..=999u16 {
        let trailer = PacketTrailer {
            salt,
            total: 1,
            index: 0,
        };
        assert_eq!(PacketTrailer::from_bytes(&trailer.to_bytes()), Some(trailer));
    }

    for total in 1..=1000u16 {
        let trailer = PacketTrailer {
            salt: 123,
            total,
            index: total - 1,
        };
        assert_eq!(PacketTrailer::from_bytes(&trailer.to_bytes()), Some(trailer));
    }
}

#[test]
fn payload_room_is_packet_size_minus_trailer() {
    let blob = Bytes::from(vec![7u8; 1000]);
    let packets = fragment(blob, 1024).unwrap();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].to_bytes().len(), 1000 + TRAILER_SIZE);
}
