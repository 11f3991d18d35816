//! Benchmarks for DNS wire parsing.
//!
//! Run with: cargo bench

use std::net::Ipv4Addr;

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::{Rng, SeedableRng, rngs::StdRng};

use dnsmonitor::dns::DnsMessage;

fn create_dns_query(query_id: u16, domain: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    // Header (12 bytes)
    packet.extend_from_slice(&query_id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query
    packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    packet.extend_from_slice(&[0x00, 0x00]); // Answer RRs: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Authority RRs: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Additional RRs: 0

    // Question section
    for label in domain.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00); // Root label

    packet.extend_from_slice(&[0x00, 0x01]); // Type: A
    packet.extend_from_slice(&[0x00, 0x01]); // Class: IN

    packet
}

/// Response with `count` compressed A answers pointing at the question.
fn create_dns_response(query_id: u16, domain: &str, count: u8) -> Vec<u8> {
    let mut packet = create_dns_query(query_id, domain);
    packet[2] = 0x81;
    packet[3] = 0x80;
    packet[7] = count;

    for i in 0..count {
        packet.extend_from_slice(&[0xC0, 0x0C]); // Pointer to question name
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x04]);
        packet.extend_from_slice(&Ipv4Addr::new(10, 0, 0, i).octets());
    }

    packet
}

fn bench_parse_query(c: &mut Criterion) {
    let query = create_dns_query(0x1234, "subdomain.example.domain.com");

    c.bench_function("parse_query", |b| {
        b.iter(|| DnsMessage::parse(black_box(&query)))
    });
}

fn bench_parse_response(c: &mut Criterion) {
    let response = create_dns_response(0x1234, "example.com", 8);

    c.bench_function("parse_response_8_answers", |b| {
        b.iter(|| DnsMessage::parse(black_box(&response)))
    });
}

fn bench_parse_corrupt(c: &mut Criterion) {
    let base = create_dns_response(0x1234, "example.com", 8);
    let mut rng = StdRng::seed_from_u64(7);
    let packets: Vec<Vec<u8>> = (0..1000)
        .map(|_| {
            let mut packet = base.clone();
            let i = rng.random_range(0..packet.len());
            packet[i] = rng.random();
            packet
        })
        .collect();

    let mut group = c.benchmark_group("throughput");
    group.throughput(Throughput::Elements(packets.len() as u64));

    group.bench_function("parse_1000_corrupt_responses", |b| {
        b.iter(|| {
            for packet in &packets {
                let _ = black_box(DnsMessage::parse(packet));
            }
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parse_query,
    bench_parse_response,
    bench_parse_corrupt,
);

criterion_main!(benches);
