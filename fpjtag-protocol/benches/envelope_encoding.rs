use std::hint::black_box;
use std::io::Cursor;

use criterion::{Criterion, criterion_group, criterion_main};
use fpjtag_protocol::codec::MAX_FRAME_SIZE;
use fpjtag_protocol::tap::{Register, TapState};
use fpjtag_protocol::{Operation, Request, ScanCommand, ScanField};

fn scan_request(num_bits: u32) -> Request {
    let output = vec![0xa5; num_bits.div_ceil(8) as usize];
    Request::Execute(Operation::Scan(ScanCommand {
        register: Register::Data,
        end_state: TapState::Idle,
        fields: vec![ScanField::exchange(num_bits, &output)],
    }))
}

fn encoding(c: &mut Criterion) {
    let request = scan_request(4096);
    c.bench_function("encode scan 4096 bits", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(16 * 1024);
            black_box(&request).write_to(&mut out).unwrap();
            out
        })
    });

    let mut encoded = Vec::new();
    request.write_to(&mut encoded).unwrap();
    c.bench_function("decode scan 4096 bits", |b| {
        b.iter(|| {
            let mut cursor = Cursor::new(black_box(&encoded[..]));
            Request::from_reader(&mut cursor, MAX_FRAME_SIZE).unwrap()
        })
    });
}

criterion_group!(benches, encoding);
criterion_main!(benches);
