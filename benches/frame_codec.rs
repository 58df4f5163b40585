use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use perilink::core::{FirmwareConfig, ModuleKind};
use perilink::hal::SimulatedBoard;
use perilink::modules::{stepper, system};
use perilink::protocol::{decode_command, encode_command, CommandEnvelope};
use perilink::transport::MemoryTransport;
use perilink::Firmware;

fn bench_decode_command(c: &mut Criterion) {
    c.bench_function("decode_command", |b| {
        let command = CommandEnvelope::to(ModuleKind::Stepper, stepper::cmd::START)
            .with_unit(1)
            .with_args(4000i32.to_le_bytes().to_vec());
        let mut frame = BytesMut::new();
        encode_command(&command, &mut frame);

        b.iter(|| decode_command(black_box(&frame), 64));
    });
}

fn bench_encode_command(c: &mut Criterion) {
    c.bench_function("encode_command", |b| {
        let command = CommandEnvelope::to(ModuleKind::System, system::cmd::PING_BACK).with_args(vec![0x55; 32]);
        let mut frame = BytesMut::with_capacity(64);

        b.iter(|| {
            frame.clear();
            encode_command(black_box(&command), &mut frame);
        });
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let (_host, device) = MemoryTransport::pair();
    let mut firmware = match Firmware::new(FirmwareConfig::default(), SimulatedBoard::new(20), device) {
        Ok(firmware) => firmware,
        Err(e) => panic!("firmware setup failed: {}", e),
    };
    let command = CommandEnvelope::to(ModuleKind::System, system::cmd::GET_VERSION);

    c.bench_function("dispatch_get_version", |b| {
        b.iter(|| firmware.dispatch(black_box(&command)));
    });
}

criterion_group!(benches, bench_decode_command, bench_encode_command, bench_dispatch);
criterion_main!(benches);
