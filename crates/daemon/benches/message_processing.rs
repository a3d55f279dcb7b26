//! Benchmarks for the per-frame hot paths:
//! - decoding client frames
//! - encoding output frames
//! - UTF-8 stream decoding of process output
//! - the bounded process event channel

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::{FrameCodec, ServerMessage, Utf8StreamDecoder};

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    let codec = FrameCodec::new();

    let keystroke = r#"{"type":"input","data":"a"}"#;
    group.throughput(Throughput::Bytes(keystroke.len() as u64));
    group.bench_function("input_keystroke", |b| {
        b.iter(|| codec.decode(black_box(keystroke)).unwrap());
    });

    let paste = format!(
        r#"{{"type":"input","data":"{}"}}"#,
        "x".repeat(4096)
    );
    group.throughput(Throughput::Bytes(paste.len() as u64));
    group.bench_function("input_paste_4KB", |b| {
        b.iter(|| codec.decode(black_box(&paste)).unwrap());
    });

    let resize = r#"{"type":"resize","cols":120,"rows":40}"#;
    group.throughput(Throughput::Bytes(resize.len() as u64));
    group.bench_function("resize", |b| {
        b.iter(|| codec.decode(black_box(resize)).unwrap());
    });

    group.finish();
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    let codec = FrameCodec::new();

    let plain = ServerMessage::output("y".repeat(4096));
    group.throughput(Throughput::Bytes(4096));
    group.bench_function("output_plain_4KB", |b| {
        b.iter(|| codec.encode(black_box(&plain)).unwrap());
    });

    // Escape sequences and control bytes force JSON escaping.
    let colored = ServerMessage::output("\x1b[1;32mok\x1b[0m\r\n".repeat(256));
    group.bench_function("output_ansi_escaped", |b| {
        b.iter(|| codec.encode(black_box(&colored)).unwrap());
    });

    group.finish();
}

fn bench_utf8_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8_stream");

    let ascii = vec![b'a'; 4096];
    group.throughput(Throughput::Bytes(ascii.len() as u64));
    group.bench_function("ascii_4KB", |b| {
        let mut decoder = Utf8StreamDecoder::new();
        b.iter(|| decoder.decode(black_box(&ascii)));
    });

    // 4096 is not a multiple of 3, so every chunk splits a character.
    let text = "€".repeat(2048);
    let bytes = text.as_bytes();
    let chunks: Vec<&[u8]> = bytes.chunks(4096).collect();
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("multibyte_split_chunks", |b| {
        b.iter(|| {
            let mut decoder = Utf8StreamDecoder::new();
            let mut total = 0;
            for chunk in &chunks {
                total += decoder.decode(black_box(chunk)).len();
            }
            total + decoder.finish().len()
        });
    });

    group.finish();
}

fn bench_event_channel(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_channel");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    group.throughput(Throughput::Bytes(4096));
    group.bench_function("bounded_send_recv_4KB", |b| {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);
        let data = vec![0u8; 4096];
        b.iter(|| {
            runtime.block_on(async {
                tx.send(black_box(data.clone())).await.unwrap();
                black_box(rx.recv().await.unwrap())
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_decode,
    bench_frame_encode,
    bench_utf8_stream,
    bench_event_channel,
);

criterion_main!(benches);
