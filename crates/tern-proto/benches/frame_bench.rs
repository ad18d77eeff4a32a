use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tern_proto::frame::{FileId, FileOffer, Frame, MAX_FRAME_SIZE};

fn sample_offer() -> Frame {
    Frame::File(FileOffer {
        id: FileId {
            name: "20savage.zip".to_string(),
            size: 1_048_576,
            mtime: 1_700_000_000,
        },
        offset: 0,
        crc: 0xcafe_f00d,
        flags: Vec::new(),
    })
}

fn bench_data_encode(c: &mut Criterion) {
    let frame = Frame::Data(vec![0xABu8; 1024]);

    c.bench_function("data_encode_1kb", |b| {
        b.iter(|| black_box(frame.encode().unwrap()));
    });
}

fn bench_data_parse(c: &mut Criterion) {
    let encoded = Frame::Data(vec![0xABu8; 1024]).encode().unwrap();

    c.bench_function("data_parse_1kb", |b| {
        b.iter(|| black_box(Frame::parse(&encoded).unwrap()));
    });
}

fn bench_data_max_frame(c: &mut Criterion) {
    let frame = Frame::Data(vec![0xABu8; MAX_FRAME_SIZE]);

    c.bench_function("data_encode_max", |b| {
        b.iter(|| black_box(frame.encode().unwrap()));
    });
}

fn bench_file_encode(c: &mut Criterion) {
    let frame = sample_offer();

    c.bench_function("file_encode", |b| {
        b.iter(|| black_box(frame.encode().unwrap()));
    });
}

fn bench_file_parse(c: &mut Criterion) {
    let encoded = sample_offer().encode().unwrap();

    c.bench_function("file_parse", |b| {
        b.iter(|| black_box(Frame::parse(&encoded).unwrap()));
    });
}

fn bench_adr_parse(c: &mut Criterion) {
    let frame = Frame::Adr(
        ["21:1/100@fsxnet", "21:1/3@fsxnet", "21:1/2@fsxnet"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect(),
    );
    let encoded = frame.encode().unwrap();

    c.bench_function("adr_parse", |b| {
        b.iter(|| black_box(Frame::parse(&encoded).unwrap()));
    });
}

fn bench_nul_roundtrip(c: &mut Criterion) {
    let frame = Frame::Nul("SYS Twenty Minutes To Savage".to_string());

    c.bench_function("nul_roundtrip", |b| {
        b.iter(|| {
            let bytes = frame.encode().unwrap();
            black_box(Frame::parse(&bytes).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_data_encode,
    bench_data_parse,
    bench_data_max_frame,
    bench_file_encode,
    bench_file_parse,
    bench_adr_parse,
    bench_nul_roundtrip,
);
criterion_main!(benches);
