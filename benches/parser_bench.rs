//! Mirra 热路径基准测试.
//!
//! 覆盖 Annex B 分割、防竞争字节处理、SPS 解析与 CPU 像素转换.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mirra::codec::h264::{
    add_emulation_prevention, parse_annex_b, parse_sps, remove_emulation_prevention,
};
use mirra::scale::{ColorSpec, YuvLayout, YuvPlanes, yuv_to_rgba};

const SPS_RBSP: [u8; 7] = [0x42, 0x00, 0x1E, 0xED, 0x02, 0x83, 0xF2];

/// 构造 `count` 个带起始码的 slice NAL, 载荷含需要转义的零字节
fn make_stream(count: usize, payload_len: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..payload_len)
        .map(|i| if i % 97 == 0 { 0 } else { (i % 251) as u8 })
        .collect();
    let escaped = add_emulation_prevention(&payload);
    let mut data = Vec::with_capacity(count * (escaped.len() + 5));
    for i in 0..count {
        data.extend_from_slice(&[0, 0, 0, 1, if i % 30 == 0 { 0x65 } else { 0x41 }]);
        data.extend_from_slice(&escaped);
    }
    data
}

fn bench_annex_b_split(c: &mut Criterion) {
    let data = make_stream(300, 4096);
    c.bench_function("annex_b_split_300_nals", |b| {
        b.iter(|| parse_annex_b(black_box(&data)).len());
    });
}

fn bench_emulation_prevention(c: &mut Criterion) {
    let payload: Vec<u8> = (0..64 * 1024).map(|i| if i % 3 == 0 { 0 } else { 1 }).collect();
    let escaped = add_emulation_prevention(&payload);
    c.bench_function("epb_add_64k", |b| {
        b.iter(|| add_emulation_prevention(black_box(&payload)));
    });
    c.bench_function("epb_remove_64k", |b| {
        b.iter(|| remove_emulation_prevention(black_box(&escaped)));
    });
}

fn bench_sps_parse(c: &mut Criterion) {
    c.bench_function("sps_parse_baseline", |b| {
        b.iter(|| parse_sps(black_box(&SPS_RBSP)).map(|sps| sps.width()));
    });
}

fn bench_nv12_to_rgba(c: &mut Criterion) {
    let (w, h) = (1920usize, 1080usize);
    let luma = vec![128u8; w * h];
    let chroma = vec![96u8; w * h / 2];
    let mut dst = vec![0u8; w * h * 4];
    c.bench_function("nv12_to_rgba_1080p", |b| {
        b.iter(|| {
            let src = YuvPlanes {
                layout: YuvLayout::Nv12,
                width: w as u32,
                height: h as u32,
                planes: vec![luma.as_slice(), chroma.as_slice()],
                strides: vec![w, w],
            };
            yuv_to_rgba(&src, ColorSpec::default(), black_box(&mut dst), w * 4)
        });
    });
}

criterion_group!(
    benches,
    bench_annex_b_split,
    bench_emulation_prevention,
    bench_sps_parse,
    bench_nv12_to_rgba
);
criterion_main!(benches);
