use std::io::Cursor;

use atomkit::{find_atom, scan, PayloadKind, ScanOptions};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn boxed(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(8 + body.len() as u32).to_be_bytes());
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    out
}

fn versioned(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut full = vec![0u8; 4];
    full.extend_from_slice(body);
    boxed(tag, &full)
}

/// A movie with `tracks` audio tracks and a handful of metadata atoms.
fn synthetic_movie(tracks: usize) -> Vec<u8> {
    let mut ftyp_body = Vec::new();
    ftyp_body.extend_from_slice(b"M4A ");
    ftyp_body.extend_from_slice(&0u32.to_be_bytes());
    ftyp_body.extend_from_slice(b"isom");
    let mut file = boxed(b"ftyp", &ftyp_body);

    let mut moov_body = versioned(b"mvhd", &[0u8; 96]);
    for _ in 0..tracks {
        let stco = versioned(b"stco", &{
            let mut body = 16u32.to_be_bytes().to_vec();
            for i in 0..16u32 {
                body.extend_from_slice(&(4096 + i * 512).to_be_bytes());
            }
            body
        });
        let mut stbl_body = versioned(b"stsz", &[0u8; 8]);
        stbl_body.extend_from_slice(&stco);
        let stbl = boxed(b"stbl", &stbl_body);
        let minf = boxed(b"minf", &stbl);
        let mut mdia_body = versioned(b"mdhd", &[0u8; 20]);
        mdia_body.extend_from_slice(&minf);
        let mdia = boxed(b"mdia", &mdia_body);
        let mut trak_body = versioned(b"tkhd", &[0u8; 80]);
        trak_body.extend_from_slice(&mdia);
        moov_body.extend_from_slice(&boxed(b"trak", &trak_body));
    }

    let mut data_body = vec![0u8; 4];
    data_body.extend_from_slice(b"benchmark title");
    let mut data = vec![0, 0, 0, 1];
    data.extend_from_slice(&data_body);
    let name_box = boxed(b"\xA9nam", &boxed(b"data", &data));
    let ilst = boxed(b"ilst", &name_box);
    let mut meta_hdlr_body = vec![0u8; 4];
    meta_hdlr_body.extend_from_slice(b"mdir");
    meta_hdlr_body.extend_from_slice(b"appl");
    meta_hdlr_body.extend_from_slice(&[0u8; 10]);
    let mut meta_body = versioned(b"hdlr", &meta_hdlr_body);
    meta_body.extend_from_slice(&ilst);
    let meta = versioned(b"meta", &meta_body);
    moov_body.extend_from_slice(&boxed(b"udta", &meta));

    file.extend_from_slice(&boxed(b"moov", &moov_body));
    file.extend_from_slice(&boxed(b"free", &[0u8; 2040]));
    file.extend_from_slice(&boxed(b"mdat", &[0u8; 65536]));
    file
}

fn bench_scan(c: &mut Criterion) {
    let small = synthetic_movie(1);
    let large = synthetic_movie(24);

    c.bench_function("scan_single_track", |b| {
        b.iter(|| {
            let store = scan(
                &mut Cursor::new(black_box(&small)),
                ScanOptions::default(),
            )
            .unwrap();
            black_box(store.len())
        })
    });

    c.bench_function("scan_many_tracks", |b| {
        b.iter(|| {
            let store = scan(
                &mut Cursor::new(black_box(&large)),
                ScanOptions::default(),
            )
            .unwrap();
            black_box(store.len())
        })
    });
}

fn bench_resolve(c: &mut Criterion) {
    let bytes = synthetic_movie(24);
    let mut store = scan(&mut Cursor::new(&bytes), ScanOptions::default()).unwrap();

    c.bench_function("resolve_deep_path", |b| {
        b.iter(|| {
            black_box(find_atom(
                &mut store,
                black_box("moov.trak[12].mdia.minf.stbl.stco"),
                false,
                PayloadKind::Versioned,
                0,
                false,
            ))
        })
    });
}

criterion_group!(benches, bench_scan, bench_resolve);
criterion_main!(benches);
