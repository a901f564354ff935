use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tipcal::nalgebra::Matrix3;
use tipcal::synthetic::{SimConfig, SimRig};
use tipcal::{Calibrator, ImageView, Progress, Template, VisionMatcher, ZnccMatcher};

fn make_image(width: usize, height: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let value = ((x * 13) ^ (y * 7) ^ (x * y)) & 0xFF;
            data.push(value as u8);
        }
    }
    data
}

fn extract_patch(
    image: &[u8],
    img_width: usize,
    x0: usize,
    y0: usize,
    width: usize,
    height: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(width * height);
    for y in 0..height {
        let row = (y0 + y) * img_width;
        for x in 0..width {
            out.push(image[row + x0 + x]);
        }
    }
    out
}

fn bench_locate(c: &mut Criterion) {
    let img_width = 320;
    let img_height = 240;
    let image = make_image(img_width, img_height);
    let image_view = ImageView::from_slice(&image, img_width, img_height).unwrap();

    let tpl_width = 40;
    let tpl_height = 30;
    let tpl_data = extract_patch(&image, img_width, 140, 105, tpl_width, tpl_height);
    let template = Template::new(tpl_data, tpl_width, tpl_height).unwrap();
    let mut matcher = ZnccMatcher::new();

    c.bench_function("zncc_locate_320x240", |b| {
        b.iter(|| black_box(matcher.locate(image_view, &template).unwrap()));
    });

    let (zone, _) = image_view.central_zone(0.1875).unwrap();
    let small = Template::new(extract_patch(&image, img_width, 150, 112, 12, 9), 12, 9).unwrap();
    c.bench_function("zncc_locate_central_zone", |b| {
        b.iter(|| black_box(matcher.locate(zone, &small).unwrap()));
    });
}

fn bench_calibration(c: &mut Criterion) {
    let jacobian = Matrix3::new(
        0.9, 0.1, 0.05, //
        -0.2, 1.1, 0.0, //
        0.1, 0.3, 1.0,
    );
    c.bench_function("simulated_calibration", |b| {
        b.iter(|| {
            let mut sim = SimRig::new(SimConfig {
                jacobian,
                noise_px: 0.3,
                ..SimConfig::default()
            });
            let mut calibrator = Calibrator::default();
            calibrator.begin_calibration();
            while calibrator.tick(&mut sim.rig()).unwrap() != Progress::Calibrated {}
            black_box(calibrator.status())
        });
    });
}

criterion_group!(benches, bench_locate, bench_calibration);
criterion_main!(benches);
