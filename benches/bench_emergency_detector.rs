// benches/bench_emergency_detector.rs

use criterion::{
    black_box, criterion_group, criterion_main, AxisScale, Criterion, PlotConfiguration,
};
use signal_control::data_structures::ColorSample;
use signal_control::sensors::EmergencyDetector;
use std::time::Duration;

fn flasher_window(size: usize) -> Vec<ColorSample> {
    (0..size)
        .map(|i| {
            if i % 2 == 0 {
                ColorSample::new(240.0, 30.0)
            } else {
                ColorSample::new(30.0, 240.0)
            }
        })
        .collect()
}

fn bench_detect(c: &mut Criterion) {
    let mut group = c.benchmark_group("emergency_detect");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));
    group.plot_config(PlotConfiguration::default().summary_scale(AxisScale::Linear));

    let detector = EmergencyDetector::new(200.0, 40.0);
    // Window sizes in frames.
    for &size in [15, 60, 240].iter() {
        let window = flasher_window(size);
        group.bench_function(format!("window_{}", size), |b| {
            b.iter(|| black_box(detector.detect(black_box(&window))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_detect);
criterion_main!(benches);
