//! Export benchmarks
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use slicer_gcode::config::{PrintConfig, PrintRegionConfig};
use slicer_gcode::gcode::{GCodeExporter, ToolOrdering};
use slicer_gcode::geometry::{Polygon, Polyline};
use slicer_gcode::print::{Layer, LayerRegion, Print, PrintObject};
use slicer_gcode::{ExtrusionLoop, ExtrusionPath, ExtrusionRole};

/// Two-colour print: walls on the first extruder, zig-zag infill on the second.
fn build_print(layers: usize, copies: usize) -> Print {
    let region = PrintRegionConfig::new().extruder(1).infill_extruder(2);
    let mut object = PrintObject::new("bench").with_region_config(region);
    for i in 0..layers {
        let infill: Vec<(f64, f64)> = (0..20)
            .flat_map(|k| {
                let y = 4.0 + k as f64 * 1.5;
                [(4.0, y), (36.0, y)]
            })
            .collect();
        object = object.with_layer(
            Layer::new(i, 0.2 * (i + 1) as f64, 0.2)
                .with_island(Polygon::rectangle(0.0, 0.0, 40.0, 40.0))
                .with_region(
                    LayerRegion::new(0)
                        .with_perimeter(ExtrusionLoop::from_polygon(
                            &Polygon::rectangle(1.0, 1.0, 39.0, 39.0),
                            ExtrusionRole::ExternalPerimeter,
                            0.45,
                            0.2,
                        ))
                        .with_fill(ExtrusionPath::new(
                            Polyline::from_mm(&infill),
                            ExtrusionRole::InternalInfill,
                            0.45,
                            0.2,
                        )),
                ),
        );
    }
    for c in 0..copies {
        object = object.with_instance(10.0 + 50.0 * c as f64, 10.0);
    }
    Print::new().with_object(object)
}

fn config(workers: usize) -> PrintConfig {
    let mut config = PrintConfig::with_extruders(2);
    config.wipe_tower.enabled = true;
    config.pipeline.workers = workers;
    config
}

fn tool_ordering_benchmark(c: &mut Criterion) {
    let print = build_print(200, 3);
    let config = config(0);
    c.bench_function("tool_ordering_200_layers", |b| {
        b.iter(|| ToolOrdering::for_print(black_box(&print), &config, None))
    });
}

fn export_benchmark(c: &mut Criterion) {
    let print = build_print(200, 3);
    let mut group = c.benchmark_group("export_to_string");
    group.sample_size(20);
    for workers in [1, 2, 4] {
        let exporter = GCodeExporter::new(config(workers));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| exporter.export_to_string(black_box(&print)))
        });
    }
    group.finish();
}

criterion_group!(benches, tool_ordering_benchmark, export_benchmark);
criterion_main!(benches);
