//! Benchmarks for membership resolution over a parsed catalog.
//! Run with: cargo bench -p daffodil-segmentation

use daffodil_core::{AttributeSet, Scalar, Sequence};
use daffodil_segmentation::{resolve, CatalogSnapshot, SegmentBuilder};
use serde_json::json;

fn create_snapshot(size: usize) -> CatalogSnapshot {
    let segments = (0..size)
        .map(|i| {
            let builder = SegmentBuilder::new(i.to_string(), format!("segment-{i:04}"))
                .attribute_gt("orders_23d", (i % 20) as i64)
                .payload("tier", json!(i));
            if i % 3 == 0 {
                builder.attribute_equals("location_tag", "NYC").build()
            } else {
                builder.build()
            }
        })
        .collect();
    CatalogSnapshot::from_segments(1, segments)
}

fn main() {
    let snapshot = create_snapshot(256);
    let attrs: AttributeSet = [
        ("orders_23d", Scalar::Int(12)),
        ("total_spend", Scalar::Float(640.0)),
        ("location_tag", Scalar::from("NYC")),
    ]
    .into_iter()
    .collect();

    // Warmup
    for i in 0..100 {
        let _ = resolve("bench-user", &attrs, &snapshot, Sequence(i));
    }

    let iterations: u32 = 10_000;
    let start = std::time::Instant::now();
    let mut matched = 0;

    for i in 0..iterations {
        let result = resolve("bench-user", &attrs, &snapshot, Sequence(u64::from(i)));
        matched += result.matched_segments.len();
    }

    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations;

    println!("=== Resolve Benchmark ===");
    println!("Iterations:  {}", iterations);
    println!("Segments:    {}", snapshot.len());
    println!("Total time:  {:?}", elapsed);
    println!("Per user:    {:?}", per_iter);
    println!("Throughput:  {:.0} users/sec", f64::from(iterations) / elapsed.as_secs_f64());
    println!("Matched:     {}", matched / iterations as usize);
}
