//! Example: two cascaded 3x3 stages
//!
//! `a` feeds `b`, `b` feeds the output. Both are stored and computed at the
//! root, so each gets a full-frame line buffer sized from its own accesses.
//!
//! Run with: cargo run --example cascade

use hw_buffers::{HwBufferExtractor, LoopLevel, PassConfig, PipelineSpec};

const PIPELINE: &str = r#"{
  "program": "realize b([0, 62], [0, 62]) { realize a([0, 64], [0, 64]) { for (a.y, 0, 64) { for (a.x, 0, 64) { a(a.x, a.y) = input(a.x, a.y) } } for (b.y, 0, 62) { for (b.x, 0, 62) { b(b.x, b.y) = a(b.x, b.y) + a(b.x + 1, b.y + 1) + a(b.x + 2, b.y + 2) } } } for (out.y, 0, 60) { for (out.x, 0, 60) { out(out.x, out.y) = b(out.x, out.y) + b(out.x + 2, out.y + 2) } } }",
  "stages": [
    { "name": "a", "args": ["x", "y"], "loops": ["y", "x"], "schedule": { "hw_buffer": true } },
    { "name": "b", "args": ["x", "y"], "loops": ["y", "x"], "schedule": { "hw_buffer": true } },
    { "name": "out", "args": ["x", "y"], "loops": ["y", "x"] }
  ]
}"#;

fn main() {
    println!("=== Cascaded Stages ===\n");

    let spec = PipelineSpec::from_json(PIPELINE).unwrap();
    let (program, env) = spec.parse().unwrap();

    let extractor = HwBufferExtractor::new(PassConfig::new(64, true));
    let result = extractor.run(&program, &env).unwrap();

    for buffer in result.buffers.values() {
        assert_eq!(buffer.store_level, LoopLevel::Root);
        println!("{}", buffer);
    }

    println!("Annotated program:\n{}", result.stmt);
}
