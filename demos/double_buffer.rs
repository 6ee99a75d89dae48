//! Example: full-frame double buffer
//!
//! The input is stored at the root but computed at its innermost loop, so the
//! whole frame is staged before the blur consumes it. The buffer holds two
//! frames: one filling while the other drains.
//!
//! Run with: cargo run --example double_buffer

use hw_buffers::{extract_hw_buffers, parse_stmt, Environment, LoopLevel, Stage};

const PROGRAM: &str = "
realize hw_input([0, 64], [0, 64]) {
  for (hw_input.y, 0, 64) {
    for (hw_input.x, 0, 64) {
      hw_input(hw_input.x, hw_input.y) = input(hw_input.x, hw_input.y)
    }
  }
  for (blur.y, 0, 62) {
    for (blur.x, 0, 62) {
      blur(blur.x, blur.y) = hw_input(blur.x, blur.y) + hw_input(blur.x + 2, blur.y + 2)
    }
  }
}
";

fn main() {
    println!("=== Full-Frame Double Buffer ===\n");

    let program = parse_stmt(PROGRAM).unwrap();
    let env = Environment::new()
        .with(
            Stage::new("hw_input", ["x", "y"], ["y", "x"])
                .store_at(LoopLevel::Root)
                .compute_at(LoopLevel::Innermost)
                .hw_buffer(),
        )
        .with(Stage::new("blur", ["x", "y"], ["y", "x"]));

    let result = extract_hw_buffers(&program, &env).unwrap();
    let buffer = &result.buffers["hw_input"];
    println!("{}", buffer);

    // Single generation is 64x64
    println!("Expected capacity: [128, 128]");
    if let Some(words) = buffer.total_words() {
        println!("Storage: {} words", words);
    }
}
