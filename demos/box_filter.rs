//! Example: 3x3 box filter over a line buffer
//!
//! The input is stored and computed once per output row, so the buffer keeps
//! three rows live while `blur.x` streams along them.
//!
//! Run with: cargo run --example box_filter

use hw_buffers::{extract_hw_buffers, parse_stmt, Environment, LoopLevel, Stage};

const PROGRAM: &str = "
for (blur.y, 0, 62) {
  realize hw_input([0, 64], [blur.y, 3]) {
    for (hw_input.y, blur.y, 3) {
      for (hw_input.x, 0, 64) {
        hw_input(hw_input.x, hw_input.y) = input(hw_input.x, hw_input.y)
      }
    }
    for (blur.x, 0, 62) {
      blur(blur.x, blur.y) = (hw_input(blur.x, blur.y) + hw_input(blur.x + 1, blur.y)
        + hw_input(blur.x + 2, blur.y) + hw_input(blur.x, blur.y + 1)
        + hw_input(blur.x + 1, blur.y + 1) + hw_input(blur.x + 2, blur.y + 1)
        + hw_input(blur.x, blur.y + 2) + hw_input(blur.x + 1, blur.y + 2)
        + hw_input(blur.x + 2, blur.y + 2)) / 9
    }
  }
}
";

fn main() {
    println!("=== 3x3 Box Filter, Line Buffered ===\n");

    let program = parse_stmt(PROGRAM).unwrap();
    let row = LoopLevel::at("blur", "y");
    let env = Environment::new()
        .with(
            Stage::new("hw_input", ["x", "y"], ["y", "x"])
                .store_at(row.clone())
                .compute_at(row)
                .hw_buffer(),
        )
        .with(Stage::new("blur", ["x", "y"], ["y", "x"]));

    println!("Program:\n{}", program);

    let result = extract_hw_buffers(&program, &env).unwrap();
    let buffer = &result.buffers["hw_input"];
    println!("{}", buffer);

    // One 64-wide row per streamed line, three lines deep
    println!("Expected capacity: [64, 3]");
    println!("Expected stencil:  [3, 3]");

    // Same schedule with an unroll factor of 2 on blur.x: two window
    // positions per cycle
    let unrolled = Environment::new()
        .with(env.get("hw_input").unwrap().clone())
        .with(Stage::new("blur", ["x", "y"], ["y", "x"]).unroll("x", 2));
    let result = extract_hw_buffers(&program, &unrolled).unwrap();
    println!(
        "\nWith blur.x unrolled by 2, output block: {:?}",
        result.buffers["hw_input"].output_block_size
    );
}
