//! End-to-end buffer extraction scenarios

use hw_buffers::{
    extract_hw_buffers, parse_stmt, BufferKind, Environment, ExtractedBuffers, ForKind, HwBuffer,
    LoopLevel, PassError, Stage, VarSpec,
};
use pretty_assertions::assert_eq;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn extract(source: &str, env: &Environment) -> Result<ExtractedBuffers, PassError> {
    init_logger();
    extract_hw_buffers(&parse_stmt(source).unwrap(), env)
}

fn buffer(source: &str, env: &Environment, name: &str) -> HwBuffer {
    extract(source, env).unwrap().buffers[name].clone()
}

fn stage_xy(name: &str) -> Stage {
    Stage::new(name, ["x", "y"], ["y", "x"])
}

fn row_buffered() -> Environment {
    let row = LoopLevel::at("blur", "y");
    Environment::new()
        .with(stage_xy("hw_input").store_at(row.clone()).compute_at(row).hw_buffer())
        .with(stage_xy("blur"))
}

/// Line-buffered blur over `(blur.x + i, blur.y + j)` for every tap
fn row_blur(taps: &[(i64, i64)], rows_min: i64, rows: i64) -> String {
    let reads: Vec<String> = taps
        .iter()
        .map(|(i, j)| format!("hw_input(blur.x + {}, blur.y + {})", i, j))
        .collect();
    let width_reach = taps.iter().map(|(i, _)| *i).max().unwrap_or(0);
    format!(
        "for (blur.y, 0, 60) {{
           realize hw_input([0, 64], [blur.y + {rows_min}, {rows}]) {{
             for (hw_input.y, blur.y + {rows_min}, {rows}) {{
               for (hw_input.x, 0, 64) {{
                 hw_input(hw_input.x, hw_input.y) = input(hw_input.x, hw_input.y)
               }}
             }}
             for (blur.x, 0, {width}) {{
               blur(blur.x, blur.y) = {sum}
             }}
           }}
         }}",
        rows_min = rows_min,
        rows = rows,
        width = 64 - width_reach,
        sum = reads.join(" + "),
    )
}

fn box_taps() -> Vec<(i64, i64)> {
    (0..3).flat_map(|j| (0..3).map(move |i| (i, j))).collect()
}

/// Vertical stencil of half-width `r`
fn vertical_taps(r: i64) -> Vec<(i64, i64)> {
    (-r..=r).map(|j| (0, j)).collect()
}

const FULL_FRAME: &str = "
    realize hw_input([0, 64], [0, 64]) {
      for (hw_input.y, 0, 64) {
        for (hw_input.x, 0, 64) {
          hw_input(hw_input.x, hw_input.y) = input(hw_input.x, hw_input.y)
        }
      }
      for (blur.y, 0, 62) {
        for (blur.x, 0, 62) {
          blur(blur.x, blur.y) = hw_input(blur.x, blur.y) + hw_input(blur.x + 1, blur.y + 1)
            + hw_input(blur.x + 2, blur.y + 2)
        }
      }
    }";

fn full_frame_env(store: LoopLevel, compute: LoopLevel) -> Environment {
    Environment::new()
        .with(stage_xy("hw_input").store_at(store).compute_at(compute).hw_buffer())
        .with(stage_xy("blur"))
}

#[test]
fn box_filter_line_buffer() {
    let program = row_blur(&box_taps(), 0, 3);
    let hw = buffer(&program, &row_buffered(), "hw_input");

    assert_eq!(hw.kind, BufferKind::LineBuffer);
    assert_eq!(hw.output_stencil_size, vec![3, 3]);
    // One full row of width 64 by the 3-tall window
    assert_eq!(hw.buffer_capacity, vec![64, 3]);
    assert_eq!(hw.input_chunk_size, vec![1, 1]);
    assert_eq!(hw.output_block_size, vec![3, 3]);
    assert_eq!(
        hw.streaming_loops,
        vec![VarSpec::new("blur.x", 0.into(), 62.into())]
    );
}

#[test]
fn wide_stencil_line_buffer() {
    // 17x17 taps form a left-deep sum of 289 reads
    let taps: Vec<(i64, i64)> = (0..17).flat_map(|j| (0..17).map(move |i| (i, j))).collect();
    let hw = buffer(&row_blur(&taps, 0, 17), &row_buffered(), "hw_input");
    assert_eq!(hw.buffer_capacity, vec![64, 17]);
    assert_eq!(hw.output_stencil_size, vec![17, 17]);
    assert_eq!(hw.output_block_size, vec![17, 17]);
}

#[test]
fn symmetric_stencil_sizes_line_buffer_exactly() {
    for r in 1..=3 {
        let program = row_blur(&vertical_taps(r), -r, 2 * r + 1);
        let hw = buffer(&program, &row_buffered(), "hw_input");
        assert_eq!(hw.output_stencil_size[1], 2 * r + 1, "radius {}", r);
        assert_eq!(hw.buffer_capacity[1], 2 * r + 1, "radius {}", r);
    }
}

#[test]
fn widening_the_window_never_shrinks_the_buffer() {
    let narrow = buffer(&row_blur(&vertical_taps(1), -1, 3), &row_buffered(), "hw_input");
    let wide = buffer(&row_blur(&vertical_taps(2), -2, 5), &row_buffered(), "hw_input");
    for d in 0..2 {
        assert!(wide.buffer_capacity[d] >= narrow.buffer_capacity[d]);
        assert!(wide.output_stencil_size[d] >= narrow.output_stencil_size[d]);
    }
}

#[test]
fn full_frame_double_buffer() {
    let hw = buffer(
        FULL_FRAME,
        &full_frame_env(LoopLevel::Root, LoopLevel::Innermost),
        "hw_input",
    );
    assert_eq!(hw.kind, BufferKind::DoubleBuffer);
    assert_eq!(hw.buffer_capacity, vec![128, 128]);
    assert_eq!(hw.output_stencil_size, vec![3, 3]);
    assert_eq!(hw.input_block_size, vec![128, 128]);

    // Exactly two generations of the single-buffered layout
    let single = buffer(
        FULL_FRAME,
        &full_frame_env(LoopLevel::Root, LoopLevel::Root),
        "hw_input",
    );
    assert_eq!(single.kind, BufferKind::LineBuffer);
    let doubled: Vec<i64> = single.buffer_capacity.iter().map(|c| c * 2).collect();
    assert_eq!(hw.buffer_capacity, doubled);
}

#[test]
fn row_staged_double_buffer_doubles_streamed_dimension_only() {
    let program = "
        realize hw_input([0, 64], [0, 64]) {
          for (blur.y, 0, 64) {
            for (hw_input.x, 0, 64) {
              hw_input(hw_input.x, blur.y) = input(hw_input.x, blur.y)
            }
            for (blur.x, 0, 62) {
              blur(blur.x, blur.y) = hw_input(blur.x, blur.y) + hw_input(blur.x + 1, blur.y)
                + hw_input(blur.x + 2, blur.y)
            }
          }
        }";
    let env = full_frame_env(LoopLevel::Root, LoopLevel::at("blur", "y"));
    let hw = buffer(program, &env, "hw_input");

    assert_eq!(hw.kind, BufferKind::DoubleBuffer);
    assert_eq!(
        hw.streaming_loops,
        vec![VarSpec::new("blur.y", 0.into(), 64.into())]
    );
    assert_eq!(hw.buffer_capacity, vec![64, 128]);
    // A full row lands per compute iteration
    assert_eq!(hw.input_block_size, vec![64, 128]);
    assert_eq!(hw.output_stencil_size, vec![3, 1]);
}

fn cascade(a_width: i64) -> String {
    format!(
        "realize b([0, 62], [0, 62]) {{
           realize a([0, {w}], [0, 64]) {{
             for (a.y, 0, 64) {{
               for (a.x, 0, {w}) {{ a(a.x, a.y) = input(a.x, a.y) }}
             }}
             for (b.y, 0, 62) {{
               for (b.x, 0, 62) {{
                 b(b.x, b.y) = a(b.x, b.y) + a(b.x + 1, b.y + 1) + a(b.x + 2, b.y + 2)
               }}
             }}
           }}
           for (out.y, 0, 60) {{
             for (out.x, 0, 60) {{
               out(out.x, out.y) = b(out.x, out.y) + b(out.x + 1, out.y) + b(out.x + 2, out.y)
                 + b(out.x, out.y + 2)
             }}
           }}
         }}",
        w = a_width
    )
}

fn cascade_env(buffer_b: bool) -> Environment {
    let b = if buffer_b { stage_xy("b").hw_buffer() } else { stage_xy("b") };
    Environment::new()
        .with(stage_xy("a").hw_buffer())
        .with(b)
        .with(stage_xy("out"))
}

#[test]
fn cascaded_stages_are_sized_independently() {
    let result = extract(&cascade(64), &cascade_env(true)).unwrap();
    let a = &result.buffers["a"];
    let b = &result.buffers["b"];

    assert_eq!(a.buffer_capacity, vec![64, 64]);
    assert_eq!(a.output_stencil_size, vec![3, 3]);
    assert_eq!(b.buffer_capacity, vec![62, 62]);
    assert_eq!(b.output_stencil_size, vec![3, 3]);

    // a does not depend on whether b is buffered
    let alone = extract(&cascade(64), &cascade_env(false)).unwrap();
    assert_eq!(alone.buffers.len(), 1);
    assert_eq!(&alone.buffers["a"], a);

    // b's window comes from its own reads, not from a's capacity
    let wider_a = extract(&cascade(70), &cascade_env(true)).unwrap();
    assert_eq!(wider_a.buffers["a"].buffer_capacity, vec![70, 64]);
    assert_eq!(&wider_a.buffers["b"], b);
}

#[test]
fn extraction_is_idempotent() {
    let program = parse_stmt(&cascade(64)).unwrap();
    let env = cascade_env(true);
    let first = extract_hw_buffers(&program, &env).unwrap();
    let second = extract_hw_buffers(&program, &env).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first.buffers).unwrap(),
        serde_json::to_string(&second.buffers).unwrap()
    );
}

#[test]
fn parallel_streaming_loop_is_rejected() {
    let program = row_blur(&box_taps(), 0, 3).replace("for (blur.x,", "parallel for (blur.x,");
    let err = extract(&program, &row_buffered()).unwrap_err();
    assert_eq!(
        err,
        PassError::NonSequentialStreamingLoop {
            stage: "hw_input".to_string(),
            loop_name: "blur.x".to_string(),
            kind: ForKind::Parallel,
        }
    );

    let vectorized = row_blur(&box_taps(), 0, 3).replace("for (blur.x,", "vectorized for (blur.x,");
    assert!(matches!(
        extract(&vectorized, &row_buffered()),
        Err(PassError::NonSequentialStreamingLoop { kind: ForKind::Vectorized, .. })
    ));
}

#[test]
fn unroll_factor_widens_output_block() {
    let row = LoopLevel::at("blur", "y");
    let env = Environment::new()
        .with(stage_xy("hw_input").store_at(row.clone()).compute_at(row).hw_buffer())
        .with(stage_xy("blur").unroll("x", 2));
    let hw = buffer(&row_blur(&box_taps(), 0, 3), &env, "hw_input");

    // Two window positions per cycle: 4 columns, rounded up to whole stencils
    assert_eq!(hw.output_stencil_size, vec![3, 3]);
    assert_eq!(hw.output_block_size, vec![6, 3]);
}

#[test]
fn data_dependent_read_is_non_affine() {
    let program = "
        realize hw_input([0, 16]) {
          for (hw_input.x, 0, 16) { hw_input(hw_input.x) = input(hw_input.x) }
          for (lut.x, 0, 16) { lut(lut.x) = hw_input(index(lut.x)) }
        }";
    let env = Environment::new()
        .with(Stage::new("hw_input", ["x"], ["x"]).hw_buffer())
        .with(Stage::new("lut", ["x"], ["x"]));
    let err = extract(program, &env).unwrap_err();
    assert!(matches!(
        err,
        PassError::NonAffineAccess { ref stage, ref reason, .. }
            if stage == "hw_input" && reason == "data-dependent index"
    ));
}

#[test]
fn symbolic_extent_is_unbounded() {
    let program = "
        realize hw_input([0, width]) {
          for (hw_input.x, 0, width) { hw_input(hw_input.x) = input(hw_input.x) }
        }";
    let env = Environment::new().with(Stage::new("hw_input", ["x"], ["x"]).hw_buffer());
    assert!(matches!(
        extract(program, &env),
        Err(PassError::UnboundedCapacity { dim: 0, .. })
    ));
}
