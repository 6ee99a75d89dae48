//! Buffer capacity and double-buffer planning
//!
//! Turns the windows of a stage's accesses into the sizes of its hardware
//! buffer:
//! - A line buffer holds one generation: the larger of the write and read
//!   footprints per dimension.
//! - A double buffer holds two generations in every dimension a streaming
//!   loop advances.
//! - Chunk, block and stencil sizes come from the per-cycle and per-element
//!   windows.

use std::collections::BTreeSet;

use log::debug;

use crate::analyzer::{DimBounds, StencilAnalysis, Window};
use crate::error::{PassError, PassResult};
use crate::hardware::BufferKind;
use crate::ir::Expr;
use crate::schedule::StmtSchedule;

/// Where the compute level sits relative to the buffered stage's writes
#[derive(Debug, Clone)]
pub struct ComputeRegion {
    /// The stage is written without passing through a sequential loop
    /// below the compute level.
    pub produced_at_level: bool,
    /// Window of the writes made during one compute iteration
    pub tile: Window,
}

/// Sizes derived for one buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSizes {
    pub capacity: Vec<i64>,
    pub input_chunk: Vec<i64>,
    pub input_block: Vec<i64>,
    pub input_pattern: Expr,
    pub output_stencil: Vec<i64>,
    pub output_block: Vec<i64>,
    pub output_pattern: Expr,
}

/// Planner for one buffered stage
pub struct BufferPlanner<'a> {
    stage: &'a str,
    kind: BufferKind,
    streaming: &'a StmtSchedule,
}

impl<'a> BufferPlanner<'a> {
    pub fn new(stage: &'a str, kind: BufferKind, streaming: &'a StmtSchedule) -> Self {
        Self {
            stage,
            kind,
            streaming,
        }
    }

    /// Size the buffer from the stage's accesses
    pub fn plan(&self, analysis: &StencilAnalysis, region: &ComputeRegion) -> PassResult<BufferSizes> {
        let dims = analysis.dims();

        // Non-affine writes are tolerated when reads fix the footprint
        let writes = if analysis.reads.is_empty() {
            analysis.write_bounds(&Window::Footprint)?
        } else {
            match analysis.write_bounds(&Window::Footprint) {
                Ok(bounds) => bounds,
                Err(err @ PassError::NonAffineAccess { .. }) => {
                    debug!("{}: sizing from reads only ({})", self.stage, err);
                    None
                }
                Err(err) => return Err(err),
            }
        };
        let writes_affine = writes.is_some();
        let reads = analysis.read_bounds(&Window::Footprint)?;

        let generation = match (&writes, &reads) {
            (None, None) => analysis.declared_extents()?,
            _ => (0..dims)
                .map(|d| {
                    let w = self.extent_in(&writes, d)?;
                    let r = self.extent_in(&reads, d)?;
                    Ok(w.max(r))
                })
                .collect::<PassResult<Vec<_>>>()?,
        };
        for (dim, extent) in generation.iter().enumerate() {
            if *extent <= 0 {
                return Err(PassError::sizing(
                    self.stage,
                    format!("dimension {} has empty extent {}", dim, extent),
                ));
            }
        }

        let capacity = match self.kind {
            BufferKind::LineBuffer => generation,
            BufferKind::DoubleBuffer => {
                let streamed = self.streamed_names();
                let driven = |d: usize| {
                    let in_dim = |b: &Option<Vec<DimBounds>>| {
                        b.as_ref()
                            .map_or(false, |b| !b[d].driven_by.is_disjoint(&streamed))
                    };
                    in_dim(&writes) || in_dim(&reads)
                };
                generation
                    .iter()
                    .enumerate()
                    .map(|(d, extent)| {
                        if driven(d) {
                            extent
                                .checked_mul(2)
                                .ok_or_else(|| PassError::unbounded(self.stage, d, extent))
                        } else {
                            Ok(*extent)
                        }
                    })
                    .collect::<PassResult<Vec<_>>>()?
            }
        };

        let input_chunk = if writes_affine {
            self.extents(analysis.write_bounds(&Window::Cycle)?, dims)?
        } else {
            vec![1; dims]
        };
        let granularity = if region.produced_at_level || !writes_affine {
            input_chunk.clone()
        } else {
            let tile = self.extents(analysis.write_bounds(&region.tile)?, dims)?;
            self.round_up_all(&tile, &input_chunk)?
        };
        let input_block = self.round_up_all(&capacity, &granularity)?;

        let element = analysis.read_bounds(&Window::Element)?;
        let (output_stencil, output_block) = match &element {
            Some(_) => {
                let stencil = self.extents(element.clone(), dims)?;
                let cycle = self.extents(analysis.read_bounds(&Window::Cycle)?, dims)?;
                let block = self.round_up_all(&cycle, &stencil)?;
                (stencil, block)
            }
            None => (input_chunk.clone(), input_chunk.clone()),
        };

        for (dim, (block, cap)) in output_block.iter().zip(&capacity).enumerate() {
            if block > cap {
                return Err(PassError::sizing(
                    self.stage,
                    format!(
                        "output block {} in dimension {} is wider than the buffer capacity {}",
                        block, dim, cap
                    ),
                ));
            }
        }

        let input_pattern = analysis
            .writes
            .first()
            .map(|w| analysis.access_pattern(&w.args, &capacity));
        let output_pattern = element.as_ref().map(|bounds| {
            let origins: Vec<Expr> = bounds.iter().map(DimBounds::origin).collect();
            analysis.access_pattern(&origins, &capacity)
        });
        let (input_pattern, output_pattern) = match (input_pattern, output_pattern) {
            (Some(i), Some(o)) => (i, o),
            (Some(i), None) => (i.clone(), i),
            (None, Some(o)) => (o.clone(), o),
            (None, None) => {
                let origin = vec![Expr::int(0); dims];
                let pattern = analysis.access_pattern(&origin, &capacity);
                (pattern.clone(), pattern)
            }
        };

        debug!(
            "{}: {} capacity {:?}, chunk {:?}, stencil {:?}",
            self.stage, self.kind, capacity, input_chunk, output_stencil
        );

        Ok(BufferSizes {
            capacity,
            input_chunk,
            input_block,
            input_pattern,
            output_stencil,
            output_block,
            output_pattern,
        })
    }

    /// Streaming loops that still iterate
    fn streamed_names(&self) -> BTreeSet<String> {
        self.streaming
            .iter()
            .filter(|spec| !spec.is_const())
            .map(|spec| spec.name.clone())
            .collect()
    }

    /// Extent of dimension `dim`, zero when there are no accesses
    fn extent_in(&self, bounds: &Option<Vec<DimBounds>>, dim: usize) -> PassResult<i64> {
        match bounds {
            Some(bounds) => bounds[dim]
                .extent()
                .ok_or_else(|| PassError::unbounded(self.stage, dim, bounds[dim].origin())),
            None => Ok(0),
        }
    }

    fn extents(&self, bounds: Option<Vec<DimBounds>>, dims: usize) -> PassResult<Vec<i64>> {
        match bounds {
            Some(_) => (0..dims).map(|d| self.extent_in(&bounds, d)).collect(),
            None => Ok(vec![1; dims]),
        }
    }

    fn round_up_all(&self, sizes: &[i64], granules: &[i64]) -> PassResult<Vec<i64>> {
        sizes
            .iter()
            .zip(granules)
            .enumerate()
            .map(|(dim, (s, g))| {
                round_up(*s, *g).ok_or_else(|| PassError::unbounded(self.stage, dim, s))
            })
            .collect()
    }
}

/// Smallest multiple of `granule` that holds `size`, `None` on overflow
pub fn round_up(size: i64, granule: i64) -> Option<i64> {
    if granule <= 1 {
        return Some(size);
    }
    size.checked_add(granule - 1).map(|s| s / granule * granule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::StencilAnalyzer;
    use crate::ir_utils::find_store_scope;
    use crate::parser::parse_stmt;
    use crate::schedule::{Environment, Stage, VarSpec};
    use pretty_assertions::assert_eq;

    fn plan(source: &str, kind: BufferKind, streaming: &[&str], region: ComputeRegion) -> PassResult<BufferSizes> {
        plan_in(&Environment::new(), source, kind, streaming, region)
    }

    fn plan_in(
        env: &Environment,
        source: &str,
        kind: BufferKind,
        streaming: &[&str],
        region: ComputeRegion,
    ) -> PassResult<BufferSizes> {
        let stmt = parse_stmt(source).unwrap();
        let scope = find_store_scope(&stmt, "p").unwrap();
        let analysis = StencilAnalyzer::new(env).analyze(&scope)?;
        let streaming: StmtSchedule = streaming
            .iter()
            .map(|name| VarSpec::new(*name, Expr::int(0), Expr::int(8)))
            .collect();
        BufferPlanner::new("p", kind, &streaming).plan(&analysis, &region)
    }

    fn footprint_region() -> ComputeRegion {
        ComputeRegion {
            produced_at_level: false,
            tile: Window::Footprint,
        }
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(64, 1), Some(64));
        assert_eq!(round_up(7, 3), Some(9));
        assert_eq!(round_up(9, 3), Some(9));
        assert_eq!(round_up(5, 0), Some(5));
        assert_eq!(round_up(i64::MAX - 1, 4), None);
    }

    #[test]
    fn test_line_buffer_holds_one_generation() {
        let source = "
            realize p([0, 16]) {
              for (p.x, 0, 16) { p(p.x) = in(p.x) }
              for (c.x, 0, 14) { c(c.x) = p(c.x) + p(c.x + 1) + p(c.x + 2) }
            }";
        let sizes = plan(source, BufferKind::LineBuffer, &["c.x"], footprint_region()).unwrap();
        assert_eq!(sizes.capacity, vec![16]);
        assert_eq!(sizes.output_stencil, vec![3]);
        assert_eq!(sizes.output_block, vec![3]);
        assert_eq!(sizes.input_chunk, vec![1]);
        assert_eq!(sizes.input_block, vec![16]);
        assert_eq!(sizes.input_pattern.to_string(), "p.x");
        assert_eq!(sizes.output_pattern.to_string(), "c.x");
    }

    #[test]
    fn test_double_buffer_doubles_streamed_dims() {
        let source = "
            realize p([0, 8], [0, 4]) {
              for (p.y, 0, 4) { for (p.x, 0, 8) { p(p.x, p.y) = 0 } }
            }";
        let sizes = plan(source, BufferKind::DoubleBuffer, &["p.y"], footprint_region()).unwrap();
        assert_eq!(sizes.capacity, vec![8, 8]);

        let both = plan(source, BufferKind::DoubleBuffer, &["p.y", "p.x"], footprint_region()).unwrap();
        assert_eq!(both.capacity, vec![16, 8]);
        // No reads: the output side mirrors the input side
        assert_eq!(both.output_stencil, both.input_chunk);
        assert_eq!(both.output_pattern, both.input_pattern);
    }

    #[test]
    fn test_vectorized_write_sets_chunk() {
        let source = "
            realize p([0, 16]) {
              for (p.xo, 0, 4) { vectorized for (p.xi, 0, 4) { p(p.xo * 4 + p.xi) = 0 } }
              for (c.x, 0, 16) { c(c.x) = p(c.x) }
            }";
        let region = ComputeRegion {
            produced_at_level: false,
            tile: Window::Within("p.xo".to_string()),
        };
        let sizes = plan(source, BufferKind::LineBuffer, &["c.x"], region).unwrap();
        assert_eq!(sizes.input_chunk, vec![4]);
        assert_eq!(sizes.input_block, vec![16]);
        assert_eq!(sizes.capacity, vec![16]);
    }

    #[test]
    fn test_declared_bounds_without_accesses() {
        let source = "realize p([0, 5], [0, 7]) { eval 0 }";
        let sizes = plan(source, BufferKind::LineBuffer, &[], footprint_region()).unwrap();
        assert_eq!(sizes.capacity, vec![5, 7]);
        assert_eq!(sizes.input_pattern.to_string(), "0");
    }

    #[test]
    fn test_non_affine_write_sized_from_reads() {
        let source = "
            realize p([0, 8]) {
              for (p.x, 0, 8) { p(p.x / 2) = 0 }
              for (c.x, 0, 6) { c(c.x) = p(c.x) + p(c.x + 2) }
            }";
        let sizes = plan(source, BufferKind::LineBuffer, &["c.x"], footprint_region()).unwrap();
        assert_eq!(sizes.capacity, vec![8]);
        assert_eq!(sizes.input_chunk, vec![1]);
    }

    #[test]
    fn test_block_wider_than_capacity() {
        let source = "
            realize p([0, 4]) {
              for (p.x, 0, 4) { p(p.x) = 0 }
              for (c.x, 0, 2) { c(c.x) = p(c.x) + p(c.x + 1) + p(c.x + 2) }
            }";
        assert!(plan(source, BufferKind::LineBuffer, &["c.x"], footprint_region()).is_ok());

        // Two window positions per cycle need a block of 6 in a buffer of 4
        let env = Environment::new().with(Stage::new("c", ["x"], ["x"]).unroll("x", 2));
        assert!(matches!(
            plan_in(&env, source, BufferKind::LineBuffer, &["c.x"], footprint_region()),
            Err(PassError::SizingError { .. })
        ));
    }

    #[test]
    fn test_huge_extents_are_unbounded() {
        // Footprint fits in an i64, rounding the block up to the tile does not
        let source = "
            realize p([0, 8], [0, 1]) {
              for (p.y, 0, 4611686018427387904) {
                for (p.x, 0, 4611686018427387904) { p(p.x - p.y, 0) = 0 }
              }
            }";
        assert!(matches!(
            plan(source, BufferKind::LineBuffer, &[], footprint_region()),
            Err(PassError::UnboundedCapacity { dim: 0, .. })
        ));

        // Footprint itself does not fit
        let source = source.replace("p(p.x - p.y, 0)", "p(p.x * 2 - p.y * 2, 0)");
        assert!(matches!(
            plan(&source, BufferKind::LineBuffer, &[], footprint_region()),
            Err(PassError::UnboundedCapacity { dim: 0, .. })
        ));
    }
}
