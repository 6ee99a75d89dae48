//! Scheduling metadata: loop levels, per-stage schedules and the environment
//!
//! A loop inside stage `f`'s nest over variable `x` is named `f.x` in the IR.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NotConstant, PassError, PassResult};
use crate::ir::Expr;
use crate::ir_utils::fold_to_int;

/// A position in a stage's loop nest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LoopLevel {
    /// Outside all loops
    #[default]
    Root,
    /// Inside the loop over `var` of `stage`
    At { stage: String, var: String },
    /// Inside the innermost loop of the nest
    Innermost,
}

impl LoopLevel {
    pub fn at(stage: impl Into<String>, var: impl Into<String>) -> Self {
        LoopLevel::At {
            stage: stage.into(),
            var: var.into(),
        }
    }

    /// Stage whose nest this level points into, if it names one.
    pub fn stage(&self) -> Option<&str> {
        match self {
            LoopLevel::At { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl fmt::Display for LoopLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopLevel::Root => write!(f, "root"),
            LoopLevel::At { stage, var } => write!(f, "{}.{}", stage, var),
            LoopLevel::Innermost => write!(f, "innermost"),
        }
    }
}

impl FromStr for LoopLevel {
    type Err = PassError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(LoopLevel::Root),
            "innermost" => Ok(LoopLevel::Innermost),
            _ => match s.split_once('.') {
                Some((stage, var)) if !stage.is_empty() && !var.is_empty() => {
                    Ok(LoopLevel::at(stage, var))
                }
                _ => Err(PassError::parse_error(format!(
                    "Invalid loop level `{}`: expected root, innermost or stage.var",
                    s
                ))),
            },
        }
    }
}

impl TryFrom<String> for LoopLevel {
    type Error = PassError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LoopLevel> for String {
    fn from(level: LoopLevel) -> Self {
        level.to_string()
    }
}

/// Where a level sits in one particular nest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NestPosition {
    Root,
    Loop(usize),
}

/// Scheduling directives for one stage
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageSchedule {
    #[serde(default)]
    pub store_level: LoopLevel,
    #[serde(default)]
    pub compute_level: LoopLevel,
    /// Synthesize a hardware buffer for this stage's output
    #[serde(default)]
    pub hw_buffer: bool,
    /// Unroll factor per loop variable of this stage's own nest
    #[serde(default)]
    pub unroll: BTreeMap<String, u32>,
}

/// One pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Storage dimensions, fastest first
    pub args: Vec<String>,
    /// Loop variables of the stage's own nest, outermost first
    pub loops: Vec<String>,
    #[serde(default)]
    pub schedule: StageSchedule,
}

impl Stage {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        args: impl IntoIterator<Item = S>,
        loops: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
            loops: loops.into_iter().map(Into::into).collect(),
            schedule: StageSchedule::default(),
        }
    }

    pub fn store_at(mut self, level: LoopLevel) -> Self {
        self.schedule.store_level = level;
        self
    }

    pub fn compute_at(mut self, level: LoopLevel) -> Self {
        self.schedule.compute_level = level;
        self
    }

    pub fn hw_buffer(mut self) -> Self {
        self.schedule.hw_buffer = true;
        self
    }

    pub fn unroll(mut self, var: impl Into<String>, factor: u32) -> Self {
        self.schedule.unroll.insert(var.into(), factor);
        self
    }

    /// IR name of the loop over `var` in this stage's nest
    pub fn loop_name(&self, var: &str) -> String {
        format!("{}.{}", self.name, var)
    }

    /// IR names of every loop in the nest, outermost first
    pub fn loop_names(&self) -> Vec<String> {
        self.loops.iter().map(|var| self.loop_name(var)).collect()
    }

    /// IR name of the loop a level points at; `None` for root
    /// or for innermost of an empty nest.
    pub fn level_loop(&self, level: &LoopLevel) -> Option<String> {
        match level {
            LoopLevel::Root => None,
            LoopLevel::Innermost => self.loops.last().map(|var| self.loop_name(var)),
            LoopLevel::At { var, .. } => Some(self.loop_name(var)),
        }
    }

    /// Locate a level inside this stage's nest. Levels naming another stage,
    /// or a variable the nest does not have, have no position here.
    pub fn position(&self, level: &LoopLevel) -> Result<NestPosition, String> {
        match level {
            LoopLevel::Root => Ok(NestPosition::Root),
            LoopLevel::Innermost => Ok(match self.loops.len() {
                0 => NestPosition::Root,
                n => NestPosition::Loop(n - 1),
            }),
            LoopLevel::At { stage, var } => {
                if stage != &self.name {
                    return Err(format!(
                        "`{}` belongs to `{}`, not to the nest of `{}`",
                        level, stage, self.name
                    ));
                }
                self.loops
                    .iter()
                    .position(|v| v == var)
                    .map(NestPosition::Loop)
                    .ok_or_else(|| format!("`{}` has no loop over `{}`", self.name, var))
            }
        }
    }

    /// Nest order of two levels of this stage: `Less` when `outer` encloses
    /// `inner`. Levels from another stage's nest are not comparable.
    pub fn compare_levels(
        &self,
        subject: &str,
        outer: &LoopLevel,
        inner: &LoopLevel,
    ) -> PassResult<Ordering> {
        let a = self
            .position(outer)
            .map_err(|reason| PassError::inconsistent(subject, outer, inner, reason))?;
        let b = self
            .position(inner)
            .map_err(|reason| PassError::inconsistent(subject, outer, inner, reason))?;
        Ok(a.cmp(&b))
    }
}

/// Stage name to stage, read-only for the lifetime of a pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Stage>", into = "Vec<Stage>")]
pub struct Environment {
    stages: BTreeMap<String, Stage>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stage: Stage) {
        self.stages.insert(stage.name.clone(), stage);
    }

    pub fn with(mut self, stage: Stage) -> Self {
        self.insert(stage);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    /// Look up a stage that `subject` refers to
    pub fn require(&self, subject: &str, name: &str) -> PassResult<&Stage> {
        self.get(name)
            .ok_or_else(|| PassError::missing(subject, name))
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Unroll factor scheduled for the IR loop `loop_name` (`stage.var`)
    pub fn unroll_factor(&self, loop_name: &str) -> Option<u32> {
        let (stage, var) = loop_name.split_once('.')?;
        self.get(stage)?
            .schedule
            .unroll
            .get(var)
            .copied()
            .filter(|factor| *factor > 1)
    }
}

impl From<Vec<Stage>> for Environment {
    fn from(stages: Vec<Stage>) -> Self {
        let mut env = Environment::new();
        for stage in stages {
            env.insert(stage);
        }
        env
    }
}

impl From<Environment> for Vec<Stage> {
    fn from(env: Environment) -> Self {
        env.stages.into_values().collect()
    }
}

/// A loop variable binding, or a constant when `name` is empty
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarSpec {
    pub name: String,
    pub min: Expr,
    pub extent: Expr,
}

impl VarSpec {
    pub fn new(name: impl Into<String>, min: Expr, extent: Expr) -> Self {
        Self {
            name: name.into(),
            min,
            extent,
        }
    }

    pub fn constant(value: i64) -> Self {
        Self {
            name: String::new(),
            min: Expr::Int(value),
            extent: Expr::Int(1),
        }
    }

    pub fn is_const(&self) -> bool {
        self.name.is_empty()
    }

    pub fn const_value(&self) -> Result<i64, NotConstant> {
        fold_to_int(&self.min)
    }
}

impl fmt::Display for VarSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_const() {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}[{}, {}]", self.name, self.min, self.extent)
        }
    }
}

/// Loop variables outer-to-inner
pub type StmtSchedule = Vec<VarSpec>;

#[cfg(test)]
mod tests {
    use super::*;

    fn blur() -> Stage {
        Stage::new("blur", ["x", "y"], ["y", "x"])
    }

    #[test]
    fn test_level_text_round_trip() {
        for text in ["root", "innermost", "blur.x", "f.s0.x"] {
            let level: LoopLevel = text.parse().unwrap();
            assert_eq!(level.to_string(), text);
        }
        assert_eq!(
            "f.s0.x".parse::<LoopLevel>().unwrap(),
            LoopLevel::at("f", "s0.x")
        );
        assert!("blur".parse::<LoopLevel>().is_err());
        assert!(".x".parse::<LoopLevel>().is_err());
    }

    #[test]
    fn test_compare_levels_in_nest() {
        let stage = blur();
        let y = LoopLevel::at("blur", "y");
        let x = LoopLevel::at("blur", "x");

        assert_eq!(stage.compare_levels("blur", &LoopLevel::Root, &y).unwrap(), Ordering::Less);
        assert_eq!(stage.compare_levels("blur", &y, &x).unwrap(), Ordering::Less);
        assert_eq!(stage.compare_levels("blur", &x, &y).unwrap(), Ordering::Greater);
        assert_eq!(
            stage.compare_levels("blur", &x, &LoopLevel::Innermost).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_compare_levels_across_stages_fails() {
        let stage = blur();
        let result = stage.compare_levels(
            "blur",
            &LoopLevel::at("other", "y"),
            &LoopLevel::at("blur", "x"),
        );
        assert!(matches!(result, Err(PassError::InconsistentLoopLevels { .. })));

        let result = stage.compare_levels("blur", &LoopLevel::Root, &LoopLevel::at("blur", "z"));
        assert!(matches!(result, Err(PassError::InconsistentLoopLevels { .. })));
    }

    #[test]
    fn test_environment_json() {
        let env = Environment::new().with(
            blur()
                .store_at(LoopLevel::at("blur", "y"))
                .compute_at(LoopLevel::at("blur", "y"))
                .hw_buffer()
                .unroll("x", 2),
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"store_level\":\"blur.y\""));
        let back: Environment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.unroll_factor("blur.x"), Some(2));
        assert_eq!(back.unroll_factor("blur.y"), None);
        assert_eq!(back.unroll_factor("nope.x"), None);
    }

    #[test]
    fn test_var_spec_constant() {
        let spec = VarSpec::constant(7);
        assert!(spec.is_const());
        assert_eq!(spec.const_value().unwrap(), 7);

        let spec = VarSpec::new("blur.x", Expr::var("w"), Expr::int(4));
        assert!(!spec.is_const());
        assert!(spec.const_value().is_err());
        assert_eq!(spec.to_string(), "blur.x[w, 4]");
    }
}
