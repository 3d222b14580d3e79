//! Protocol analysis for lab-automation procedures.
//!
//! Takes the computation graph of a procedure (extracted statically or
//! traced), replays it against a table of method contracts at increasing
//! precision, searches deviating initial states for failure modes, and
//! infers what must be set up before the procedure can run.
//!
//! # Modules
//!
//! - [`contracts`]: method signatures, preconditions and effects
//! - [`tracer`]: stand-in based tracing for procedures extraction cannot resolve
//! - [`bounds`]: loop counts and collection sizes
//! - [`simulator`]: structural, boolean, symbolic and exact replay
//! - [`failure`]: failure-mode search with footprint pruning
//! - [`requirements`]: setup requirements from simulation assumptions
//! - [`resolver`]: unmet-requirement delta against a physical layout
//! - [`pipeline`]: the cached analysis entry point

pub mod bounds;
pub mod config;
pub mod contracts;
pub mod error;
pub mod failure;
pub mod pipeline;
pub mod requirements;
pub mod resolver;
pub mod simulator;
pub mod tracer;

// Re-export key types for ergonomic use.
pub use bounds::{BoundsAnalyzer, LoopBound};
pub use config::{AnalysisConfig, ExactConfig, FailureSearchConfig, TracerLimits};
pub use contracts::{ContractDatabase, MethodContract, MethodEntry, MethodSignature};
pub use error::{CheckError, TraceError};
pub use failure::{FailureMode, FailureModeDetector, FailureSearch};
pub use pipeline::Analyzer;
pub use requirements::{infer_requirements, machine_requirements};
pub use resolver::{resolve, resolve_record, PhysicalLayout, SetupAction, SetupDelta};
pub use simulator::{HierarchicalSimulator, SimulationReport, SimulationState, StateViolation};
pub use tracer::{trace_procedure, Trace};
