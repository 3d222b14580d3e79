//! The analysis entry point.
//!
//! One call takes a procedure from source to a cached [`AnalysisRecord`]:
//! hash, cache lookup, extraction (or tracing when extraction cannot see
//! through a call), simulation, failure search, requirement inference.

use labtrace_core::{
    AnalysisOutcome, AnalysisRecord, AnalysisWarning, FailureModeSummary, HierarchyRegistry,
    ProtocolComputationGraph, ResourceCatalog, SourcePosition, StructuralFailure, ViolationSummary,
};
use labtrace_extract::{extract_procedure, ExtractError, ParsedModule, ProcedureSource};
use labtrace_storage::{content_hash, AnalysisCache, CacheKey, Claim};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::AnalysisConfig;
use crate::contracts::ContractDatabase;
use crate::error::CheckError;
use crate::failure::FailureModeDetector;
use crate::requirements::{infer_requirements, machine_requirements};
use crate::simulator::HierarchicalSimulator;
use crate::tracer::trace_procedure;

/// Read-only inputs shared by every analysis.
#[derive(Debug, Clone)]
pub struct Analyzer {
    contracts: ContractDatabase,
    hierarchy: HierarchyRegistry,
    catalog: ResourceCatalog,
    config: AnalysisConfig,
    simulation_version: String,
}

#[derive(Serialize)]
struct Settings<'a> {
    config: &'a AnalysisConfig,
    catalog: &'a ResourceCatalog,
}

impl Analyzer {
    pub fn new(
        contracts: ContractDatabase,
        hierarchy: HierarchyRegistry,
        catalog: ResourceCatalog,
        config: AnalysisConfig,
    ) -> Result<Self, CheckError> {
        // Records made under another configuration or catalog never match.
        let settings = serde_json::to_string(&Settings { config: &config, catalog: &catalog })?;
        let digest = content_hash("settings", &settings);
        let short = digest.as_str().get(..8).unwrap_or(digest.as_str());
        let simulation_version = format!("{}/cfg-{short}", contracts.version());
        Ok(Analyzer { contracts, hierarchy, catalog, config, simulation_version })
    }

    /// Built-in contracts, hierarchy and catalog.
    pub fn standard(config: AnalysisConfig) -> Result<Self, CheckError> {
        Analyzer::new(ContractDatabase::standard(), HierarchyRegistry::standard(), ResourceCatalog::standard(), config)
    }

    pub fn contracts(&self) -> &ContractDatabase {
        &self.contracts
    }

    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn simulation_version(&self) -> &str {
        &self.simulation_version
    }

    pub fn cache_key(&self, procedure: &ProcedureSource) -> CacheKey {
        CacheKey::new(
            procedure.name.clone(),
            content_hash(&procedure.name, &procedure.source),
            self.simulation_version.clone(),
        )
    }

    /// Analyzes one procedure, consulting and filling `cache`.
    ///
    /// `Err` is reserved for infrastructure failures and for a procedure
    /// that does not exist in its module; everything found about the
    /// procedure itself is in the record.
    ///
    /// The in-flight marker is advisory. A caller that finds the key
    /// claimed analyzes anyway and writes its record; analysis is
    /// deterministic, so whichever `put` lands last stores the same record.
    /// Only the claimant releases the marker.
    pub fn analyze(
        &self,
        procedure: &ProcedureSource,
        cache: &dyn AnalysisCache,
    ) -> Result<AnalysisRecord, CheckError> {
        let key = self.cache_key(procedure);
        if let Some(record) = cache.get(&key)? {
            debug!(%key, "cache hit");
            return Ok(record);
        }
        debug!(%key, "cache miss");

        let claim = cache.claim(&key);
        if claim == Claim::InFlight {
            debug!(%key, "analysis already in flight, computing anyway");
        }
        let result = self.analyze_uncached(procedure, &key).and_then(|record| {
            cache.put(&key, record.clone())?;
            Ok(record)
        });
        if claim == Claim::Claimed {
            cache.release(&key)?;
        }
        result
    }

    /// Analyzes independent procedures in parallel against one cache.
    pub fn analyze_many(
        &self,
        procedures: &[ProcedureSource],
        cache: &dyn AnalysisCache,
    ) -> Vec<Result<AnalysisRecord, CheckError>> {
        procedures.par_iter().map(|p| self.analyze(p, cache)).collect()
    }

    fn analyze_uncached(&self, procedure: &ProcedureSource, key: &CacheKey) -> Result<AnalysisRecord, CheckError> {
        let name = procedure.name.as_str();
        let module = match ParsedModule::parse(procedure.source.as_str()) {
            Ok(module) => module,
            Err(ExtractError::Syntax { line, column }) => {
                let error = StructuralFailure {
                    message: "source does not parse".to_string(),
                    call: String::new(),
                    position: SourcePosition::new(line, column),
                };
                let graph = ProtocolComputationGraph::new(name);
                return Ok(self.record(key, graph, AnalysisOutcome::CannotAnalyze { errors: vec![error] }));
            }
            Err(e) => return Err(e.into()),
        };

        let extraction = extract_procedure(&module, name, &self.hierarchy, self.config.topology)?;
        let (mut graph, mut warnings) = if extraction.is_resolved() {
            (extraction.graph, extraction.warnings)
        } else {
            debug!(
                procedure = name,
                unresolved = extraction.unresolved.len(),
                "static extraction incomplete, tracing instead"
            );
            let trace = trace_procedure(&module, name, &self.hierarchy, self.config.topology, self.config.tracer)?;
            (trace.graph, trace.warnings)
        };

        let simulator = HierarchicalSimulator::new(&self.contracts, &self.catalog, &self.config);
        let report = simulator.simulate(&graph);
        warnings.extend(report.warnings.iter().cloned());
        if !report.is_structurally_valid() {
            let mut record = self.record(key, graph, AnalysisOutcome::CannotAnalyze { errors: report.structural });
            record.warnings = ordered(warnings);
            return Ok(record);
        }

        let search = FailureModeDetector::new(&simulator, self.config.failure).search(&graph, &report);
        let inferred = infer_requirements(&graph, &report, &self.catalog, &self.contracts);
        let machines = machine_requirements(&graph, &report);
        graph.set_preconditions(report.preconditions.clone())?;

        let violations: Vec<ViolationSummary> = report.violations().map(|v| v.summary(&graph)).collect();
        let failure_modes: Vec<FailureModeSummary> = search.modes.iter().map(|m| m.summary(&graph)).collect();
        warnings.extend(search.warnings);

        let outcome = AnalysisOutcome::Analyzable {
            failure_conditions: violations.len() + failure_modes.len(),
            verified_level: report.verified_level(),
        };
        info!(
            procedure = name,
            violations = violations.len(),
            failure_modes = failure_modes.len(),
            requirements = inferred.len(),
            "analysis finished"
        );

        let mut record = self.record(key, graph, outcome);
        record.inferred_requirements = inferred;
        record.machine_requirements = machines;
        record.violations = violations;
        record.failure_modes = failure_modes;
        record.warnings = ordered(warnings);
        Ok(record)
    }

    fn record(&self, key: &CacheKey, graph: ProtocolComputationGraph, outcome: AnalysisOutcome) -> AnalysisRecord {
        AnalysisRecord {
            procedure: key.procedure.clone(),
            content_hash: key.content_hash.to_string(),
            simulation_version: key.simulation_version.clone(),
            outcome,
            computation_graph: graph,
            inferred_requirements: Vec::new(),
            machine_requirements: Vec::new(),
            failure_modes: Vec::new(),
            violations: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

fn ordered(mut warnings: Vec<AnalysisWarning>) -> Vec<AnalysisWarning> {
    warnings.sort();
    warnings.dedup();
    warnings
}
