//! Interfaces to the emission calculators and the knowledge retriever.
//!
//! The orchestrator treats these as pure functions from validated inputs to
//! result structures. The traits here are the contract; `reference` provides
//! small table-driven implementations so the server wires end-to-end and the
//! orchestrator is testable without the production MOVES-Matrix data.

pub mod reference;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use reference::{AverageSpeedLinkCalculator, ParametricFactorSource, StaticRetriever, VspTrajectoryCalculator};
pub use types::*;

#[derive(Debug, Error)]
pub enum CalcError {
    #[error("未知车型: {name}")]
    UnknownVehicle { name: String, valid: Vec<String> },

    #[error("未知污染物: {name}")]
    UnknownPollutant { name: String, valid: Vec<String> },

    #[error("未找到匹配数据: {0}")]
    NoData(String),

    #[error("无效输入: {0}")]
    Invalid(String),

    #[error("检索服务错误: {0}")]
    Retrieval(String),
}

/// Speed-binned emission factor lookup.
pub trait FactorSource: Send + Sync {
    fn query(&self, query: &FactorQuery) -> Result<FactorData, CalcError>;
}

/// Per-second emission computation over a trajectory.
pub trait TrajectoryCalculator: Send + Sync {
    fn calculate(
        &self,
        points: &[TrajectoryPoint],
        vehicle_type: &str,
        pollutants: &[String],
        model_year: i32,
        season: &str,
    ) -> Result<TrajectoryOutcome, CalcError>;
}

/// Link-level emission computation from traffic aggregates.
pub trait LinkCalculator: Send + Sync {
    fn calculate(
        &self,
        links: &[LinkInput],
        pollutants: &[String],
        model_year: i32,
        season: &str,
        default_fleet_mix: Option<&FleetMix>,
    ) -> Result<LinkOutcome, CalcError>;
}

/// Knowledge-base search with an optional rerank stage.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeChunk>, CalcError>;

    /// Default rerank is a truncation; real deployments plug in a cross-encoder.
    async fn rerank(
        &self,
        _query: &str,
        docs: Vec<KnowledgeChunk>,
        top_n: usize,
    ) -> Result<Vec<KnowledgeChunk>, CalcError> {
        Ok(docs.into_iter().take(top_n).collect())
    }
}
