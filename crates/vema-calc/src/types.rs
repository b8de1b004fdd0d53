use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Fleet composition: canonical vehicle type -> percentage share.
pub type FleetMix = BTreeMap<String, f64>;

pub const MILES_PER_KM: f64 = 1.60934;

#[derive(Debug, Clone)]
pub struct FactorQuery {
    pub vehicle_type: String,
    pub pollutant: String,
    pub model_year: i32,
    pub season: String,
    pub road_type: String,
    pub return_curve: bool,
}

/// One point of the speed/emission-rate curve, in the native g/mile unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedPoint {
    pub speed_mph: f64,
    pub speed_kph: f64,
    pub emission_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypicalValue {
    pub label: String,
    pub speed_mph: f64,
    pub speed_kph: f64,
    pub emission_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeedRange {
    pub min_mph: f64,
    pub max_mph: f64,
    pub min_kph: f64,
    pub max_kph: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorQuerySummary {
    pub vehicle_type: String,
    pub pollutant: String,
    pub model_year: i32,
    pub season: String,
    pub road_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorData {
    pub query_summary: FactorQuerySummary,
    pub speed_curve: Vec<SpeedPoint>,
    pub typical_values: Vec<TypicalValue>,
    pub speed_range: SpeedRange,
    pub data_points: usize,
    pub unit: String,
    pub data_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub t: f64,
    pub speed_kph: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceleration_mps2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_pct: Option<f64>,
}

/// Per-second computation output: vehicle specific power, its operating-mode
/// bin, and grams emitted for each pollutant during that second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondResult {
    pub t: f64,
    pub speed_kph: f64,
    pub acceleration_mps2: f64,
    pub vsp: f64,
    pub op_mode: u32,
    pub emissions: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectorySummary {
    pub total_distance_km: f64,
    pub total_time_s: f64,
    pub avg_speed_kph: f64,
    pub total_emissions_g: BTreeMap<String, f64>,
    pub emission_rates_g_per_km: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryOutcome {
    pub results: Vec<SecondResult>,
    pub summary: TrajectorySummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInput {
    pub link_id: String,
    pub link_length_km: f64,
    pub traffic_flow_vph: f64,
    pub avg_speed_kph: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_mix: Option<FleetMix>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkResult {
    pub link_id: String,
    pub total_emissions_kg_per_hr: BTreeMap<String, f64>,
    pub emission_rates_g_per_veh_km: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkSummary {
    pub links_count: usize,
    pub total_emissions_kg_per_hr: BTreeMap<String, f64>,
    pub avg_rates_g_per_veh_km: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkOutcome {
    pub results: Vec<LinkResult>,
    pub summary: LinkSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub source: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}
