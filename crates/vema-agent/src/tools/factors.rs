//! Tool: query_emission_factors. Speed-binned emission factor lookup.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use vema_calc::{CalcError, FactorQuery, FactorSource};

use super::{Tool, ToolResult};

pub const DEFAULT_SEASON: &str = "夏季";
pub const DEFAULT_ROAD_TYPE: &str = "快速路";

pub struct EmissionFactorsTool {
    factors: Arc<dyn FactorSource>,
}

impl EmissionFactorsTool {
    pub fn new(factors: Arc<dyn FactorSource>) -> Self {
        Self { factors }
    }
}

#[async_trait]
impl Tool for EmissionFactorsTool {
    fn name(&self) -> &str {
        "query_emission_factors"
    }

    fn description(&self) -> &str {
        "Query vehicle emission factor curves by speed. Returns chart and data table."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "vehicle_type": {
                    "type": "string",
                    "description": "Vehicle type. Pass user's original expression (e.g., '小汽车', '公交车', 'SUV'). System will automatically recognize it."
                },
                "pollutants": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "List of pollutants to query (e.g., ['CO2', 'NOx', 'PM2.5']). Single pollutant also uses this array."
                },
                "model_year": {
                    "type": "integer",
                    "description": "Vehicle model year (e.g., 2020). Range: 1995-2025."
                },
                "season": {
                    "type": "string",
                    "description": "Season (春季/夏季/秋季/冬季). Optional, defaults to summer if not provided."
                },
                "road_type": {
                    "type": "string",
                    "description": "Road type (快速路/地面道路). Optional, defaults to expressway if not provided."
                },
                "return_curve": {
                    "type": "boolean",
                    "description": "Whether to return full curve data. Default false."
                }
            },
            "required": ["vehicle_type", "model_year"]
        })
    }

    async fn execute(&self, params: Value) -> ToolResult {
        let vehicle_type = params
            .get("vehicle_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let model_year = params.get("model_year").and_then(Value::as_i64);
        let season = params
            .get("season")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_SEASON)
            .to_string();
        let road_type = params
            .get("road_type")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_ROAD_TYPE)
            .to_string();
        let return_curve = params
            .get("return_curve")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let pollutants: Vec<String> = match params.get("pollutants").and_then(Value::as_array) {
            Some(arr) if !arr.is_empty() => arr
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => match params.get("pollutant").and_then(Value::as_str) {
                Some(p) => vec![p.to_string()],
                None => {
                    return ToolResult::error("Missing required parameter: pollutant or pollutants")
                }
            },
        };

        let (vehicle_type, model_year) = match (vehicle_type, model_year) {
            (Some(v), Some(y)) => (v, y),
            (v, y) => {
                let mut missing = Vec::new();
                if v.is_none() {
                    missing.push("vehicle_type");
                }
                if y.is_none() {
                    missing.push("model_year");
                }
                return ToolResult::missing_params(&missing);
            }
        };

        let mut pollutants_data = serde_json::Map::new();
        for pollutant in &pollutants {
            let query = FactorQuery {
                vehicle_type: vehicle_type.clone(),
                pollutant: pollutant.clone(),
                model_year: model_year as i32,
                season: season.clone(),
                road_type: road_type.clone(),
                return_curve,
            };
            match self.factors.query(&query) {
                Ok(data) => {
                    let value = serde_json::to_value(&data)
                        .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
                    pollutants_data.insert(pollutant.clone(), value);
                }
                Err(e) => return calc_error_result(e),
            }
        }

        if pollutants.len() == 1 && !return_curve {
            let pollutant = &pollutants[0];
            let data = pollutants_data.remove(pollutant).unwrap_or(Value::Null);
            let num_points = data
                .get("data_points")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let summary = format!(
                "Found {pollutant} emission factors for {vehicle_type} ({model_year}) with \
                 {num_points} speed points. Season: {season}, Road type: {road_type}."
            );
            ToolResult::success(data, summary)
        } else {
            let names = pollutants.join(", ");
            let summary = format!(
                "Found emission factors for {} pollutants ({names}) for {vehicle_type} \
                 ({model_year}). Season: {season}, Road type: {road_type}.",
                pollutants.len()
            );
            ToolResult::success(
                serde_json::json!({
                    "vehicle_type": vehicle_type,
                    "model_year": model_year,
                    "pollutants": Value::Object(pollutants_data),
                    "metadata": {
                        "season": season,
                        "road_type": road_type,
                    }
                }),
                summary,
            )
        }
    }
}

fn calc_error_result(e: CalcError) -> ToolResult {
    match e {
        CalcError::UnknownVehicle { ref valid, .. } | CalcError::UnknownPollutant { ref valid, .. } => {
            let mut result = ToolResult::error(e.to_string());
            result.suggestions = Some(valid.clone());
            result
        }
        other => ToolResult::error(other.to_string()),
    }
}
