//! Tool: calculate_macro_emission. Link-level emissions from traffic data.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use vema_calc::{FleetMix, LinkCalculator, LinkInput, LinkOutcome};
use vema_standardizer::Standardizer;
use vema_tables::Table;

use crate::format::format_emission_hourly;

use super::{DownloadFile, Tool, ToolResult};

const DEFAULT_POLLUTANTS: [&str; 2] = ["CO2", "NOx"];
const DEFAULT_MODEL_YEAR: i64 = 2020;
const DEFAULT_SEASON: &str = "夏季";
/// Percentages within this distance of 100 are accepted as-is.
const FLEET_SUM_TOLERANCE: f64 = 0.01;

pub struct MacroEmissionTool {
    calculator: Arc<dyn LinkCalculator>,
    standardizer: Arc<Standardizer>,
    outputs_dir: std::path::PathBuf,
}

impl MacroEmissionTool {
    pub fn new(
        calculator: Arc<dyn LinkCalculator>,
        standardizer: Arc<Standardizer>,
        outputs_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            calculator,
            standardizer,
            outputs_dir: outputs_dir.into(),
        }
    }

    /// Canonicalize fleet-mix vehicle names and normalize the shares to 100.
    async fn normalize_fleet_mix(&self, raw: &Value) -> Option<FleetMix> {
        let entries = fleet_entries(raw)?;

        let mut mix = FleetMix::new();
        for (name, pct) in entries {
            if pct <= 0.0 {
                continue;
            }
            match self.standardizer.standardize_vehicle(&name).await {
                Some(standard) => *mix.entry(standard).or_insert(0.0) += pct,
                None => warn!(vehicle = %name, "unsupported vehicle in fleet_mix"),
            }
        }
        if mix.is_empty() {
            return None;
        }

        let sum: f64 = mix.values().sum();
        if (sum - 100.0).abs() > FLEET_SUM_TOLERANCE {
            info!(from = sum, "normalizing fleet mix percentages to 100");
            for share in mix.values_mut() {
                *share *= 100.0 / sum;
            }
        }
        Some(mix)
    }

    /// Parse links from a CSV/XLSX file, mapping columns through the
    /// standardizer. Percentage-style columns become per-link fleet shares.
    async fn read_links_file(&self, path: &str) -> Result<(Table, Vec<LinkInput>), String> {
        let table = vema_tables::read_table(Path::new(path)).map_err(|e| e.to_string())?;
        let mapping = self.standardizer.map_columns(&table.columns, "macro_emission");

        let required = self.standardizer.get_required_columns("macro_emission");
        let missing: Vec<String> = required
            .iter()
            .filter(|std_name| !mapping.values().any(|v| v == *std_name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "缺少必需列: {}。已识别列: {:?}",
                missing.join(", "),
                table.columns
            ));
        }

        let col_for = |standard: &str| -> Option<String> {
            mapping
                .iter()
                .find(|(_, v)| v.as_str() == standard)
                .map(|(k, _)| k.clone())
        };
        let id_col = col_for("link_id");
        let length_col = col_for("link_length_km").expect("required column checked above");
        let flow_col = col_for("traffic_flow_vph").expect("required column checked above");
        let speed_col = col_for("avg_speed_kph").expect("required column checked above");

        let share_columns: Vec<String> = table
            .columns
            .iter()
            .filter(|c| !mapping.contains_key(c.as_str()) && is_share_column(c.as_str()))
            .cloned()
            .collect();

        let mut links = Vec::with_capacity(table.row_count());
        for i in 0..table.row_count() {
            let link_id = id_col
                .as_deref()
                .and_then(|c| table.cell(i, c))
                .map(value_to_string)
                .unwrap_or_else(|| format!("Link_{}", i + 1));

            let read_num = |col: &str, what: &str| -> Result<f64, String> {
                table
                    .cell(i, col)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| format!("第 {} 行 {what} 值无法解析", i + 2))
            };

            let fleet_mix = if share_columns.is_empty() {
                None
            } else {
                let mut shares = Map::new();
                for col in &share_columns {
                    if let Some(pct) = table.cell(i, col).and_then(Value::as_f64) {
                        shares.insert(share_column_stem(col), Value::from(pct));
                    }
                }
                self.normalize_fleet_mix(&Value::Object(shares)).await
            };

            links.push(LinkInput {
                link_id,
                link_length_km: read_num(&length_col, "长度")?,
                traffic_flow_vph: read_num(&flow_col, "流量")?,
                avg_speed_kph: read_num(&speed_col, "速度")?,
                fleet_mix,
            });
        }
        Ok((table, links))
    }

    fn write_result_workbook(
        &self,
        input_path: &str,
        outcome: &LinkOutcome,
        pollutants: &[String],
    ) -> Option<DownloadFile> {
        let mut columns = vec!["link_id".to_string()];
        for pollutant in pollutants {
            columns.push(format!("{pollutant}_kg_h"));
            columns.push(format!("{pollutant}_g_veh_km"));
        }

        let mut rows = Vec::with_capacity(outcome.results.len());
        for link in &outcome.results {
            let mut cells = vec![Value::from(link.link_id.clone())];
            for pollutant in pollutants {
                cells.push(Value::from(
                    link.total_emissions_kg_per_hr
                        .get(pollutant)
                        .copied()
                        .unwrap_or(0.0),
                ));
                cells.push(Value::from(
                    link.emission_rates_g_per_veh_km
                        .get(pollutant)
                        .copied()
                        .unwrap_or(0.0),
                ));
            }
            rows.push(cells);
        }

        let (path, filename) =
            vema_tables::stamped_output_path(Path::new(input_path), &self.outputs_dir);
        match vema_tables::write_xlsx(&path, &columns, &rows) {
            Ok(()) => Some(DownloadFile {
                path: path.display().to_string(),
                filename,
            }),
            Err(e) => {
                warn!(error = %e, "failed to write macro result workbook");
                None
            }
        }
    }
}

#[async_trait]
impl Tool for MacroEmissionTool {
    fn name(&self) -> &str {
        "calculate_macro_emission"
    }

    fn description(&self) -> &str {
        "Calculate road link emissions from traffic data (length + flow + speed). \
         Use file_path for uploaded files."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to road link data file."
                },
                "links_data": {
                    "type": "array",
                    "items": {"type": "object"},
                    "description": "Road link data array. Each link should have 'link_length_km', 'traffic_flow_vph', 'avg_speed_kph'. Use this if user provides data directly."
                },
                "pollutants": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "List of pollutants to calculate."
                },
                "fleet_mix": {
                    "type": "object",
                    "description": "Fleet composition (vehicle type percentages). Optional, uses default if not provided."
                },
                "model_year": {
                    "type": "integer",
                    "description": "Vehicle model year."
                },
                "season": {
                    "type": "string",
                    "description": "Season. Optional."
                }
            },
            "required": []
        })
    }

    async fn execute(&self, params: Value) -> ToolResult {
        let pollutants: Vec<String> = params
            .get("pollutants")
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| DEFAULT_POLLUTANTS.iter().map(|s| s.to_string()).collect());
        let model_year = params
            .get("model_year")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_MODEL_YEAR);
        let season = params
            .get("season")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_SEASON)
            .to_string();
        let file_path = params
            .get("file_path")
            .or_else(|| params.get("input_file"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let global_fleet_mix = match params.get("fleet_mix") {
            Some(raw) => self.normalize_fleet_mix(raw).await,
            None => None,
        };
        let default_fleet_mix = match params.get("default_fleet_mix") {
            Some(raw) => self.normalize_fleet_mix(raw).await,
            None => None,
        };

        let mut links: Vec<LinkInput> = if let Some(path) = &file_path {
            match self.read_links_file(path).await {
                Ok((_, links)) => links,
                Err(e) => {
                    return ToolResult::error_with_data(
                        format!("Failed to read input file: {e}"),
                        serde_json::json!({ "input_file": path }),
                    )
                }
            }
        } else {
            match params.get("links_data").and_then(Value::as_array) {
                Some(rows) if !rows.is_empty() => {
                    match self.parse_links_rows(rows).await {
                        Ok(links) => links,
                        Err(e) => return ToolResult::error(e),
                    }
                }
                _ => {
                    return ToolResult::error(
                        "Missing required parameter: links_data or file_path",
                    )
                }
            }
        };

        // A top-level fleet mix fills in links that lack their own.
        if let Some(global) = &global_fleet_mix {
            let mut applied = 0;
            for link in &mut links {
                if link.fleet_mix.is_none() {
                    link.fleet_mix = Some(global.clone());
                    applied += 1;
                }
            }
            if applied > 0 {
                info!(applied, "applied global fleet_mix to links without one");
            }
        }

        let outcome = match self.calculator.calculate(
            &links,
            &pollutants,
            model_year as i32,
            &season,
            default_fleet_mix.as_ref(),
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                return ToolResult::error_with_data(
                    e.to_string(),
                    serde_json::json!({
                        "query_params": {
                            "pollutants": pollutants,
                            "model_year": model_year,
                            "season": season,
                            "links_count": links.len(),
                        }
                    }),
                )
            }
        };

        let download_file = file_path
            .as_deref()
            .and_then(|path| self.write_result_workbook(path, &outcome, &pollutants));

        let summary = build_summary(model_year, &season, &pollutants, &outcome);

        let mut data = serde_json::json!({
            "query_info": {
                "links_count": outcome.results.len(),
                "model_year": model_year,
                "season": season,
                "pollutants": pollutants,
            },
            "results": outcome.results,
            "summary": outcome.summary,
        });
        if let Some(df) = &download_file {
            data["download_file"] = serde_json::to_value(df).unwrap_or(Value::Null);
        }

        let mut result = ToolResult::success(data, summary);
        result.download_file = download_file;
        result
    }
}

impl MacroEmissionTool {
    async fn parse_links_rows(&self, rows: &[Value]) -> Result<Vec<LinkInput>, String> {
        let mut links = Vec::with_capacity(rows.len());
        for (i, raw) in rows.iter().enumerate() {
            let row = fix_common_errors(raw);
            let num = |key: &str| row.get(key).and_then(Value::as_f64);

            let link_id = row
                .get("link_id")
                .map(value_to_string)
                .unwrap_or_else(|| format!("Link_{}", i + 1));
            let link_length_km = num("link_length_km")
                .ok_or_else(|| format!("links_data 第 {} 项缺少 link_length_km", i + 1))?;
            let traffic_flow_vph = num("traffic_flow_vph")
                .ok_or_else(|| format!("links_data 第 {} 项缺少 traffic_flow_vph", i + 1))?;
            let avg_speed_kph = num("avg_speed_kph")
                .ok_or_else(|| format!("links_data 第 {} 项缺少 avg_speed_kph", i + 1))?;

            let fleet_mix = match row.get("fleet_mix") {
                Some(raw_mix) => self.normalize_fleet_mix(raw_mix).await,
                None => None,
            };

            links.push(LinkInput {
                link_id,
                link_length_km,
                traffic_flow_vph,
                avg_speed_kph,
                fleet_mix,
            });
        }
        Ok(links)
    }
}

/// Repair the field-name mistakes models commonly make when passing links.
fn fix_common_errors(raw: &Value) -> Map<String, Value> {
    const FIELD_ALIASES: [(&str, &[&str]); 5] = [
        ("link_length_km", &["length", "link_length", "length_km", "road_length"]),
        ("traffic_flow_vph", &["traffic_volume_veh_h", "traffic_flow", "flow", "volume", "traffic_volume", "flow_vph"]),
        ("avg_speed_kph", &["avg_speed_kmh", "speed", "avg_speed", "average_speed", "speed_kph"]),
        ("fleet_mix", &["vehicle_composition", "vehicle_mix", "composition", "fleet_composition"]),
        ("link_id", &["id", "road_id", "segment_id"]),
    ];

    let source = match raw.as_object() {
        Some(obj) => obj,
        None => return Map::new(),
    };

    let mut fixed = Map::new();
    for (correct, aliases) in FIELD_ALIASES {
        if let Some(v) = source.get(correct) {
            fixed.insert(correct.to_string(), v.clone());
        } else if let Some((alias, v)) = aliases
            .iter()
            .find_map(|a| source.get(*a).map(|v| (*a, v)))
        {
            info!(from = alias, to = correct, "auto-fixed link field name");
            fixed.insert(correct.to_string(), v.clone());
        }
    }
    fixed
}

/// Accept fleet mixes both as an object (`{"car": 60}`) and as an array of
/// `{vehicle_type|type, percentage}` items.
fn fleet_entries(raw: &Value) -> Option<Vec<(String, f64)>> {
    match raw {
        Value::Object(map) => Some(
            map.iter()
                .filter_map(|(k, v)| v.as_f64().map(|pct| (k.clone(), pct)))
                .collect(),
        ),
        Value::Array(items) => {
            let entries: Vec<(String, f64)> = items
                .iter()
                .filter_map(|item| {
                    let name = item
                        .get("vehicle_type")
                        .or_else(|| item.get("type"))
                        .and_then(Value::as_str)?;
                    let pct = item.get("percentage").and_then(Value::as_f64)?;
                    Some((name.to_string(), pct))
                })
                .collect();
            if entries.is_empty() {
                None
            } else {
                info!("auto-fixed fleet_mix format: array -> object");
                Some(entries)
            }
        }
        _ => None,
    }
}

fn is_share_column(name: &str) -> bool {
    let lower = name.to_lowercase();
    name.ends_with('%') || lower.contains("pct") || lower.contains("share") || name.contains("占比")
}

fn share_column_stem(name: &str) -> String {
    let mut stem = name.trim_end_matches('%').to_string();
    for suffix in ["_pct", "pct", "_share", "share", "占比"] {
        if let Some(stripped) = stem.to_lowercase().strip_suffix(suffix) {
            stem = stem[..stripped.len()].to_string();
            break;
        }
    }
    stem.trim_matches(['_', ' ']).to_string()
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_summary(
    model_year: i64,
    season: &str,
    pollutants: &[String],
    outcome: &LinkOutcome,
) -> String {
    let summary = &outcome.summary;
    let mut parts = vec![
        "已完成宏观排放计算".to_string(),
        "**计算参数:**".to_string(),
        format!("  - 路段数: {}", summary.links_count),
        format!("  - 年份: {model_year}"),
        format!("  - 季节: {season}"),
        format!("  - 污染物: {}", pollutants.join(", ")),
    ];

    if !summary.total_emissions_kg_per_hr.is_empty() {
        parts.push("**总排放量:**".to_string());
        for (pollutant, kg_per_hr) in &summary.total_emissions_kg_per_hr {
            parts.push(format!(
                "  - {pollutant}: {}",
                format_emission_hourly(kg_per_hr * 1000.0)
            ));
        }
    }

    if !summary.avg_rates_g_per_veh_km.is_empty() {
        parts.push("**平均单位排放:**".to_string());
        for (pollutant, rate) in &summary.avg_rates_g_per_veh_km {
            parts.push(format!("  - {pollutant}: {rate:.2} g/(veh·km)"));
        }
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vema_calc::{AverageSpeedLinkCalculator, ParametricFactorSource};
    use vema_core::config::StandardizerConfig;
    use vema_core::mappings::Mappings;

    fn tool(outputs: &Path) -> MacroEmissionTool {
        let standardizer = Arc::new(Standardizer::new(
            Arc::new(Mappings::builtin()),
            &StandardizerConfig::default(),
        ));
        let calculator = Arc::new(AverageSpeedLinkCalculator::new(Arc::new(
            ParametricFactorSource,
        )));
        MacroEmissionTool::new(calculator, standardizer, outputs)
    }

    #[tokio::test]
    async fn inline_links_with_field_name_repair() {
        let dir = tempfile::tempdir().unwrap();
        let result = tool(dir.path())
            .execute(serde_json::json!({
                "links_data": [
                    {"id": "L1", "length": 2.5, "flow": 5000, "speed": 60}
                ],
                "pollutants": ["CO2"]
            }))
            .await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.data["query_info"]["links_count"], 1);
        assert!(result.data["summary"]["total_emissions_kg_per_hr"]["CO2"]
            .as_f64()
            .unwrap()
            > 0.0);
    }

    #[tokio::test]
    async fn over_100_fleet_mix_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path());
        let mix = t
            .normalize_fleet_mix(&serde_json::json!({"car": 60.0, "bus": 30.0, "truck": 20.0}))
            .await
            .unwrap();

        let sum: f64 = mix.values().sum();
        assert!((sum - 100.0).abs() < 1e-9);
        assert!((mix["Passenger Car"] - 60.0 * 100.0 / 110.0).abs() < 1e-6);
        assert!(mix.contains_key("Transit Bus"));
        assert!(mix.contains_key("Light Commercial Truck"));
    }

    #[tokio::test]
    async fn array_shaped_fleet_mix_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path());
        let mix = t
            .normalize_fleet_mix(&serde_json::json!([
                {"vehicle_type": "小汽车", "percentage": 70.0},
                {"type": "公交车", "percentage": 30.0}
            ]))
            .await
            .unwrap();
        assert_eq!(mix.len(), 2);
        assert!((mix["Passenger Car"] - 70.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn file_input_with_share_columns() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("links.csv");
        let mut f = std::fs::File::create(&input).unwrap();
        writeln!(f, "link_id,length_km,flow_vph,speed_kph,car_pct,bus_pct,truck_pct").unwrap();
        writeln!(f, "L1,2.5,5000,60,60,30,20").unwrap();
        writeln!(f, "L2,1.8,3500,45,60,30,20").unwrap();
        drop(f);

        let outputs = dir.path().join("outputs");
        let result = tool(&outputs)
            .execute(serde_json::json!({
                "file_path": input.display().to_string(),
                "pollutants": ["CO2", "NOx"]
            }))
            .await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.data["query_info"]["links_count"], 2);
        let download = result.download_file.expect("download expected");
        assert!(download.filename.ends_with(".xlsx"));
        assert!(Path::new(&download.path).exists());

        let written = vema_tables::read_table(Path::new(&download.path)).unwrap();
        assert!(written.columns.contains(&"CO2_kg_h".to_string()));
        assert!(written.columns.contains(&"NOx_g_veh_km".to_string()));
    }

    #[tokio::test]
    async fn global_fleet_mix_fills_links_without_one() {
        let dir = tempfile::tempdir().unwrap();
        let result = tool(dir.path())
            .execute(serde_json::json!({
                "links_data": [
                    {"link_id": "L1", "link_length_km": 1.0, "traffic_flow_vph": 1000, "avg_speed_kph": 50}
                ],
                "fleet_mix": {"公交车": 100.0},
                "pollutants": ["NOx"]
            }))
            .await;
        assert!(result.success, "error: {:?}", result.error);

        // A bus-only mix must emit more NOx than the default passenger-car mix.
        let default_result = tool(dir.path())
            .execute(serde_json::json!({
                "links_data": [
                    {"link_id": "L1", "link_length_km": 1.0, "traffic_flow_vph": 1000, "avg_speed_kph": 50}
                ],
                "pollutants": ["NOx"]
            }))
            .await;
        let bus = result.data["summary"]["total_emissions_kg_per_hr"]["NOx"]
            .as_f64()
            .unwrap();
        let car = default_result.data["summary"]["total_emissions_kg_per_hr"]["NOx"]
            .as_f64()
            .unwrap();
        assert!(bus > car);
    }

    #[tokio::test]
    async fn missing_links_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = tool(dir.path()).execute(serde_json::json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("links_data or file_path"));
    }
}
