//! Tool: calculate_micro_emission. Per-second emissions over a trajectory.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use vema_calc::{TrajectoryCalculator, TrajectoryOutcome, TrajectoryPoint};
use vema_standardizer::Standardizer;
use vema_tables::Table;

use crate::format::format_emission;

use super::{DownloadFile, Tool, ToolResult};

const DEFAULT_POLLUTANTS: [&str; 2] = ["CO2", "NOx"];
const DEFAULT_MODEL_YEAR: i64 = 2020;
const DEFAULT_SEASON: &str = "夏季";

pub struct MicroEmissionTool {
    calculator: Arc<dyn TrajectoryCalculator>,
    standardizer: Arc<Standardizer>,
    outputs_dir: std::path::PathBuf,
}

impl MicroEmissionTool {
    pub fn new(
        calculator: Arc<dyn TrajectoryCalculator>,
        standardizer: Arc<Standardizer>,
        outputs_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            calculator,
            standardizer,
            outputs_dir: outputs_dir.into(),
        }
    }

    /// Read a trajectory file and map its columns onto the standard fields.
    fn read_trajectory_file(&self, path: &str) -> Result<(Table, Vec<TrajectoryPoint>), String> {
        let table = vema_tables::read_table(Path::new(path)).map_err(|e| e.to_string())?;
        let mapping = self
            .standardizer
            .map_columns(&table.columns, "micro_emission");

        let required = self.standardizer.get_required_columns("micro_emission");
        let missing: Vec<&String> = required
            .iter()
            .filter(|std_name| !mapping.values().any(|v| v == *std_name))
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "缺少必需列: {}。已识别列: {:?}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                table.columns
            ));
        }

        // Invert to standard -> original for cell access.
        let col_for = |standard: &str| -> Option<String> {
            mapping
                .iter()
                .find(|(_, v)| v.as_str() == standard)
                .map(|(k, _)| k.clone())
        };
        let t_col = col_for("t").expect("required column checked above");
        let speed_col = col_for("speed_kph").expect("required column checked above");
        let accel_col = col_for("acceleration_mps2");
        let grade_col = col_for("grade_pct");

        let mut points = Vec::with_capacity(table.row_count());
        for (i, _) in table.rows.iter().enumerate() {
            let t = table
                .cell(i, &t_col)
                .and_then(Value::as_f64)
                .unwrap_or(i as f64);
            let speed_kph = match table.cell(i, &speed_col).and_then(Value::as_f64) {
                Some(v) => v,
                None => return Err(format!("第 {} 行速度值无法解析", i + 2)),
            };
            points.push(TrajectoryPoint {
                t,
                speed_kph,
                acceleration_mps2: accel_col
                    .as_deref()
                    .and_then(|c| table.cell(i, c))
                    .and_then(Value::as_f64),
                grade_pct: grade_col
                    .as_deref()
                    .and_then(|c| table.cell(i, c))
                    .and_then(Value::as_f64),
            });
        }
        Ok((table, points))
    }

    /// Augment the input table with VSP and per-pollutant gram columns and
    /// write it under the outputs directory.
    fn write_result_workbook(
        &self,
        input_path: &str,
        table: &Table,
        outcome: &TrajectoryOutcome,
        pollutants: &[String],
    ) -> Option<DownloadFile> {
        let mut columns = table.columns.clone();
        columns.push("VSP".to_string());
        columns.push("opMode".to_string());
        for pollutant in pollutants {
            columns.push(format!("{pollutant}_g"));
        }

        let mut rows = Vec::with_capacity(table.rows.len());
        for (i, row) in table.rows.iter().enumerate() {
            let mut cells = row.clone();
            if let Some(result) = outcome.results.get(i) {
                cells.push(Value::from(result.vsp));
                cells.push(Value::from(result.op_mode));
                for pollutant in pollutants {
                    cells.push(Value::from(
                        result.emissions.get(pollutant).copied().unwrap_or(0.0),
                    ));
                }
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
                warn!(error = %e, "failed to write micro result workbook");
                None
            }
        }
    }
}

#[async_trait]
impl Tool for MicroEmissionTool {
    fn name(&self) -> &str {
        "calculate_micro_emission"
    }

    fn description(&self) -> &str {
        "Calculate second-by-second emissions from vehicle trajectory data (time + speed). \
         Use file_path for uploaded files."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to trajectory data file. REQUIRED when user uploaded a file. You will see this path in the file context."
                },
                "trajectory_data": {
                    "type": "array",
                    "items": {"type": "object"},
                    "description": "Trajectory data array. Each point should have 't' (time in seconds) and 'speed_kph' (speed in km/h). Use this if user provides data directly."
                },
                "vehicle_type": {
                    "type": "string",
                    "description": "Vehicle type. Pass user's original expression. REQUIRED."
                },
                "pollutants": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "List of pollutants to calculate. Defaults to [CO2, NOx] if not provided."
                },
                "model_year": {
                    "type": "integer",
                    "description": "Vehicle model year. Defaults to 2020 if not provided."
                },
                "season": {
                    "type": "string",
                    "description": "Season. Optional."
                }
            },
            "required": ["vehicle_type"]
        })
    }

    async fn execute(&self, params: Value) -> ToolResult {
        let vehicle_type = match params.get("vehicle_type").and_then(Value::as_str) {
            Some(v) => v.to_string(),
            None => return ToolResult::missing_params(&["vehicle_type"]),
        };
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

        let mut source_table: Option<Table> = None;
        let points: Vec<TrajectoryPoint> = if let Some(path) = &file_path {
            match self.read_trajectory_file(path) {
                Ok((table, points)) => {
                    source_table = Some(table);
                    points
                }
                Err(e) => {
                    return ToolResult::error_with_data(
                        format!("Failed to read input file: {e}"),
                        serde_json::json!({ "input_file": path }),
                    )
                }
            }
        } else {
            match params.get("trajectory_data").and_then(Value::as_array) {
                Some(rows) if !rows.is_empty() => match parse_trajectory_rows(rows) {
                    Ok(points) => points,
                    Err(e) => return ToolResult::error(e),
                },
                _ => {
                    return ToolResult::error(
                        "Missing required parameter: trajectory_data or file_path",
                    )
                }
            }
        };

        let outcome = match self.calculator.calculate(
            &points,
            &vehicle_type,
            &pollutants,
            model_year as i32,
            &season,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                return ToolResult::error_with_data(
                    e.to_string(),
                    serde_json::json!({
                        "query_params": {
                            "vehicle_type": vehicle_type,
                            "pollutants": pollutants,
                            "model_year": model_year,
                            "season": season,
                            "trajectory_points": points.len(),
                        }
                    }),
                )
            }
        };

        let download_file = match (&file_path, &source_table) {
            (Some(path), Some(table)) => {
                self.write_result_workbook(path, table, &outcome, &pollutants)
            }
            _ => None,
        };

        let summary = build_summary(&vehicle_type, model_year, &season, &pollutants, &outcome);

        let mut data = serde_json::json!({
            "query_info": {
                "vehicle_type": vehicle_type,
                "model_year": model_year,
                "season": season,
                "pollutants": pollutants,
                "trajectory_points": outcome.results.len(),
            },
            "results": outcome.results,
            "summary": outcome.summary,
        });
        if let Some(df) = &download_file {
            data["download_file"] = serde_json::to_value(df).unwrap_or(Value::Null);
        }

        info!(
            points = outcome.results.len(),
            has_download = download_file.is_some(),
            "micro emission calculation complete"
        );

        let mut result = ToolResult::success(data, summary);
        result.download_file = download_file;
        result
    }
}

fn parse_trajectory_rows(rows: &[Value]) -> Result<Vec<TrajectoryPoint>, String> {
    let mut points = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let t = row
            .get("t")
            .or_else(|| row.get("time"))
            .and_then(Value::as_f64)
            .unwrap_or(i as f64);
        let speed_kph = row
            .get("speed_kph")
            .or_else(|| row.get("speed"))
            .and_then(Value::as_f64)
            .ok_or_else(|| format!("trajectory_data 第 {} 项缺少 speed_kph", i + 1))?;
        points.push(TrajectoryPoint {
            t,
            speed_kph,
            acceleration_mps2: row
                .get("acceleration_mps2")
                .or_else(|| row.get("acceleration"))
                .and_then(Value::as_f64),
            grade_pct: row
                .get("grade_pct")
                .or_else(|| row.get("grade"))
                .and_then(Value::as_f64),
        });
    }
    Ok(points)
}

fn build_summary(
    vehicle_type: &str,
    model_year: i64,
    season: &str,
    pollutants: &[String],
    outcome: &TrajectoryOutcome,
) -> String {
    let summary = &outcome.summary;
    let mut parts = vec![
        "已完成微观排放计算".to_string(),
        "**计算参数:**".to_string(),
        format!("  - 车型: {vehicle_type} ({model_year}年)"),
        format!("  - 季节: {season}"),
        format!("  - 污染物: {}", pollutants.join(", ")),
        format!("  - 轨迹数据点: {} 个", outcome.results.len()),
    ];

    if !summary.total_emissions_g.is_empty() {
        parts.push("**总排放量:**".to_string());
        for (pollutant, grams) in &summary.total_emissions_g {
            parts.push(format!("  - {pollutant}: {}", format_emission(*grams)));
        }
    }

    if summary.total_distance_km > 0.0 {
        parts.push("**运行统计:**".to_string());
        parts.push(format!("  - 总距离: {:.2} km", summary.total_distance_km));
        parts.push(format!(
            "  - 总时间: {} 秒 ({:.1} 分钟)",
            summary.total_time_s,
            summary.total_time_s / 60.0
        ));
        parts.push(format!("  - 平均速度: {:.1} km/h", summary.avg_speed_kph));
    }

    if !summary.emission_rates_g_per_km.is_empty() {
        parts.push("**排放率:**".to_string());
        for (pollutant, rate) in &summary.emission_rates_g_per_km {
            parts.push(format!("  - {pollutant}: {rate:.2} g/km"));
        }
    }

    parts.join("\n")
}
