//! Extraction of chart, table, and download payloads from tool results.

use serde_json::{Map, Value};

use crate::executor::ExecutedTool;
use crate::tools::DownloadFile;

const MAX_PREVIEW_ROWS: usize = 4;
const MILES_PER_KM: f64 = 1.60934;

pub struct ExecutedRecord {
    pub id: String,
    pub name: String,
    pub result: ExecutedTool,
}

/// First explicit `chart_data`, else a synthesized emission-factors payload.
pub fn extract_chart_data(records: &[ExecutedRecord]) -> Option<Value> {
    for record in records {
        if let Some(chart) = &record.result.chart_data {
            return Some(chart.clone());
        }
        if record.name == "query_emission_factors" && record.result.success {
            if let Some(chart) = factors_chart(&record.result.data) {
                return Some(chart);
            }
        }
    }
    None
}

/// Chart payload for the frontend: `{type: "emission_factors", vehicle_type,
/// model_year, pollutants: {name -> {curve, unit}}, metadata}` with the
/// g/mile speed curves converted to g/km.
fn factors_chart(data: &Value) -> Option<Value> {
    if let Some(pollutants) = data.get("pollutants").and_then(Value::as_object) {
        let mut formatted = Map::new();
        for (name, pol_data) in pollutants {
            formatted.insert(
                name.clone(),
                serde_json::json!({
                    "curve": convert_curve(pol_data.get("speed_curve")),
                    "unit": "g/km",
                }),
            );
        }
        return Some(serde_json::json!({
            "type": "emission_factors",
            "vehicle_type": data.get("vehicle_type").cloned().unwrap_or(Value::from("Unknown")),
            "model_year": data.get("model_year").cloned().unwrap_or(Value::from(2020)),
            "pollutants": formatted,
            "metadata": data.get("metadata").cloned().unwrap_or_else(|| Value::Object(Map::new())),
        }));
    }

    if data.get("speed_curve").is_some() {
        let qs = data.get("query_summary").cloned().unwrap_or(Value::Null);
        let pollutant = qs
            .get("pollutant")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let mut pollutants = Map::new();
        pollutants.insert(
            pollutant,
            serde_json::json!({
                "curve": convert_curve(data.get("speed_curve")),
                "unit": "g/km",
            }),
        );
        return Some(serde_json::json!({
            "type": "emission_factors",
            "vehicle_type": qs.get("vehicle_type").cloned().unwrap_or(Value::from("Unknown")),
            "model_year": qs.get("model_year").cloned().unwrap_or(Value::from(2020)),
            "pollutants": pollutants,
            "metadata": {
                "data_source": data.get("data_source").cloned().unwrap_or(Value::from("")),
                "speed_range": data.get("speed_range").cloned().unwrap_or_else(|| Value::Object(Map::new())),
                "data_points": data.get("data_points").cloned().unwrap_or(Value::from(0)),
            },
        }));
    }

    None
}

/// g/mile speed_curve points -> g/km curve points.
fn convert_curve(speed_curve: Option<&Value>) -> Vec<Value> {
    speed_curve
        .and_then(Value::as_array)
        .map(|points| {
            points
                .iter()
                .map(|p| {
                    let rate = p.get("emission_rate").and_then(Value::as_f64).unwrap_or(0.0);
                    serde_json::json!({
                        "speed_kph": p.get("speed_kph").cloned().unwrap_or(Value::from(0.0)),
                        "emission_rate": round4(rate / MILES_PER_KM),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Preview table for the frontend renderer.
pub fn extract_table_data(records: &[ExecutedRecord]) -> Option<Value> {
    for record in records {
        if let Some(table) = &record.result.table_data {
            return Some(table.clone());
        }
        if record.name == "query_emission_factors" && record.result.success {
            if let Some(table) = factors_table(&record.result.data) {
                return Some(table);
            }
        }
        if matches!(
            record.name.as_str(),
            "calculate_micro_emission" | "calculate_macro_emission"
        ) {
            if let Some(table) = calculation_table(&record.name, &record.result.data) {
                return Some(table);
            }
        }
    }
    None
}

/// Key-point preview of the factor curve, sampled at a fixed stride.
fn factors_table(data: &Value) -> Option<Value> {
    if let Some(pollutants) = data.get("pollutants").and_then(Value::as_object) {
        let first_data = pollutants.values().next()?;
        let curve = first_data.get("speed_curve").and_then(Value::as_array)?;
        if curve.is_empty() {
            return None;
        }

        let step = (curve.len() / MAX_PREVIEW_ROWS).max(1);
        let indices: Vec<usize> = (0..curve.len())
            .step_by(step)
            .take(MAX_PREVIEW_ROWS)
            .collect();

        let mut columns = vec!["速度 (km/h)".to_string()];
        for name in pollutants.keys() {
            columns.push(format!("{name} (g/km)"));
        }

        let mut preview_rows = Vec::new();
        for &idx in &indices {
            let mut row = Map::new();
            let speed = curve[idx]
                .get("speed_kph")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            row.insert("速度 (km/h)".to_string(), Value::from(format!("{speed:.1}")));
            for (name, pol_data) in pollutants {
                if let Some(point) = pol_data
                    .get("speed_curve")
                    .and_then(Value::as_array)
                    .and_then(|c| c.get(idx))
                {
                    let rate = point
                        .get("emission_rate")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0)
                        / MILES_PER_KM;
                    row.insert(format!("{name} (g/km)"), Value::from(format!("{rate:.4}")));
                }
            }
            preview_rows.push(Value::Object(row));
        }

        return Some(serde_json::json!({
            "type": "query_emission_factors",
            "columns": columns,
            "preview_rows": preview_rows,
            "total_rows": curve.len(),
            "total_columns": columns.len(),
            "summary": {
                "vehicle_type": data.get("vehicle_type").cloned().unwrap_or(Value::from("Unknown")),
                "model_year": data.get("model_year").cloned().unwrap_or(Value::from(2020)),
                "season": data.pointer("/metadata/season").cloned().unwrap_or(Value::from("")),
                "road_type": data.pointer("/metadata/road_type").cloned().unwrap_or(Value::from("")),
            },
        }));
    }

    if let Some(curve) = data.get("speed_curve").and_then(Value::as_array) {
        if curve.is_empty() {
            return None;
        }
        let pollutant = data
            .pointer("/query_summary/pollutant")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();

        let step = (curve.len() / MAX_PREVIEW_ROWS).max(1);
        let rate_col = format!("{pollutant} (g/km)");
        let preview_rows: Vec<Value> = curve
            .iter()
            .step_by(step)
            .take(MAX_PREVIEW_ROWS)
            .map(|p| {
                let speed = p.get("speed_kph").and_then(Value::as_f64).unwrap_or(0.0);
                let rate =
                    p.get("emission_rate").and_then(Value::as_f64).unwrap_or(0.0) / MILES_PER_KM;
                let mut row = Map::new();
                row.insert("速度 (km/h)".to_string(), Value::from(format!("{speed:.1}")));
                row.insert(rate_col.clone(), Value::from(format!("{rate:.4}")));
                Value::Object(row)
            })
            .collect();

        return Some(serde_json::json!({
            "type": "query_emission_factors",
            "columns": ["速度 (km/h)", rate_col],
            "preview_rows": preview_rows,
            "total_rows": curve.len(),
            "total_columns": 2,
            "summary": data.get("query_summary").cloned().unwrap_or(Value::Null),
        }));
    }

    None
}

/// Preview rows for the calculators: the calculation's key columns, with
/// macro preferring output columns over raw inputs.
fn calculation_table(tool_name: &str, data: &Value) -> Option<Value> {
    let results = data.get("results").and_then(Value::as_array);
    let summary = data.get("summary").cloned().unwrap_or(Value::Null);

    let results = match results {
        Some(r) if !r.is_empty() => r,
        _ => {
            // No detail rows: at least show the totals.
            let totals = summary
                .get("total_emissions_g")
                .or_else(|| summary.get("total_emissions_kg_per_hr"))
                .and_then(Value::as_object)?;
            let preview_rows: Vec<Value> = totals
                .iter()
                .map(|(k, v)| {
                    serde_json::json!({
                        "指标": k,
                        "数值": format!("{:.2} g", v.as_f64().unwrap_or(0.0)),
                    })
                })
                .collect();
            return Some(serde_json::json!({
                "type": tool_name,
                "columns": ["指标", "数值"],
                "preview_rows": preview_rows,
                "total_rows": totals.len(),
                "total_columns": 2,
                "summary": summary,
            }));
        }
    };

    let (columns, preview_rows) = if tool_name == "calculate_micro_emission" {
        let first = &results[0];
        let mut columns = vec!["t".to_string(), "speed_kph".to_string()];
        if first.get("acceleration_mps2").is_some() {
            columns.push("acceleration_mps2".to_string());
        }
        columns.push("VSP".to_string());
        columns.push("opMode".to_string());
        if let Some(emissions) = first.get("emissions").and_then(Value::as_object) {
            columns.extend(emissions.keys().cloned());
        }

        let preview_rows: Vec<Value> = results
            .iter()
            .take(MAX_PREVIEW_ROWS)
            .map(|r| {
                let mut row = Map::new();
                row.insert("t".to_string(), r.get("t").cloned().unwrap_or(Value::from("")));
                row.insert(
                    "speed_kph".to_string(),
                    Value::from(format!(
                        "{:.1}",
                        r.get("speed_kph").and_then(Value::as_f64).unwrap_or(0.0)
                    )),
                );
                if let Some(a) = r.get("acceleration_mps2").and_then(Value::as_f64) {
                    row.insert("acceleration_mps2".to_string(), Value::from(format!("{a:.2}")));
                }
                if let Some(vsp) = r.get("vsp").and_then(Value::as_f64) {
                    row.insert("VSP".to_string(), Value::from(format!("{vsp:.2}")));
                }
                if let Some(op) = r.get("op_mode").and_then(Value::as_u64) {
                    row.insert("opMode".to_string(), Value::from(op));
                }
                if let Some(emissions) = r.get("emissions").and_then(Value::as_object) {
                    for (pol, grams) in emissions {
                        row.insert(
                            pol.clone(),
                            Value::from(format!("{:.4}", grams.as_f64().unwrap_or(0.0))),
                        );
                    }
                }
                Value::Object(row)
            })
            .collect();
        (columns, preview_rows)
    } else {
        let pollutants: Vec<String> = data
            .pointer("/query_info/pollutants")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["CO2".to_string()]);
        let main = pollutants.first().cloned().unwrap_or_else(|| "CO2".to_string());

        let mut columns = vec![
            "link_id".to_string(),
            format!("{main}_kg_h"),
            format!("{main}_g_veh_km"),
        ];
        if let Some(second) = pollutants.get(1) {
            columns.push(format!("{second}_kg_h"));
        }

        let preview_rows: Vec<Value> = results
            .iter()
            .take(MAX_PREVIEW_ROWS)
            .map(|r| {
                let total = r
                    .pointer(&format!("/total_emissions_kg_per_hr/{main}"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let rate = r
                    .pointer(&format!("/emission_rates_g_per_veh_km/{main}"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let mut row = Map::new();
                row.insert(
                    "link_id".to_string(),
                    r.get("link_id").cloned().unwrap_or(Value::from("")),
                );
                row.insert(format!("{main}_kg_h"), Value::from(format!("{total:.2}")));
                row.insert(format!("{main}_g_veh_km"), Value::from(format!("{rate:.2}")));
                if let Some(second) = pollutants.get(1) {
                    let second_total = r
                        .pointer(&format!("/total_emissions_kg_per_hr/{second}"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    row.insert(format!("{second}_kg_h"), Value::from(format!("{second_total:.2}")));
                }
                Value::Object(row)
            })
            .collect();
        (columns, preview_rows)
    };

    Some(serde_json::json!({
        "type": tool_name,
        "columns": columns,
        "preview_rows": preview_rows,
        "total_rows": results.len(),
        "total_columns": columns.len(),
        "summary": summary,
        "total_emissions": summary
            .get("total_emissions_g")
            .or_else(|| summary.get("total_emissions_kg_per_hr"))
            .cloned()
            .unwrap_or(Value::Null),
    }))
}

/// First non-empty download handle: the typed result slot, then
/// `data.download_file`, then the legacy `data.metadata.download_file`.
/// Bare path strings normalize to `{path, filename}`.
pub fn extract_download_file(records: &[ExecutedRecord]) -> Option<DownloadFile> {
    for record in records {
        if let Some(df) = &record.result.download_file {
            return Some(df.clone());
        }
        for location in [
            record.result.data.get("download_file"),
            record.result.data.pointer("/metadata/download_file"),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(df) = normalize_download(location) {
                return Some(df);
            }
        }
    }
    None
}

fn normalize_download(value: &Value) -> Option<DownloadFile> {
    match value {
        Value::String(path) if !path.is_empty() => Some(DownloadFile::from_path(path.clone())),
        Value::Object(_) => {
            let path = value.get("path").and_then(Value::as_str)?;
            let filename = value
                .get("filename")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| DownloadFile::from_path(path).filename);
            Some(DownloadFile {
                path: path.to_string(),
                filename,
            })
        }
        _ => None,
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, result: ExecutedTool) -> ExecutedRecord {
        ExecutedRecord {
            id: "call-1".to_string(),
            name: name.to_string(),
            result,
        }
    }

    fn factors_result(single: bool) -> ExecutedTool {
        let curve: Vec<Value> = (1..=8)
            .map(|i| {
                serde_json::json!({
                    "speed_mph": i * 10,
                    "speed_kph": (i * 10) as f64 * 1.60934,
                    "emission_rate": 160.934,
                })
            })
            .collect();

        let data = if single {
            serde_json::json!({
                "query_summary": {
                    "vehicle_type": "Passenger Car",
                    "pollutant": "CO2",
                    "model_year": 2020,
                    "season": "夏季",
                    "road_type": "快速路",
                },
                "speed_curve": curve,
                "data_points": 8,
                "unit": "g/mile",
                "data_source": "MOVES (Atlanta)",
                "speed_range": {"min_kph": 16.1, "max_kph": 128.7},
            })
        } else {
            serde_json::json!({
                "vehicle_type": "Passenger Car",
                "model_year": 2020,
                "pollutants": {"CO2": {"speed_curve": curve, "unit": "g/mile"}},
                "metadata": {"season": "夏季", "road_type": "快速路"},
            })
        };

        ExecutedTool {
            success: true,
            data,
            ..ExecutedTool::default()
        }
    }

    #[test]
    fn chart_synthesized_from_single_pollutant_factors() {
        let records = vec![record("query_emission_factors", factors_result(true))];
        let chart = extract_chart_data(&records).unwrap();
        assert_eq!(chart["type"], "emission_factors");
        assert_eq!(chart["vehicle_type"], "Passenger Car");
        // 160.934 g/mile == 100 g/km.
        let rate = chart["pollutants"]["CO2"]["curve"][0]["emission_rate"]
            .as_f64()
            .unwrap();
        assert!((rate - 100.0).abs() < 0.001);
        assert_eq!(chart["pollutants"]["CO2"]["unit"], "g/km");
    }

    #[test]
    fn chart_synthesized_from_multi_pollutant_factors() {
        let records = vec![record("query_emission_factors", factors_result(false))];
        let chart = extract_chart_data(&records).unwrap();
        assert_eq!(chart["metadata"]["season"], "夏季");
        assert!(chart["pollutants"]["CO2"]["curve"].as_array().unwrap().len() == 8);
    }

    #[test]
    fn explicit_chart_data_wins() {
        let mut result = factors_result(true);
        result.chart_data = Some(serde_json::json!({"type": "custom"}));
        let records = vec![record("query_emission_factors", result)];
        assert_eq!(extract_chart_data(&records).unwrap()["type"], "custom");
    }

    #[test]
    fn factors_table_samples_at_stride() {
        let records = vec![record("query_emission_factors", factors_result(true))];
        let table = extract_table_data(&records).unwrap();
        assert_eq!(table["type"], "query_emission_factors");
        let rows = table["preview_rows"].as_array().unwrap();
        assert!(rows.len() <= 4);
        assert_eq!(table["total_rows"], 8);
        let cols = table["columns"].as_array().unwrap();
        assert_eq!(cols[0], "速度 (km/h)");
        assert_eq!(cols[1], "CO2 (g/km)");
        // stride of 8/4 = 2: rows 0, 2, 4, 6.
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn micro_table_uses_calculation_columns() {
        let data = serde_json::json!({
            "query_info": {"pollutants": ["CO2"]},
            "results": [
                {"t": 0, "speed_kph": 30.0, "acceleration_mps2": 0.5, "vsp": 2.5, "op_mode": 4,
                 "emissions": {"CO2": 0.1234}},
                {"t": 1, "speed_kph": 31.0, "acceleration_mps2": 0.3, "vsp": 2.1, "op_mode": 4,
                 "emissions": {"CO2": 0.1301}}
            ],
            "summary": {"total_emissions_g": {"CO2": 0.25}},
        });
        let records = vec![record(
            "calculate_micro_emission",
            ExecutedTool {
                success: true,
                data,
                ..ExecutedTool::default()
            },
        )];
        let table = extract_table_data(&records).unwrap();
        assert_eq!(table["type"], "calculate_micro_emission");
        let columns: Vec<&str> = table["columns"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(columns.contains(&"VSP"));
        assert!(columns.contains(&"CO2"));
        assert_eq!(table["preview_rows"][0]["CO2"], "0.1234");
    }

    #[test]
    fn macro_table_prefers_output_columns() {
        let data = serde_json::json!({
            "query_info": {"pollutants": ["CO2", "NOx"]},
            "results": [
                {"link_id": "L1",
                 "total_emissions_kg_per_hr": {"CO2": 123.456, "NOx": 0.789},
                 "emission_rates_g_per_veh_km": {"CO2": 250.0, "NOx": 1.5}}
            ],
            "summary": {"total_emissions_kg_per_hr": {"CO2": 123.456, "NOx": 0.789}},
        });
        let records = vec![record(
            "calculate_macro_emission",
            ExecutedTool {
                success: true,
                data,
                ..ExecutedTool::default()
            },
        )];
        let table = extract_table_data(&records).unwrap();
        let columns: Vec<&str> = table["columns"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(columns, vec!["link_id", "CO2_kg_h", "CO2_g_veh_km", "NOx_kg_h"]);
        assert_eq!(table["preview_rows"][0]["CO2_kg_h"], "123.46");
    }

    #[test]
    fn download_handle_normalizes_bare_strings() {
        let result = ExecutedTool {
            success: true,
            data: serde_json::json!({"download_file": "/outputs/x_result_1.xlsx"}),
            ..ExecutedTool::default()
        };
        let records = vec![record("calculate_micro_emission", result)];
        let df = extract_download_file(&records).unwrap();
        assert_eq!(df.path, "/outputs/x_result_1.xlsx");
        assert_eq!(df.filename, "x_result_1.xlsx");
    }

    #[test]
    fn typed_download_slot_wins_over_data() {
        let result = ExecutedTool {
            success: true,
            download_file: Some(DownloadFile {
                path: "/outputs/a.xlsx".to_string(),
                filename: "a.xlsx".to_string(),
            }),
            data: serde_json::json!({"download_file": "/outputs/b.xlsx"}),
            ..ExecutedTool::default()
        };
        let records = vec![record("calculate_micro_emission", result)];
        assert_eq!(extract_download_file(&records).unwrap().filename, "a.xlsx");
    }

    #[test]
    fn no_download_returns_none() {
        let records = vec![record(
            "analyze_file",
            ExecutedTool {
                success: true,
                data: serde_json::json!({}),
                ..ExecutedTool::default()
            },
        )];
        assert!(extract_download_file(&records).is_none());
    }
}
