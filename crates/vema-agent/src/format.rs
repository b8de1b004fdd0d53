//! Deterministic result rendering: multi-unit emission formatting and the
//! Markdown renderers used instead of LLM synthesis for single-tool turns.

use serde_json::Value;

/// Format grams with an automatic unit ladder (g -> kg -> 吨).
pub fn format_emission(value_g: f64) -> String {
    if value_g >= 1_000_000.0 {
        format!("{:.2} 吨 ({:.2} kg)", value_g / 1_000_000.0, value_g / 1000.0)
    } else if value_g >= 1000.0 {
        format!("{:.2} kg ({:.2} g)", value_g / 1000.0, value_g)
    } else {
        format!("{value_g:.2} g")
    }
}

/// Hourly rates additionally show the per-day figure.
pub fn format_emission_hourly(value_g_per_hr: f64) -> String {
    let per_day = value_g_per_hr * 24.0;
    format!(
        "{}/小时 ({}/天)",
        format_emission(value_g_per_hr),
        format_emission(per_day)
    )
}

fn str_of<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("未知")
}

fn num_of(v: &Value, key: &str) -> f64 {
    v.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn pollutant_list(v: &Value, key: &str) -> String {
    let joined = v
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    if joined.is_empty() {
        "未知".to_string()
    } else {
        joined
    }
}

/// Stable Markdown for a successful micro-emission calculation.
pub fn render_micro_success(data: &Value) -> String {
    let query_info = data.get("query_info").cloned().unwrap_or(Value::Null);
    let summary = data.get("summary").cloned().unwrap_or(Value::Null);

    let mut lines = vec![
        "## 微观排放计算结果".to_string(),
        String::new(),
        "**计算参数**".to_string(),
        format!("- 车型: {}", str_of(&query_info, "vehicle_type")),
        format!(
            "- 年份: {}",
            query_info
                .get("model_year")
                .and_then(Value::as_i64)
                .map(|y| y.to_string())
                .unwrap_or_else(|| "未知".to_string())
        ),
        format!("- 季节: {}", str_of(&query_info, "season")),
        format!("- 污染物: {}", pollutant_list(&query_info, "pollutants")),
        format!(
            "- 轨迹点数: {}",
            query_info
                .get("trajectory_points")
                .and_then(Value::as_u64)
                .unwrap_or(0)
        ),
        String::new(),
        "**汇总结果**".to_string(),
        format!("- 总距离: {:.3} km", num_of(&summary, "total_distance_km")),
        format!("- 总时间: {} s", num_of(&summary, "total_time_s")),
        "- 总排放量:".to_string(),
    ];

    if let Some(emissions) = summary.get("total_emissions_g").and_then(Value::as_object) {
        for (pollutant, grams) in emissions {
            lines.push(format!(
                "  - {pollutant}: {}",
                format_emission(grams.as_f64().unwrap_or(0.0))
            ));
        }
    }

    if let Some(rates) = summary
        .get("emission_rates_g_per_km")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
    {
        lines.push("- 单位排放:".to_string());
        for (pollutant, rate) in rates {
            lines.push(format!(
                "  - {pollutant}: {:.4} g/km",
                rate.as_f64().unwrap_or(0.0)
            ));
        }
    }

    lines.join("\n")
}

/// Stable Markdown for a successful macro-emission calculation.
pub fn render_macro_success(data: &Value) -> String {
    let query_info = data.get("query_info").cloned().unwrap_or(Value::Null);
    let summary = data.get("summary").cloned().unwrap_or(Value::Null);

    let mut lines = vec![
        "## 宏观排放计算结果".to_string(),
        String::new(),
        "**计算参数**".to_string(),
        format!(
            "- 路段数: {}",
            query_info
                .get("links_count")
                .and_then(Value::as_u64)
                .unwrap_or(0)
        ),
        format!(
            "- 年份: {}",
            query_info
                .get("model_year")
                .and_then(Value::as_i64)
                .map(|y| y.to_string())
                .unwrap_or_else(|| "未知".to_string())
        ),
        format!("- 季节: {}", str_of(&query_info, "season")),
        format!("- 污染物: {}", pollutant_list(&query_info, "pollutants")),
        String::new(),
        "**汇总结果**".to_string(),
        "- 总排放量 (kg/h):".to_string(),
    ];

    if let Some(totals) = summary
        .get("total_emissions_kg_per_hr")
        .and_then(Value::as_object)
    {
        for (pollutant, kg) in totals {
            lines.push(format!("  - {pollutant}: {:.4}", kg.as_f64().unwrap_or(0.0)));
        }
    }

    if let Some(rates) = summary
        .get("avg_rates_g_per_veh_km")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
    {
        lines.push("- 平均单位排放 (g/(veh·km)):".to_string());
        for (pollutant, rate) in rates {
            lines.push(format!(
                "  - {pollutant}: {:.4}",
                rate.as_f64().unwrap_or(0.0)
            ));
        }
    }

    lines.join("\n")
}

/// Stable Markdown for a successful emission-factor query. Handles both the
/// single-pollutant shape (query_summary + speed_curve) and the
/// multi-pollutant shape (pollutants map + metadata).
pub fn render_factors_success(data: &Value) -> String {
    let (vehicle_type, model_year, season, road_type, pollutants_data): (
        String,
        String,
        String,
        String,
        Vec<(String, Value)>,
    ) = if let Some(qs) = data.get("query_summary") {
        (
            str_of(qs, "vehicle_type").to_string(),
            qs.get("model_year")
                .and_then(Value::as_i64)
                .map(|y| y.to_string())
                .unwrap_or_else(|| "未知".to_string()),
            str_of(qs, "season").to_string(),
            str_of(qs, "road_type").to_string(),
            vec![(str_of(qs, "pollutant").to_string(), data.clone())],
        )
    } else {
        let meta = data.get("metadata").cloned().unwrap_or(Value::Null);
        let pollutants = data
            .get("pollutants")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        (
            str_of(data, "vehicle_type").to_string(),
            data.get("model_year")
                .and_then(Value::as_i64)
                .map(|y| y.to_string())
                .unwrap_or_else(|| "未知".to_string()),
            str_of(&meta, "season").to_string(),
            str_of(&meta, "road_type").to_string(),
            pollutants,
        )
    };

    let pollutant_names = pollutants_data
        .iter()
        .map(|(name, _)| name.clone())
        .collect::<Vec<_>>()
        .join(", ");

    let mut lines = vec![
        "## 排放因子查询结果".to_string(),
        String::new(),
        "**查询参数**".to_string(),
        format!("- 车型: {vehicle_type}"),
        format!("- 年份: {model_year}"),
        format!("- 季节: {season}"),
        format!("- 道路类型: {road_type}"),
        format!("- 污染物: {pollutant_names}"),
    ];

    for (name, pol_data) in &pollutants_data {
        let unit = pol_data
            .get("unit")
            .and_then(Value::as_str)
            .unwrap_or("g/mile");
        lines.push(String::new());
        if pollutants_data.len() > 1 {
            lines.push(format!("**{name} 典型排放值 ({unit})**"));
        } else {
            lines.push(format!("**典型排放值 ({unit})**"));
        }

        let typical = pol_data
            .get("typical_values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if typical.is_empty() {
            lines.push("- 暂无典型值数据".to_string());
        } else {
            for tv in typical {
                lines.push(format!(
                    "- {} km/h: {:.4}",
                    num_of(&tv, "speed_kph"),
                    num_of(&tv, "emission_rate")
                ));
            }
        }
    }

    if let Some((_, first)) = pollutants_data.first() {
        lines.push(String::new());
        lines.push("**数据概况**".to_string());
        if let Some(range) = first.get("speed_range") {
            lines.push(format!(
                "- 速度范围: {} - {} km/h",
                num_of(range, "min_kph"),
                num_of(range, "max_kph")
            ));
        }
        lines.push(format!(
            "- 数据点数: {}",
            first
                .get("data_points")
                .and_then(Value::as_u64)
                .unwrap_or(0)
        ));
        if let Some(source) = first.get("data_source").and_then(Value::as_str) {
            if !source.is_empty() {
                lines.push(format!("- 数据来源: {source}"));
            }
        }
    }

    lines.join("\n")
}

/// Deterministic formatter used when any tool failed or synthesis is not
/// trusted: statuses, summaries, errors, and suggestions, tool by tool.
pub fn render_fallback(results: &[(String, Value)]) -> String {
    let mut lines = vec!["## 工具执行结果".to_string(), String::new()];

    let success_count = results
        .iter()
        .filter(|(_, r)| r.get("success").and_then(Value::as_bool).unwrap_or(false))
        .count();
    let error_count = results.len() - success_count;

    if error_count > 0 {
        lines.push(format!(
            "⚠️ {error_count} 个工具执行失败，{success_count} 个成功"
        ));
    } else {
        lines.push("✅ 所有工具执行成功".to_string());
    }
    lines.push(String::new());

    for (i, (name, result)) in results.iter().enumerate() {
        lines.push(format!("### {}. {name}", i + 1));
        if result
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            lines.push("**状态**: ✅ 成功".to_string());
            if let Some(summary) = result.get("summary").and_then(Value::as_str) {
                lines.push(format!("**结果**: {summary}"));
            }
        } else {
            lines.push("**状态**: ❌ 失败".to_string());
            let error_text = result
                .get("message")
                .or_else(|| result.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("未知错误");
            lines.push(format!("**错误**: {error_text}"));
            if let Some(suggestions) = result.get("suggestions").and_then(Value::as_array) {
                lines.push("**建议**:".to_string());
                for suggestion in suggestions.iter().filter_map(Value::as_str) {
                    lines.push(format!("- {suggestion}"));
                }
            }
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emission_unit_ladder() {
        assert_eq!(format_emission(12.5), "12.50 g");
        assert_eq!(format_emission(2500.0), "2.50 kg (2500.00 g)");
        assert_eq!(format_emission(3_000_000.0), "3.00 吨 (3000.00 kg)");
    }

    #[test]
    fn hourly_format_includes_per_day() {
        let s = format_emission_hourly(1000.0);
        assert!(s.contains("/小时"));
        assert!(s.contains("/天"));
        assert!(s.contains("24.00 kg"));
    }

    #[test]
    fn micro_renderer_lists_totals() {
        let data = serde_json::json!({
            "query_info": {
                "vehicle_type": "Passenger Car",
                "model_year": 2020,
                "season": "夏季",
                "pollutants": ["CO2", "NOx"],
                "trajectory_points": 60
            },
            "summary": {
                "total_distance_km": 0.75,
                "total_time_s": 60.0,
                "total_emissions_g": {"CO2": 150.0, "NOx": 0.2},
                "emission_rates_g_per_km": {"CO2": 200.0, "NOx": 0.27}
            }
        });
        let text = render_micro_success(&data);
        assert!(text.contains("微观排放计算结果"));
        assert!(text.contains("Passenger Car"));
        assert!(text.contains("总距离: 0.750 km"));
        assert!(text.contains("CO2"));
    }

    #[test]
    fn factors_renderer_handles_multi_pollutant_shape() {
        let data = serde_json::json!({
            "vehicle_type": "Passenger Car",
            "model_year": 2020,
            "pollutants": {
                "CO2": {
                    "unit": "g/mile",
                    "typical_values": [{"speed_kph": 40.2, "emission_rate": 380.0}],
                    "speed_range": {"min_kph": 8.0, "max_kph": 120.7},
                    "data_points": 15,
                    "data_source": "MOVES (Atlanta)"
                }
            },
            "metadata": {"season": "夏季", "road_type": "快速路"}
        });
        let text = render_factors_success(&data);
        assert!(text.contains("排放因子查询结果"));
        assert!(text.contains("数据来源: MOVES (Atlanta)"));
        assert!(text.contains("CO2"));
    }

    #[test]
    fn fallback_lists_errors_and_suggestions() {
        let results = vec![(
            "query_emission_factors".to_string(),
            serde_json::json!({
                "success": false,
                "message": "Cannot recognize pollutant: 'XYZ'",
                "suggestions": ["CO2", "NOx"]
            }),
        )];
        let text = render_fallback(&results);
        assert!(text.contains("失败"));
        assert!(text.contains("XYZ"));
        assert!(text.contains("- CO2"));
    }
}
