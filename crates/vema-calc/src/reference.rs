//! Bundled reference implementations of the calculator and retriever
//! contracts.
//!
//! These stand in for the production MOVES-Matrix datasets: the factor source
//! is a deterministic parametric model over the same vehicle/pollutant ids,
//! and the trajectory calculator bins real VSP values into MOVES operating
//! modes. Good enough to exercise the orchestrator and the wire formats;
//! not a substitute for the real emission data.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::types::*;
use crate::{CalcError, FactorSource, LinkCalculator, Retriever, TrajectoryCalculator};

const MIN_MODEL_YEAR: i32 = 1995;
const MAX_MODEL_YEAR: i32 = 2025;
const GRAVITY_MPS2: f64 = 9.81;

/// MOVES source-type ids for the thirteen supported vehicle types.
const SOURCE_TYPES: [(&str, u32); 13] = [
    ("Motorcycle", 11),
    ("Passenger Car", 21),
    ("Passenger Truck", 31),
    ("Light Commercial Truck", 32),
    ("Intercity Bus", 41),
    ("Transit Bus", 42),
    ("School Bus", 43),
    ("Refuse Truck", 51),
    ("Single Unit Short-haul Truck", 52),
    ("Single Unit Long-haul Truck", 53),
    ("Motor Home", 54),
    ("Combination Short-haul Truck", 61),
    ("Combination Long-haul Truck", 62),
];

/// Road-load coefficients per source type: (A, B, C, M, m).
const VSP_PARAMETERS: [(u32, f64, f64, f64, f64, f64); 13] = [
    (11, 0.0251, 0.0, 0.000315, 0.285, 0.285),
    (21, 0.156461, 0.002002, 0.000493, 1.4788, 1.4788),
    (31, 0.22112, 0.002838, 0.000698, 1.86686, 1.8668),
    (32, 0.235008, 0.003039, 0.000748, 2.05979, 2.0597),
    (41, 1.29515, 0.0, 0.003715, 19.5937, 19.5937),
    (42, 1.0944, 0.0, 0.003587, 16.556, 16.556),
    (43, 0.746718, 0.0, 0.002176, 9.0698, 9.0698),
    (51, 1.58346, 0.0, 0.003572, 23.1135, 23.1135),
    (52, 0.627922, 0.0, 0.001603, 8.5389, 8.5389),
    (53, 0.557262, 0.0, 0.001474, 6.9844, 6.9844),
    (54, 0.68989, 0.0, 0.002106, 7.5257, 7.5257),
    (61, 1.50581, 0.0, 0.003793, 22.8275, 22.8275),
    (62, 1.55134, 0.0, 0.003682, 24.4194, 24.4194),
];

/// VSP operating-mode bins (kW/t): bin id -> [lower, upper).
const VSP_BINS: [(u32, f64, f64); 14] = [
    (1, f64::NEG_INFINITY, -2.0),
    (2, -2.0, 0.0),
    (3, 0.0, 1.0),
    (4, 1.0, 4.0),
    (5, 4.0, 7.0),
    (6, 7.0, 10.0),
    (7, 10.0, 13.0),
    (8, 13.0, 16.0),
    (9, 16.0, 19.0),
    (10, 19.0, 23.0),
    (11, 23.0, 28.0),
    (12, 28.0, 33.0),
    (13, 33.0, 39.0),
    (14, 39.0, f64::INFINITY),
];

fn source_type_id(vehicle_type: &str) -> Option<u32> {
    SOURCE_TYPES
        .iter()
        .find(|(name, _)| *name == vehicle_type)
        .map(|(_, id)| *id)
}

pub fn valid_vehicle_types() -> Vec<String> {
    SOURCE_TYPES.iter().map(|(n, _)| n.to_string()).collect()
}

/// Base emission rate at 50 mph in g/mile, and the heavy-duty scaling.
fn pollutant_base_rate(pollutant: &str) -> Option<f64> {
    match pollutant {
        "CO2" => Some(400.0),
        "CO" => Some(3.2),
        "NOx" => Some(0.42),
        "PM2.5" => Some(0.021),
        "PM10" => Some(0.044),
        "THC" => Some(0.31),
        "SO2" => Some(0.0095),
        _ => None,
    }
}

pub fn valid_pollutants() -> Vec<String> {
    ["CO2", "CO", "NOx", "PM2.5", "PM10", "THC", "SO2"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn vehicle_scale(source_type: u32) -> f64 {
    match source_type {
        11 => 0.45,
        21 => 1.0,
        31 => 1.25,
        32 => 1.4,
        41 | 42 | 43 => 3.4,
        51 => 4.1,
        52 | 53 => 3.0,
        54 => 2.6,
        61 | 62 => 5.2,
        _ => 1.0,
    }
}

fn season_scale(season: &str) -> f64 {
    match season {
        "冬季" => 1.15,
        "春季" | "秋季" => 1.05,
        _ => 1.0,
    }
}

fn road_scale(road_type: &str) -> f64 {
    if road_type == "地面道路" {
        1.1
    } else {
        1.0
    }
}

fn year_scale(pollutant: &str, model_year: i32) -> f64 {
    let age = (model_year - MIN_MODEL_YEAR) as f64;
    if pollutant == "CO2" {
        (1.0 - 0.005 * age).max(0.7)
    } else {
        (1.0 - 0.015 * age).max(0.4)
    }
}

/// Rate in g/mile at the given speed; u-shaped in speed, normalized to the
/// base rate at 50 mph.
fn rate_at(base: f64, scale: f64, speed_mph: f64) -> f64 {
    let shape = 25.0 / speed_mph.max(1.0) + 0.6 + 0.004 * speed_mph;
    let shape_at_50 = 25.0 / 50.0 + 0.6 + 0.004 * 50.0;
    base * scale * shape / shape_at_50
}

/// Parametric stand-in for the MOVES factor tables.
#[derive(Default)]
pub struct ParametricFactorSource;

impl FactorSource for ParametricFactorSource {
    fn query(&self, query: &FactorQuery) -> Result<FactorData, CalcError> {
        let source_type = source_type_id(&query.vehicle_type).ok_or_else(|| {
            CalcError::UnknownVehicle {
                name: query.vehicle_type.clone(),
                valid: valid_vehicle_types(),
            }
        })?;
        let base = pollutant_base_rate(&query.pollutant).ok_or_else(|| {
            CalcError::UnknownPollutant {
                name: query.pollutant.clone(),
                valid: valid_pollutants(),
            }
        })?;
        if !(MIN_MODEL_YEAR..=MAX_MODEL_YEAR).contains(&query.model_year) {
            return Err(CalcError::NoData(format!(
                "model_year {} 不在数据范围 {MIN_MODEL_YEAR}-{MAX_MODEL_YEAR}",
                query.model_year
            )));
        }

        let scale = vehicle_scale(source_type)
            * season_scale(&query.season)
            * road_scale(&query.road_type)
            * year_scale(&query.pollutant, query.model_year);

        let mut speed_curve = Vec::new();
        for speed_mph in (5..=75).step_by(5) {
            let speed_mph = speed_mph as f64;
            speed_curve.push(SpeedPoint {
                speed_mph,
                speed_kph: round1(speed_mph * MILES_PER_KM),
                emission_rate: round4(rate_at(base, scale, speed_mph)),
            });
        }

        let typical_values: Vec<TypicalValue> = [25.0, 50.0, 70.0]
            .iter()
            .map(|target| {
                let closest = speed_curve
                    .iter()
                    .min_by(|a, b| {
                        (a.speed_mph - target)
                            .abs()
                            .total_cmp(&(b.speed_mph - target).abs())
                    })
                    .expect("curve is non-empty");
                TypicalValue {
                    label: format!("{} mph ({} kph)", closest.speed_mph, closest.speed_kph),
                    speed_mph: closest.speed_mph,
                    speed_kph: closest.speed_kph,
                    emission_rate: closest.emission_rate,
                }
            })
            .collect();

        let first = speed_curve.first().expect("curve is non-empty");
        let last = speed_curve.last().expect("curve is non-empty");

        Ok(FactorData {
            query_summary: FactorQuerySummary {
                vehicle_type: query.vehicle_type.clone(),
                pollutant: query.pollutant.clone(),
                model_year: query.model_year,
                season: query.season.clone(),
                road_type: query.road_type.clone(),
            },
            speed_range: SpeedRange {
                min_mph: first.speed_mph,
                max_mph: last.speed_mph,
                min_kph: first.speed_kph,
                max_kph: last.speed_kph,
            },
            data_points: speed_curve.len(),
            speed_curve,
            typical_values,
            unit: "g/mile".to_string(),
            data_source: "MOVES (Atlanta)".to_string(),
        })
    }
}

fn vsp_params(source_type: u32) -> (f64, f64, f64, f64, f64) {
    VSP_PARAMETERS
        .iter()
        .find(|(id, ..)| *id == source_type)
        .map(|(_, a, b, c, big_m, m)| (*a, *b, *c, *big_m, *m))
        .unwrap_or((0.156461, 0.002002, 0.000493, 1.4788, 1.4788))
}

fn vsp_bin(vsp: f64) -> u32 {
    VSP_BINS
        .iter()
        .find(|(_, lo, hi)| vsp >= *lo && vsp < *hi)
        .map(|(id, ..)| *id)
        .unwrap_or(14)
}

/// Trajectory calculator: VSP per second, operating-mode binning, emissions
/// drawn off the factor curve at the instantaneous speed.
pub struct VspTrajectoryCalculator {
    factors: Arc<dyn FactorSource>,
}

impl VspTrajectoryCalculator {
    pub fn new(factors: Arc<dyn FactorSource>) -> Self {
        Self { factors }
    }
}

impl TrajectoryCalculator for VspTrajectoryCalculator {
    fn calculate(
        &self,
        points: &[TrajectoryPoint],
        vehicle_type: &str,
        pollutants: &[String],
        model_year: i32,
        season: &str,
    ) -> Result<TrajectoryOutcome, CalcError> {
        if points.is_empty() {
            return Err(CalcError::Invalid("轨迹数据为空".to_string()));
        }
        let source_type = source_type_id(vehicle_type).ok_or_else(|| CalcError::UnknownVehicle {
            name: vehicle_type.to_string(),
            valid: valid_vehicle_types(),
        })?;
        let (a_coef, b_coef, c_coef, mass_factor, mass) = vsp_params(source_type);

        // One factor curve per pollutant, interpolated by speed.
        let mut curves: BTreeMap<String, Vec<SpeedPoint>> = BTreeMap::new();
        for pollutant in pollutants {
            let data = self.factors.query(&FactorQuery {
                vehicle_type: vehicle_type.to_string(),
                pollutant: pollutant.clone(),
                model_year,
                season: season.to_string(),
                road_type: "快速路".to_string(),
                return_curve: true,
            })?;
            curves.insert(pollutant.clone(), data.speed_curve);
        }

        let mut results = Vec::with_capacity(points.len());
        let mut total_distance_km = 0.0;
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();

        for (i, point) in points.iter().enumerate() {
            let v = point.speed_kph / 3.6; // m/s
            let accel = point.acceleration_mps2.unwrap_or_else(|| {
                if i == 0 {
                    0.0
                } else {
                    let dt = (point.t - points[i - 1].t).max(1.0);
                    (point.speed_kph - points[i - 1].speed_kph) / 3.6 / dt
                }
            });
            let grade = point.grade_pct.unwrap_or(0.0) / 100.0;

            let vsp = (a_coef * v
                + b_coef * v * v
                + c_coef * v * v * v
                + mass_factor * v * (accel + GRAVITY_MPS2 * grade))
                / mass;
            let op_mode = vsp_bin(vsp);

            // Higher-load operating modes emit more than the speed-average rate.
            let load_scale = (1.0 + vsp / 50.0).clamp(0.5, 2.5);

            let mut emissions = BTreeMap::new();
            for (pollutant, curve) in &curves {
                let rate_g_per_mile = interpolate_rate(curve, point.speed_kph);
                let rate_g_per_km = rate_g_per_mile / MILES_PER_KM;
                let grams = rate_g_per_km * (point.speed_kph / 3600.0) * load_scale;
                emissions.insert(pollutant.clone(), round6(grams));
                *totals.entry(pollutant.clone()).or_insert(0.0) += grams;
            }

            total_distance_km += point.speed_kph / 3600.0;
            results.push(SecondResult {
                t: point.t,
                speed_kph: point.speed_kph,
                acceleration_mps2: round4(accel),
                vsp: round4(vsp),
                op_mode,
                emissions,
            });
        }

        let total_time_s = points.len() as f64;
        let avg_speed_kph = if total_time_s > 0.0 {
            total_distance_km / (total_time_s / 3600.0)
        } else {
            0.0
        };

        let mut emission_rates_g_per_km = BTreeMap::new();
        let mut total_emissions_g = BTreeMap::new();
        for (pollutant, grams) in &totals {
            total_emissions_g.insert(pollutant.clone(), round4(*grams));
            if total_distance_km > 0.0 {
                emission_rates_g_per_km.insert(pollutant.clone(), round4(grams / total_distance_km));
            }
        }

        debug!(
            points = results.len(),
            distance_km = total_distance_km,
            "trajectory calculation complete"
        );

        Ok(TrajectoryOutcome {
            results,
            summary: TrajectorySummary {
                total_distance_km: round4(total_distance_km),
                total_time_s,
                avg_speed_kph: round1(avg_speed_kph),
                total_emissions_g,
                emission_rates_g_per_km,
            },
        })
    }
}

/// Link calculator: average-speed factor lookup weighted by fleet mix.
pub struct AverageSpeedLinkCalculator {
    factors: Arc<dyn FactorSource>,
}

impl AverageSpeedLinkCalculator {
    pub fn new(factors: Arc<dyn FactorSource>) -> Self {
        Self { factors }
    }

    fn fleet_rate(
        &self,
        fleet_mix: &FleetMix,
        pollutant: &str,
        speed_kph: f64,
        model_year: i32,
        season: &str,
    ) -> Result<f64, CalcError> {
        let total_share: f64 = fleet_mix.values().sum();
        if total_share <= 0.0 {
            return Err(CalcError::Invalid("fleet_mix 份额之和为 0".to_string()));
        }

        let mut rate = 0.0;
        for (vehicle, share) in fleet_mix {
            let data = self.factors.query(&FactorQuery {
                vehicle_type: vehicle.clone(),
                pollutant: pollutant.to_string(),
                model_year,
                season: season.to_string(),
                road_type: "快速路".to_string(),
                return_curve: true,
            })?;
            let g_per_km = interpolate_rate(&data.speed_curve, speed_kph) / MILES_PER_KM;
            rate += g_per_km * (share / total_share);
        }
        Ok(rate)
    }
}

impl LinkCalculator for AverageSpeedLinkCalculator {
    fn calculate(
        &self,
        links: &[LinkInput],
        pollutants: &[String],
        model_year: i32,
        season: &str,
        default_fleet_mix: Option<&FleetMix>,
    ) -> Result<LinkOutcome, CalcError> {
        if links.is_empty() {
            return Err(CalcError::Invalid("路段数据为空".to_string()));
        }

        let fallback_mix: FleetMix =
            default_fleet_mix.cloned().unwrap_or_else(|| {
                let mut mix = BTreeMap::new();
                mix.insert("Passenger Car".to_string(), 100.0);
                mix
            });

        let mut results = Vec::with_capacity(links.len());
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        let mut rate_sums: BTreeMap<String, f64> = BTreeMap::new();

        for link in links {
            if link.link_length_km <= 0.0 || link.traffic_flow_vph < 0.0 || link.avg_speed_kph <= 0.0 {
                return Err(CalcError::Invalid(format!(
                    "路段 {} 的长度/流量/速度无效",
                    link.link_id
                )));
            }

            let mix = link.fleet_mix.as_ref().unwrap_or(&fallback_mix);
            let veh_km_per_hr = link.traffic_flow_vph * link.link_length_km;

            let mut link_totals = BTreeMap::new();
            let mut link_rates = BTreeMap::new();
            for pollutant in pollutants {
                let g_per_veh_km =
                    self.fleet_rate(mix, pollutant, link.avg_speed_kph, model_year, season)?;
                let kg_per_hr = g_per_veh_km * veh_km_per_hr / 1000.0;
                link_totals.insert(pollutant.clone(), round4(kg_per_hr));
                link_rates.insert(pollutant.clone(), round4(g_per_veh_km));
                *totals.entry(pollutant.clone()).or_insert(0.0) += kg_per_hr;
                *rate_sums.entry(pollutant.clone()).or_insert(0.0) += g_per_veh_km;
            }

            results.push(LinkResult {
                link_id: link.link_id.clone(),
                total_emissions_kg_per_hr: link_totals,
                emission_rates_g_per_veh_km: link_rates,
            });
        }

        let links_count = links.len();
        let mut total_emissions_kg_per_hr = BTreeMap::new();
        let mut avg_rates_g_per_veh_km = BTreeMap::new();
        for (pollutant, total) in &totals {
            total_emissions_kg_per_hr.insert(pollutant.clone(), round4(*total));
        }
        for (pollutant, sum) in &rate_sums {
            avg_rates_g_per_veh_km.insert(pollutant.clone(), round4(sum / links_count as f64));
        }

        Ok(LinkOutcome {
            results,
            summary: LinkSummary {
                links_count,
                total_emissions_kg_per_hr,
                avg_rates_g_per_veh_km,
            },
        })
    }
}

/// Linear interpolation on the speed curve, clamped to its ends.
fn interpolate_rate(curve: &[SpeedPoint], speed_kph: f64) -> f64 {
    if curve.is_empty() {
        return 0.0;
    }
    if speed_kph <= curve[0].speed_kph {
        return curve[0].emission_rate;
    }
    for pair in curve.windows(2) {
        let (lo, hi) = (&pair[0], &pair[1]);
        if speed_kph <= hi.speed_kph {
            let span = hi.speed_kph - lo.speed_kph;
            if span <= 0.0 {
                return lo.emission_rate;
            }
            let frac = (speed_kph - lo.speed_kph) / span;
            return lo.emission_rate + frac * (hi.emission_rate - lo.emission_rate);
        }
    }
    curve.last().map(|p| p.emission_rate).unwrap_or(0.0)
}

/// In-memory retriever over a fixed set of reference documents. Scoring is
/// character-bigram overlap, which works for CJK queries without tokenization.
pub struct StaticRetriever {
    chunks: Vec<KnowledgeChunk>,
}

impl Default for StaticRetriever {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticRetriever {
    pub fn new() -> Self {
        let entries = [
            (
                "kb-guoliu",
                "国六排放标准是中国第六阶段机动车污染物排放标准，分为国六a和国六b两个阶段，\
                 对一氧化碳、总碳氢化合物、氮氧化物和颗粒物的限值较国五大幅加严，并引入了\
                 实际行驶排放（RDE）测试要求。",
                "《轻型汽车污染物排放限值及测量方法（中国第六阶段）》GB 18352.6-2016",
            ),
            (
                "kb-guowu",
                "国五排放标准即中国第五阶段机动车排放标准，相当于欧V水平，于2017年在全国范围\
                 实施，重点收紧了氮氧化物和颗粒物限值。",
                "《轻型汽车污染物排放限值及测量方法（中国第五阶段）》GB 18352.5-2013",
            ),
            (
                "kb-moves",
                "MOVES（Motor Vehicle Emission Simulator）是美国环保署开发的机动车排放模型，\
                 基于车辆比功率（VSP）和运行模式分布计算逐秒排放率，支持宏观、中观和微观尺度分析。",
                "US EPA MOVES Technical Guidance",
            ),
            (
                "kb-vsp",
                "车辆比功率（VSP, Vehicle Specific Power）表示单位质量车辆的瞬时功率需求，\
                 由速度、加速度和道路坡度计算得到，是划分机动车运行模式、估算瞬时排放的核心变量。",
                "《机动车排放测算方法学综述》",
            ),
            (
                "kb-factor",
                "排放因子指单位活动水平（每公里、每小时或每千克燃料）排放的污染物质量，\
                 常用单位为 g/km。排放因子随车型、车龄、速度、温度等条件变化。",
                "《道路机动车大气污染物排放清单编制技术指南》",
            ),
            (
                "kb-pm",
                "PM2.5 指空气动力学直径不大于2.5微米的细颗粒物，机动车尾气及制动、轮胎磨损\
                 都是城市 PM2.5 的重要来源；柴油车的颗粒物排放显著高于汽油车。",
                "《中国机动车环境管理年报》",
            ),
        ];

        let chunks = entries
            .iter()
            .map(|(id, content, source)| KnowledgeChunk {
                id: id.to_string(),
                content: content.to_string(),
                score: 0.0,
                source: source.to_string(),
                metadata: serde_json::Value::Null,
            })
            .collect();

        Self { chunks }
    }
}

fn bigrams(text: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = text.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeChunk>, CalcError> {
        let query_grams = bigrams(query);
        if query_grams.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<KnowledgeChunk> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let content_grams = bigrams(&chunk.content);
                let hits = query_grams
                    .iter()
                    .filter(|g| content_grams.contains(g))
                    .count();
                if hits == 0 {
                    return None;
                }
                let mut hit = chunk.clone();
                hit.score = hits as f64 / query_grams.len() as f64;
                Some(hit)
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factors() -> ParametricFactorSource {
        ParametricFactorSource
    }

    fn query(vehicle: &str, pollutant: &str, year: i32) -> FactorQuery {
        FactorQuery {
            vehicle_type: vehicle.to_string(),
            pollutant: pollutant.to_string(),
            model_year: year,
            season: "夏季".to_string(),
            road_type: "快速路".to_string(),
            return_curve: false,
        }
    }

    #[test]
    fn factor_query_returns_sorted_curve() {
        let data = factors().query(&query("Passenger Car", "CO2", 2020)).unwrap();
        assert_eq!(data.unit, "g/mile");
        assert!(data.data_points >= 10);
        assert!(data
            .speed_curve
            .windows(2)
            .all(|w| w[0].speed_mph < w[1].speed_mph));
        assert_eq!(data.typical_values.len(), 3);
    }

    #[test]
    fn unknown_vehicle_and_pollutant_error() {
        assert!(matches!(
            factors().query(&query("Hovercraft", "CO2", 2020)),
            Err(CalcError::UnknownVehicle { .. })
        ));
        assert!(matches!(
            factors().query(&query("Passenger Car", "XYZ", 2020)),
            Err(CalcError::UnknownPollutant { .. })
        ));
    }

    #[test]
    fn out_of_range_year_is_no_data() {
        assert!(matches!(
            factors().query(&query("Passenger Car", "CO2", 1980)),
            Err(CalcError::NoData(_))
        ));
    }

    #[test]
    fn buses_emit_more_than_cars() {
        let car = factors().query(&query("Passenger Car", "NOx", 2020)).unwrap();
        let bus = factors().query(&query("Transit Bus", "NOx", 2020)).unwrap();
        assert!(bus.speed_curve[5].emission_rate > car.speed_curve[5].emission_rate);
    }

    #[test]
    fn trajectory_totals_accumulate() {
        let calc = VspTrajectoryCalculator::new(Arc::new(ParametricFactorSource));
        let points: Vec<TrajectoryPoint> = (0..60)
            .map(|i| TrajectoryPoint {
                t: i as f64,
                speed_kph: 40.0 + (i % 10) as f64,
                acceleration_mps2: None,
                grade_pct: None,
            })
            .collect();
        let outcome = calc
            .calculate(&points, "Passenger Car", &["CO2".to_string(), "NOx".to_string()], 2020, "夏季")
            .unwrap();

        assert_eq!(outcome.results.len(), 60);
        assert!(outcome.summary.total_distance_km > 0.5);
        assert!(outcome.summary.total_emissions_g["CO2"] > 0.0);
        assert!(outcome.summary.emission_rates_g_per_km.contains_key("NOx"));
        assert!(outcome.results.iter().all(|r| (1u32..=14).contains(&r.op_mode)));
    }

    #[test]
    fn link_totals_scale_with_flow() {
        let calc = AverageSpeedLinkCalculator::new(Arc::new(ParametricFactorSource));
        let mk = |flow: f64| LinkInput {
            link_id: "L1".to_string(),
            link_length_km: 2.0,
            traffic_flow_vph: flow,
            avg_speed_kph: 60.0,
            fleet_mix: None,
        };
        let lo = calc
            .calculate(&[mk(1000.0)], &["CO2".to_string()], 2020, "夏季", None)
            .unwrap();
        let hi = calc
            .calculate(&[mk(2000.0)], &["CO2".to_string()], 2020, "夏季", None)
            .unwrap();
        let lo_total = lo.summary.total_emissions_kg_per_hr["CO2"];
        let hi_total = hi.summary.total_emissions_kg_per_hr["CO2"];
        assert!((hi_total / lo_total - 2.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn retriever_finds_guoliu_standard() {
        let retriever = StaticRetriever::new();
        let hits = retriever.search("什么是国六排放标准", 5).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "kb-guoliu");
        assert!(hits[0].source.contains("GB 18352.6"));
    }
}
