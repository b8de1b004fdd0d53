//! Standardization mapping tables: canonical vehicle types, pollutants,
//! season aliases, and per-task column patterns.
//!
//! The built-in tables mirror the production MOVES vocabulary. A deployment
//! can override them with a TOML file; a configured file that fails to parse
//! is fatal at startup.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VemaError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleType {
    pub standard_name: String,
    pub display_name_zh: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollutantType {
    pub standard_name: String,
    pub display_name_zh: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// One standard field of a task type's input table and the column-name
/// spellings that map onto it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnPattern {
    pub standard: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mappings {
    pub vehicle_types: Vec<VehicleType>,
    pub pollutants: Vec<PollutantType>,
    /// task_type -> field name -> pattern. BTreeMap keeps iteration stable so
    /// column mapping is deterministic.
    pub column_patterns: HashMap<String, BTreeMap<String, ColumnPattern>>,
    /// Raw season spellings -> canonical season (春季/夏季/秋季/冬季).
    pub seasons: HashMap<String, String>,
}

impl Mappings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VemaError::Mappings(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| VemaError::Mappings(format!("cannot parse {}: {e}", path.display())))
    }

    pub fn get_column_patterns(&self, task_type: &str) -> BTreeMap<String, ColumnPattern> {
        self.column_patterns
            .get(task_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_required_columns(&self, task_type: &str) -> Vec<String> {
        self.get_column_patterns(task_type)
            .values()
            .filter(|p| p.required)
            .map(|p| p.standard.clone())
            .collect()
    }

    pub fn normalize_season(&self, raw: &str) -> Option<String> {
        let key = raw.trim();
        if self.seasons.values().any(|v| v == key) {
            return Some(key.to_string());
        }
        self.seasons.get(&key.to_lowercase()).cloned()
    }

    /// The production vocabulary, compiled in so the server starts with no
    /// external data files.
    pub fn builtin() -> Self {
        let vehicle_types = vec![
            vehicle("Passenger Car", "乘用车", &["小汽车", "轿车", "私家车", "SUV", "网约车", "出租车", "滴滴", "car", "sedan"]),
            vehicle("Passenger Truck", "皮卡", &["轻型客货车", "pickup"]),
            vehicle("Light Commercial Truck", "轻型货车", &["小货车", "面包车", "轻卡", "货车", "truck"]),
            vehicle("Transit Bus", "公交车", &["城市公交", "公交", "bus"]),
            vehicle("Intercity Bus", "城际客车", &["长途大巴", "旅游巴士"]),
            vehicle("School Bus", "校车", &["学生巴士"]),
            vehicle("Refuse Truck", "垃圾车", &["环卫车"]),
            vehicle("Single Unit Short-haul Truck", "中型货车", &["城配货车", "中卡"]),
            vehicle("Single Unit Long-haul Truck", "长途货车", &[]),
            vehicle("Motor Home", "房车", &["旅居车"]),
            vehicle("Combination Short-haul Truck", "半挂短途", &[]),
            vehicle("Combination Long-haul Truck", "重型货车", &["重卡", "大货车", "挂车"]),
            vehicle("Motorcycle", "摩托车", &["电动摩托", "机车"]),
        ];

        let pollutants = vec![
            pollutant("CO2", "二氧化碳", &["碳排放", "温室气体"]),
            pollutant("CO", "一氧化碳", &[]),
            pollutant("NOx", "氮氧化物", &["氮氧"]),
            pollutant("PM2.5", "细颗粒物", &["颗粒物"]),
            pollutant("PM10", "可吸入颗粒物", &[]),
            pollutant("THC", "总碳氢化合物", &["总烃"]),
            pollutant("SO2", "二氧化硫", &["硫氧化物"]),
        ];

        let mut column_patterns = HashMap::new();

        let mut micro = BTreeMap::new();
        micro.insert(
            "time".to_string(),
            pattern("t", &["t", "time", "时间", "秒", "second", "sec", "timestamp"], true),
        );
        micro.insert(
            "speed".to_string(),
            pattern(
                "speed_kph",
                &["speed_kph", "speed", "velocity", "速度", "车速", "speed_kmh", "v_kph"],
                true,
            ),
        );
        micro.insert(
            "acceleration".to_string(),
            pattern(
                "acceleration_mps2",
                &["acceleration_mps2", "acceleration", "accel", "加速度", "acc"],
                false,
            ),
        );
        micro.insert(
            "grade".to_string(),
            pattern("grade_pct", &["grade_pct", "grade", "坡度", "slope"], false),
        );
        column_patterns.insert("micro_emission".to_string(), micro);

        let mut macro_links = BTreeMap::new();
        macro_links.insert(
            "link_id".to_string(),
            pattern("link_id", &["link_id", "id", "road_id", "segment_id", "路段编号", "路段"], false),
        );
        macro_links.insert(
            "length".to_string(),
            pattern(
                "link_length_km",
                &["link_length_km", "length_km", "length", "link_length", "road_length", "长度", "里程"],
                true,
            ),
        );
        macro_links.insert(
            "flow".to_string(),
            pattern(
                "traffic_flow_vph",
                &["traffic_flow_vph", "flow_vph", "traffic_flow", "flow", "volume", "traffic_volume", "流量", "交通量"],
                true,
            ),
        );
        macro_links.insert(
            "speed".to_string(),
            pattern(
                "avg_speed_kph",
                &["avg_speed_kph", "avg_speed_kmh", "speed_kph", "avg_speed", "average_speed", "speed", "平均速度", "速度"],
                true,
            ),
        );
        column_patterns.insert("macro_emission".to_string(), macro_links);

        let mut seasons = HashMap::new();
        for (raw, canonical) in [
            ("春", "春季"),
            ("春天", "春季"),
            ("spring", "春季"),
            ("夏", "夏季"),
            ("夏天", "夏季"),
            ("summer", "夏季"),
            ("秋", "秋季"),
            ("秋天", "秋季"),
            ("fall", "秋季"),
            ("autumn", "秋季"),
            ("冬", "冬季"),
            ("冬天", "冬季"),
            ("winter", "冬季"),
        ] {
            seasons.insert(raw.to_string(), canonical.to_string());
        }

        Self {
            vehicle_types,
            pollutants,
            column_patterns,
            seasons,
        }
    }
}

fn vehicle(standard: &str, zh: &str, aliases: &[&str]) -> VehicleType {
    VehicleType {
        standard_name: standard.to_string(),
        display_name_zh: zh.to_string(),
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
    }
}

fn pollutant(standard: &str, zh: &str, aliases: &[&str]) -> PollutantType {
    PollutantType {
        standard_name: standard.to_string(),
        display_name_zh: zh.to_string(),
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
    }
}

fn pattern(standard: &str, patterns: &[&str], required: bool) -> ColumnPattern {
    ColumnPattern {
        standard: standard.to_string(),
        patterns: patterns.iter().map(|s| s.to_string()).collect(),
        required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_has_thirteen_vehicles_and_seven_pollutants() {
        let m = Mappings::builtin();
        assert_eq!(m.vehicle_types.len(), 13);
        assert_eq!(m.pollutants.len(), 7);
    }

    #[test]
    fn required_columns_for_micro() {
        let m = Mappings::builtin();
        let required = m.get_required_columns("micro_emission");
        assert!(required.contains(&"t".to_string()));
        assert!(required.contains(&"speed_kph".to_string()));
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn required_columns_for_macro() {
        let m = Mappings::builtin();
        let required = m.get_required_columns("macro_emission");
        assert_eq!(required.len(), 3);
        assert!(required.contains(&"link_length_km".to_string()));
        assert!(required.contains(&"traffic_flow_vph".to_string()));
        assert!(required.contains(&"avg_speed_kph".to_string()));
    }

    #[test]
    fn season_normalization() {
        let m = Mappings::builtin();
        assert_eq!(m.normalize_season("summer").as_deref(), Some("夏季"));
        assert_eq!(m.normalize_season("冬").as_deref(), Some("冬季"));
        assert_eq!(m.normalize_season("夏季").as_deref(), Some("夏季"));
        assert_eq!(m.normalize_season("monsoon"), None);
    }
}
