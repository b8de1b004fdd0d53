use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{FactMemory, ToolCallRecord, Turn, WorkingTurn};

/// Turns persisted per session file.
const MAX_PERSISTED_TURNS: usize = 10;

/// User phrasings that signal a correction of an earlier value.
const CORRECTION_PATTERNS: [&str; 6] = ["不对", "不是", "应该是", "我说的是", "换成", "改成"];
/// Vehicle keywords a correction may point at.
const CORRECTION_VEHICLES: [&str; 5] = ["小汽车", "公交车", "货车", "轿车", "客车"];

/// Per-session memory: working turns, structured facts, compressed history.
pub struct SessionMemory {
    session_id: String,
    path: PathBuf,
    working: Vec<Turn>,
    fact: FactMemory,
    compressed: String,
    max_turns: usize,
    excerpt_chars: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedMemory {
    session_id: String,
    fact_memory: FactMemory,
    #[serde(default)]
    compressed_memory: String,
    #[serde(default)]
    working_memory: Vec<Turn>,
}

impl SessionMemory {
    /// Load persisted memory for a session, or start empty. A corrupt or
    /// missing file is never fatal; the session simply starts fresh.
    pub fn load(history_dir: &Path, session_id: &str, max_turns: usize, excerpt_chars: usize) -> Self {
        let path = history_dir.join(format!("{session_id}.json"));
        let mut memory = Self {
            session_id: session_id.to_string(),
            path,
            working: Vec::new(),
            fact: FactMemory::default(),
            compressed: String::new(),
            max_turns,
            excerpt_chars,
        };

        match std::fs::read_to_string(&memory.path) {
            Ok(text) => match serde_json::from_str::<PersistedMemory>(&text) {
                Ok(persisted) => {
                    memory.working = persisted.working_memory;
                    memory.fact = persisted.fact_memory;
                    memory.compressed = persisted.compressed_memory;
                    info!(session_id, turns = memory.working.len(), "loaded session memory");
                }
                Err(e) => warn!(session_id, error = %e, "discarding corrupt memory file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(session_id, error = %e, "cannot read memory file"),
        }

        memory
    }

    /// Last N turns, assistant text truncated to the excerpt budget so long
    /// formatted replies do not bias the model's style.
    pub fn working_memory(&self) -> Vec<WorkingTurn> {
        let start = self.working.len().saturating_sub(self.max_turns);
        self.working[start..]
            .iter()
            .map(|turn| WorkingTurn {
                user: turn.user.clone(),
                assistant: truncate_chars(&turn.assistant, self.excerpt_chars),
            })
            .collect()
    }

    pub fn fact_memory(&self) -> &FactMemory {
        &self.fact
    }

    pub fn compressed_memory(&self) -> &str {
        &self.compressed
    }

    /// Record a completed turn: append to working memory, extract facts from
    /// successful tool calls, track the active file, detect corrections,
    /// compress overflow, and persist.
    pub fn update(
        &mut self,
        user_message: &str,
        assistant_response: &str,
        tool_calls: Option<Vec<ToolCallRecord>>,
        file_path: Option<&Path>,
        file_analysis: Option<serde_json::Value>,
    ) -> Result<()> {
        if let Some(calls) = &tool_calls {
            self.extract_facts(calls);
        }

        self.working.push(Turn {
            user: user_message.to_string(),
            assistant: assistant_response.to_string(),
            tool_calls,
            timestamp: chrono::Utc::now(),
        });

        if let Some(path) = file_path {
            self.fact.active_file = Some(path.display().to_string());
            if let Some(analysis) = file_analysis {
                self.fact.file_analysis = Some(analysis);
            }
        }

        self.detect_correction(user_message);

        if self.working.len() > self.max_turns * 2 {
            self.compress_old_turns();
        }

        self.save()
    }

    /// Wipe facts tied to the active file when the topic changes.
    pub fn clear_topic_memory(&mut self) {
        self.fact.active_file = None;
        self.fact.file_analysis = None;
        info!(session_id = %self.session_id, "cleared topic memory");
    }

    fn extract_facts(&mut self, calls: &[ToolCallRecord]) {
        for call in calls {
            if !call.success {
                continue;
            }
            let args = &call.arguments;

            if let Some(vehicle) = args.get("vehicle_type").and_then(|v| v.as_str()) {
                self.fact.recent_vehicle = Some(vehicle.to_string());
            }
            if let Some(pollutant) = args.get("pollutant").and_then(|v| v.as_str()) {
                self.fact.remember_pollutant(pollutant);
            }
            if let Some(pollutants) = args.get("pollutants").and_then(|v| v.as_array()) {
                for pollutant in pollutants.iter().filter_map(|p| p.as_str()) {
                    self.fact.remember_pollutant(pollutant);
                }
            }
            if let Some(year) = args.get("model_year").and_then(|v| v.as_i64()) {
                self.fact.recent_year = Some(year);
            }
        }
    }

    fn detect_correction(&mut self, user_message: &str) {
        if !CORRECTION_PATTERNS.iter().any(|p| user_message.contains(p)) {
            return;
        }
        for keyword in CORRECTION_VEHICLES {
            if user_message.contains(keyword) {
                info!(vehicle = keyword, "detected user correction");
                self.fact.recent_vehicle = Some(keyword.to_string());
                break;
            }
        }
    }

    fn compress_old_turns(&mut self) {
        let split = self.working.len() - self.max_turns;
        let old: Vec<Turn> = self.working.drain(..split).collect();

        let mut summaries = Vec::new();
        for turn in &old {
            if let Some(calls) = &turn.tool_calls {
                for call in calls {
                    summaries.push(format!("- Called {} with {}", call.name, call.arguments));
                }
            }
        }
        if !summaries.is_empty() {
            if !self.compressed.is_empty() {
                self.compressed.push('\n');
            }
            self.compressed.push_str(&summaries.join("\n"));
        }
        debug!(
            session_id = %self.session_id,
            kept = self.working.len(),
            "compressed old working memory"
        );
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let start = self.working.len().saturating_sub(MAX_PERSISTED_TURNS);
        let persisted = PersistedMemory {
            session_id: self.session_id.clone(),
            fact_memory: self.fact.clone(),
            compressed_memory: self.compressed.clone(),
            working_memory: self.working[start..].to_vec(),
        };
        let text = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...(truncated)")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, args: serde_json::Value, success: bool) -> ToolCallRecord {
        ToolCallRecord {
            name: name.to_string(),
            arguments: args,
            success,
        }
    }

    fn memory(dir: &Path) -> SessionMemory {
        SessionMemory::load(dir, "s1", 5, 300)
    }

    #[test]
    fn facts_come_only_from_successful_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(dir.path());

        mem.update(
            "查一下",
            "好的",
            Some(vec![
                record(
                    "query_emission_factors",
                    serde_json::json!({"vehicle_type": "Passenger Car", "model_year": 2020, "pollutants": ["CO2"]}),
                    true,
                ),
                record(
                    "query_emission_factors",
                    serde_json::json!({"vehicle_type": "Transit Bus"}),
                    false,
                ),
            ]),
            None,
            None,
        )
        .unwrap();

        assert_eq!(mem.fact_memory().recent_vehicle.as_deref(), Some("Passenger Car"));
        assert_eq!(mem.fact_memory().recent_year, Some(2020));
        assert_eq!(mem.fact_memory().recent_pollutants, vec!["CO2"]);
    }

    #[test]
    fn pollutants_dedupe_most_recent_first_max_five() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(dir.path());

        for pol in ["CO2", "NOx", "CO2", "PM2.5", "PM10", "THC", "SO2"] {
            mem.update(
                "q",
                "a",
                Some(vec![record(
                    "query_emission_factors",
                    serde_json::json!({"pollutant": pol}),
                    true,
                )]),
                None,
                None,
            )
            .unwrap();
        }

        let pols = &mem.fact_memory().recent_pollutants;
        assert_eq!(pols.len(), 5);
        assert_eq!(pols[0], "SO2");
        // CO2 was re-mentioned after NOx, so NOx aged out first.
        assert!(!pols.contains(&"NOx".to_string()));
        let mut dedup = pols.clone();
        dedup.dedup();
        assert_eq!(&dedup, pols);
    }

    #[test]
    fn working_memory_truncates_long_assistant_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = SessionMemory::load(dir.path(), "s1", 5, 10);
        mem.update("hi", &"x".repeat(50), None, None, None).unwrap();

        let turns = mem.working_memory();
        assert_eq!(turns.len(), 1);
        assert!(turns[0].assistant.starts_with("xxxxxxxxxx"));
        assert!(turns[0].assistant.ends_with("...(truncated)"));
    }

    #[test]
    fn overflow_compresses_into_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(dir.path());

        for i in 0..11 {
            mem.update(
                &format!("q{i}"),
                "a",
                Some(vec![record("analyze_file", serde_json::json!({"i": i}), true)]),
                None,
                None,
            )
            .unwrap();
        }

        assert!(mem.working_memory().len() <= 5);
        assert!(mem.compressed_memory().contains("Called analyze_file"));
    }

    #[test]
    fn correction_overwrites_recent_vehicle() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(dir.path());
        mem.update(
            "算排放",
            "好的",
            Some(vec![record(
                "calculate_micro_emission",
                serde_json::json!({"vehicle_type": "Transit Bus"}),
                true,
            )]),
            None,
            None,
        )
        .unwrap();
        mem.update("不对，我说的是小汽车", "明白了", None, None, None).unwrap();
        assert_eq!(mem.fact_memory().recent_vehicle.as_deref(), Some("小汽车"));
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut mem = memory(dir.path());
            mem.update(
                "查询CO2",
                "已完成",
                Some(vec![record(
                    "query_emission_factors",
                    serde_json::json!({"vehicle_type": "Passenger Car", "pollutant": "CO2"}),
                    true,
                )]),
                Some(Path::new("/tmp/a.csv")),
                Some(serde_json::json!({"task_type": "micro_emission"})),
            )
            .unwrap();
        }

        let reloaded = memory(dir.path());
        assert_eq!(reloaded.working_memory().len(), 1);
        assert_eq!(
            reloaded.fact_memory().recent_vehicle.as_deref(),
            Some("Passenger Car")
        );
        assert_eq!(
            reloaded.fact_memory().active_file.as_deref(),
            Some("/tmp/a.csv")
        );
        assert!(reloaded.fact_memory().file_analysis.is_some());
    }

    #[test]
    fn clear_topic_memory_drops_file_facts_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(dir.path());
        mem.update(
            "q",
            "a",
            Some(vec![record(
                "calculate_micro_emission",
                serde_json::json!({"vehicle_type": "Passenger Car"}),
                true,
            )]),
            Some(Path::new("/tmp/a.csv")),
            Some(serde_json::json!({})),
        )
        .unwrap();

        mem.clear_topic_memory();
        assert!(mem.fact_memory().active_file.is_none());
        assert!(mem.fact_memory().file_analysis.is_none());
        assert_eq!(mem.fact_memory().recent_vehicle.as_deref(), Some("Passenger Car"));
    }
}
