//! Canonicalization of user vocabulary.
//!
//! Vehicle types and pollutants arrive in whatever spelling the user (and
//! therefore the LLM) produced; calculators only understand the canonical
//! MOVES names. The standardizer resolves raw values through, in order:
//! exact alias lookup, fuzzy matching, and an optional out-of-process model.
//! A value that cannot be resolved is a normal `None`, never an error; the
//! executor turns unresolved identifiers into user-visible suggestions.

pub mod fallback;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use vema_core::config::StandardizerConfig;
use vema_core::mappings::Mappings;

pub use fallback::{EntityKind, FallbackGuess, FallbackStandardizer, LocalModelClient};

/// Fallback guesses below this confidence are discarded.
const FALLBACK_MIN_CONFIDENCE: f64 = 0.9;
/// Substring matching ignores patterns shorter than this many characters.
const MIN_SUBSTRING_PATTERN_CHARS: usize = 3;

pub struct Standardizer {
    mappings: Arc<Mappings>,
    vehicle_lookup: HashMap<String, String>,
    pollutant_lookup: HashMap<String, String>,
    vehicle_threshold: u32,
    pollutant_threshold: u32,
    fallback: Option<Arc<dyn FallbackStandardizer>>,
}

impl Standardizer {
    pub fn new(mappings: Arc<Mappings>, config: &StandardizerConfig) -> Self {
        let mut vehicle_lookup = HashMap::new();
        for vt in &mappings.vehicle_types {
            vehicle_lookup.insert(vt.standard_name.to_lowercase(), vt.standard_name.clone());
            vehicle_lookup.insert(vt.display_name_zh.to_lowercase(), vt.standard_name.clone());
            for alias in &vt.aliases {
                vehicle_lookup.insert(alias.to_lowercase(), vt.standard_name.clone());
            }
        }

        let mut pollutant_lookup = HashMap::new();
        for p in &mappings.pollutants {
            pollutant_lookup.insert(p.standard_name.to_lowercase(), p.standard_name.clone());
            pollutant_lookup.insert(p.display_name_zh.to_lowercase(), p.standard_name.clone());
            for alias in &p.aliases {
                pollutant_lookup.insert(alias.to_lowercase(), p.standard_name.clone());
            }
        }

        debug!(
            vehicles = vehicle_lookup.len(),
            pollutants = pollutant_lookup.len(),
            "built standardizer lookup tables"
        );

        Self {
            mappings,
            vehicle_lookup,
            pollutant_lookup,
            vehicle_threshold: config.vehicle_fuzzy_threshold,
            pollutant_threshold: config.pollutant_fuzzy_threshold,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackStandardizer>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Resolve a raw vehicle spelling to its canonical name.
    pub async fn standardize_vehicle(&self, raw: &str) -> Option<String> {
        self.standardize(raw, EntityKind::Vehicle).await
    }

    /// Resolve a raw pollutant spelling to its canonical name.
    pub async fn standardize_pollutant(&self, raw: &str) -> Option<String> {
        self.standardize(raw, EntityKind::Pollutant).await
    }

    async fn standardize(&self, raw: &str, kind: EntityKind) -> Option<String> {
        let raw_lower = raw.trim().to_lowercase();
        if raw_lower.is_empty() {
            return None;
        }

        let (lookup, threshold) = match kind {
            EntityKind::Vehicle => (&self.vehicle_lookup, self.vehicle_threshold),
            EntityKind::Pollutant => (&self.pollutant_lookup, self.pollutant_threshold),
        };

        if let Some(standard) = lookup.get(&raw_lower) {
            debug!(%raw, %standard, "exact match");
            return Some(standard.clone());
        }

        if let Some((standard, score)) = fuzzy_best(lookup, &raw_lower, threshold) {
            debug!(%raw, %standard, score, "fuzzy match");
            return Some(standard);
        }

        if let Some(fallback) = &self.fallback {
            if let Some(guess) = fallback.standardize(kind, raw).await {
                if guess.confidence >= FALLBACK_MIN_CONFIDENCE
                    && lookup.values().any(|v| *v == guess.standard_name)
                {
                    debug!(%raw, standard = %guess.standard_name, confidence = guess.confidence, "fallback match");
                    return Some(guess.standard_name);
                }
            }
        }

        warn!(%raw, ?kind, "cannot standardize value");
        None
    }

    /// Vehicle suggestions for clarification messages: the six most common
    /// types with their Chinese display names.
    pub fn get_vehicle_suggestions(&self) -> Vec<String> {
        const COMMON_TYPES: [&str; 6] = [
            "Passenger Car",
            "Transit Bus",
            "Light Commercial Truck",
            "Combination Long-haul Truck",
            "Passenger Truck",
            "Intercity Bus",
        ];

        COMMON_TYPES
            .iter()
            .filter_map(|standard| {
                self.mappings
                    .vehicle_types
                    .iter()
                    .find(|vt| vt.standard_name == *standard)
                    .map(|vt| format!("{} ({})", vt.display_name_zh, vt.standard_name))
            })
            .collect()
    }

    pub fn get_pollutant_suggestions(&self) -> Vec<String> {
        self.mappings
            .pollutants
            .iter()
            .map(|p| p.standard_name.clone())
            .collect()
    }

    /// Map raw column names onto the standard field names of a task type.
    ///
    /// Pass 1 accepts exact (case-insensitive) alias equality; pass 2 accepts
    /// substring containment in either direction for patterns of at least
    /// three characters, preferring the longest pattern. A standard field
    /// already claimed by an earlier column is never reassigned.
    pub fn map_columns(&self, columns: &[String], task_type: &str) -> HashMap<String, String> {
        let patterns = self.mappings.get_column_patterns(task_type);
        let mut mapping: HashMap<String, String> = HashMap::new();

        for col in columns {
            let col_lower = col.trim().to_lowercase();

            let exact = patterns.values().find(|field| {
                field
                    .patterns
                    .iter()
                    .any(|p| p.to_lowercase() == col_lower)
            });
            if let Some(field) = exact {
                mapping.insert(col.clone(), field.standard.clone());
                continue;
            }

            let mut best: Option<(&str, usize)> = None;
            for field in patterns.values() {
                if mapping.values().any(|v| *v == field.standard) {
                    continue;
                }
                for p in &field.patterns {
                    let p_lower = p.to_lowercase();
                    let p_chars = p_lower.chars().count();
                    if p_chars < MIN_SUBSTRING_PATTERN_CHARS {
                        continue;
                    }
                    if p_lower.contains(&col_lower) || col_lower.contains(&p_lower) {
                        if best.map_or(true, |(_, len)| p_chars > len) {
                            best = Some((field.standard.as_str(), p_chars));
                        }
                    }
                }
            }
            if let Some((standard, _)) = best {
                debug!(column = %col, %standard, "column substring match");
                mapping.insert(col.clone(), standard.to_string());
            }
        }

        mapping
    }

    pub fn get_required_columns(&self, task_type: &str) -> Vec<String> {
        self.mappings.get_required_columns(task_type)
    }

    pub fn normalize_season(&self, raw: &str) -> Option<String> {
        self.mappings.normalize_season(raw)
    }
}

/// Best fuzzy candidate at or above `threshold`, scored 0-100.
fn fuzzy_best(
    lookup: &HashMap<String, String>,
    raw_lower: &str,
    threshold: u32,
) -> Option<(String, u32)> {
    let mut best: Option<(String, u32)> = None;
    for (key, standard) in lookup {
        let score = (strsim::normalized_levenshtein(raw_lower, key) * 100.0).round() as u32;
        if score >= threshold && best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((standard.clone(), score));
        }
    }
    best
}
