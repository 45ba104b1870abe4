//! Dataset registry: cleaning rules and join roles per dataset.
//!
//! Built once from configuration at startup and shared read-only for the rest
//! of the run.

use serde::{Deserialize, Serialize};

pub const FLIGHTS: &str = "flights";
pub const AIRLINES: &str = "airlines";
pub const AIRPORTS: &str = "airports";

/// Whether a dataset is the enriched table or a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetRole {
    Fact,
    Dimension,
}

/// Inclusive numeric bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }
}

/// Cleaning rules for one dataset, applied in field order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CleaningRules {
    /// Rows with a null in any of these columns are dropped.
    #[serde(default)]
    pub required: Vec<String>,
    /// Columns coerced to float; failures become zero.
    #[serde(default)]
    pub numeric: Vec<String>,
    /// Columns whose values must fall inside `bounds`.
    #[serde(default)]
    pub bounded: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

/// One registered dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub name: String,
    pub role: DatasetRole,
    /// Destination table in the sink.
    pub table: String,
    /// Unique lookup key for dimension tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub rules: CleaningRules,
}

/// One left-join step of the enrichment stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Dimension dataset joined onto the fact table.
    pub dimension: String,
    /// Fact-side column.
    pub left_on: String,
    /// Dimension-side column.
    pub right_on: String,
    /// Appended to dimension column names.
    pub suffix: String,
    /// Suffix every dimension column instead of only colliding ones.
    #[serde(default)]
    pub always_suffix: bool,
}

/// Read-only mapping from dataset name to its definition, plus the join plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetDefinition>,
    pub joins: Vec<JoinSpec>,
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        Self {
            datasets: vec![
                DatasetDefinition {
                    name: FLIGHTS.into(),
                    role: DatasetRole::Fact,
                    table: "flights".into(),
                    key: None,
                    rules: CleaningRules {
                        required: strings(&["AIRLINE", "ORIGIN_AIRPORT", "DESTINATION_AIRPORT"]),
                        numeric: strings(&["DEPARTURE_DELAY", "ARRIVAL_DELAY", "CANCELLED"]),
                        bounded: strings(&["DEPARTURE_DELAY", "ARRIVAL_DELAY"]),
                        bounds: Some(Bounds {
                            min: -60.0,
                            max: 1500.0,
                        }),
                    },
                },
                DatasetDefinition {
                    name: AIRLINES.into(),
                    role: DatasetRole::Dimension,
                    table: "airlines".into(),
                    key: Some("IATA_CODE".into()),
                    rules: CleaningRules {
                        required: strings(&["IATA_CODE", "AIRLINE"]),
                        ..Default::default()
                    },
                },
                DatasetDefinition {
                    name: AIRPORTS.into(),
                    role: DatasetRole::Dimension,
                    table: "airports".into(),
                    key: Some("IATA_CODE".into()),
                    rules: CleaningRules {
                        required: strings(&["IATA_CODE", "AIRPORT", "CITY"]),
                        ..Default::default()
                    },
                },
            ],
            joins: vec![
                JoinSpec {
                    dimension: AIRLINES.into(),
                    left_on: "AIRLINE".into(),
                    right_on: "IATA_CODE".into(),
                    suffix: "_AIRLINE".into(),
                    always_suffix: false,
                },
                JoinSpec {
                    dimension: AIRPORTS.into(),
                    left_on: "ORIGIN_AIRPORT".into(),
                    right_on: "IATA_CODE".into(),
                    suffix: "_ORIGIN".into(),
                    always_suffix: true,
                },
                JoinSpec {
                    dimension: AIRPORTS.into(),
                    left_on: "DESTINATION_AIRPORT".into(),
                    right_on: "IATA_CODE".into(),
                    suffix: "_DEST".into(),
                    always_suffix: true,
                },
            ],
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl DatasetRegistry {
    pub fn get(&self, name: &str) -> Option<&DatasetDefinition> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// The single fact dataset.
    pub fn fact(&self) -> Option<&DatasetDefinition> {
        self.datasets.iter().find(|d| d.role == DatasetRole::Fact)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &DatasetDefinition> {
        self.datasets.iter().filter(|d| d.role == DatasetRole::Dimension)
    }

    /// Check internal consistency: exactly one fact table, joins reference
    /// registered dimensions, unique dataset names.
    pub fn validate(&self) -> Result<(), String> {
        let facts = self.datasets.iter().filter(|d| d.role == DatasetRole::Fact).count();
        if facts != 1 {
            return Err(format!("expected exactly one fact dataset, found {facts}"));
        }
        for (i, d) in self.datasets.iter().enumerate() {
            if self.datasets[..i].iter().any(|o| o.name == d.name) {
                return Err(format!("dataset '{}' registered twice", d.name));
            }
            if let Some(b) = d.rules.bounds
                && b.min > b.max
            {
                return Err(format!("dataset '{}' has bounds min > max", d.name));
            }
        }
        for join in &self.joins {
            match self.get(&join.dimension) {
                Some(d) if d.role == DatasetRole::Dimension => {}
                Some(_) => {
                    return Err(format!("join target '{}' is not a dimension", join.dimension));
                }
                None => return Err(format!("join target '{}' is not registered", join.dimension)),
            }
        }
        Ok(())
    }
}
