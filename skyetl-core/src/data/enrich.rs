//! Enrichment stage: left outer joins of dimension tables onto the fact table.

use crate::data::batch::{Batch, Row};
use crate::data::registry::{DatasetRegistry, JoinSpec};
use crate::data::schema::{Column, Value};
use crate::error::{EtlError, Result};
use std::collections::{HashMap, HashSet};

/// A dimension table indexed by its join key.
#[derive(Debug)]
struct PreparedJoin {
    spec: JoinSpec,
    columns: Vec<Column>,
    rows: Vec<Row>,
    index: HashMap<String, usize>,
}

impl PreparedJoin {
    fn new(spec: &JoinSpec, dimension: &Batch) -> Result<Self> {
        let mut index = HashMap::with_capacity(dimension.row_count());
        if dimension.column_count() > 0 {
            let key_idx = dimension
                .column_index(&spec.right_on)
                .ok_or_else(|| EtlError::missing_column(&spec.dimension, &spec.right_on))?;
            for (i, row) in dimension.rows.iter().enumerate() {
                let Some(key) = row[key_idx].key_text() else {
                    continue;
                };
                if index.insert(key.clone(), i).is_some() {
                    return Err(EtlError::DuplicateJoinKey {
                        dataset: spec.dimension.clone(),
                        column: spec.right_on.clone(),
                        key,
                    });
                }
            }
        }
        Ok(Self {
            spec: spec.clone(),
            columns: dimension.columns.clone(),
            rows: dimension.rows.clone(),
            index,
        })
    }

    /// Output names for this join's columns given the columns already present.
    fn output_columns(&self, existing: &mut HashSet<String>) -> Vec<Column> {
        self.columns
            .iter()
            .map(|col| {
                let base = if self.spec.always_suffix || existing.contains(&col.name) {
                    format!("{}{}", col.name, self.spec.suffix)
                } else {
                    col.name.clone()
                };
                let mut name = base.clone();
                let mut n = 2;
                while existing.contains(&name) {
                    name = format!("{base}_{n}");
                    n += 1;
                }
                existing.insert(name.clone());
                Column::new(name, col.kind)
            })
            .collect()
    }
}

/// Joins every configured dimension onto fact batches.
///
/// Dimension tables are indexed once; the enricher can then be applied to a
/// whole fact batch or to each chunk of a fact stream.
#[derive(Debug)]
pub struct Enricher {
    fact: String,
    joins: Vec<PreparedJoin>,
}

impl Enricher {
    /// Index `dimensions` (by dataset name) for the joins in `registry`.
    /// Fails on a non-unique dimension key instead of inflating the fact table.
    pub fn new(registry: &DatasetRegistry, dimensions: &HashMap<String, Batch>) -> Result<Self> {
        let fact = registry
            .fact()
            .map(|d| d.name.clone())
            .ok_or_else(|| EtlError::config("no fact dataset registered"))?;
        let mut joins = Vec::with_capacity(registry.joins.len());
        for spec in &registry.joins {
            let prepared = match dimensions.get(&spec.dimension) {
                Some(batch) => PreparedJoin::new(spec, batch)?,
                None => PreparedJoin {
                    spec: spec.clone(),
                    columns: Vec::new(),
                    rows: Vec::new(),
                    index: HashMap::new(),
                },
            };
            joins.push(prepared);
        }
        Ok(Self { fact, joins })
    }

    /// Left-join every dimension onto `fact`. The row count never changes.
    pub fn enrich(&self, mut fact: Batch) -> Result<Batch> {
        if fact.column_count() == 0 {
            return Ok(fact);
        }

        let mut existing: HashSet<String> = fact.columns.iter().map(|c| c.name.clone()).collect();
        let mut steps = Vec::with_capacity(self.joins.len());
        for join in &self.joins {
            let left_idx = fact
                .column_index(&join.spec.left_on)
                .ok_or_else(|| EtlError::missing_column(&self.fact, &join.spec.left_on))?;
            let columns = join.output_columns(&mut existing);
            steps.push((join, left_idx));
            fact.columns.extend(columns);
        }

        let mut unmatched = vec![0usize; steps.len()];
        for row in &mut fact.rows {
            let mut added = Vec::new();
            for (step, (join, left_idx)) in steps.iter().enumerate() {
                let hit = row[*left_idx]
                    .key_text()
                    .and_then(|k| join.index.get(&k))
                    .map(|&i| &join.rows[i]);
                match hit {
                    Some(dim_row) => added.extend(dim_row.iter().cloned()),
                    None => {
                        unmatched[step] += 1;
                        added.extend(std::iter::repeat_n(Value::Null, join.columns.len()));
                    }
                }
            }
            row.extend(added);
        }

        for ((join, _), missed) in steps.iter().zip(unmatched) {
            if missed > 0 {
                tracing::debug!(
                    dimension = %join.spec.dimension,
                    key = %join.spec.left_on,
                    unmatched = missed,
                    "Fact rows without a dimension match"
                );
            }
        }
        Ok(fact)
    }
}

/// Enrich the fact batch with the registry's joins in one call.
pub fn merge(
    registry: &DatasetRegistry,
    fact: Batch,
    dimensions: &HashMap<String, Batch>,
) -> Result<Batch> {
    let rows = fact.row_count();
    let enricher = Enricher::new(registry, dimensions)?;
    let enriched = enricher.enrich(fact)?;
    tracing::info!(
        rows,
        columns = enriched.column_count(),
        "Merge completed"
    );
    Ok(enriched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::registry::{AIRLINES, AIRPORTS, FLIGHTS};
    use crate::data::schema::ColumnKind;

    fn table(name: &str, cols: &[&str], rows: &[&[&str]]) -> Batch {
        Batch::new(
            name,
            cols.iter().map(|c| Column::new(*c, ColumnKind::String)).collect(),
            rows.iter()
                .map(|r| r.iter().map(|v| Value::from(*v)).collect())
                .collect(),
        )
    }

    fn flights() -> Batch {
        table(
            FLIGHTS,
            &["AIRLINE", "ORIGIN_AIRPORT", "DESTINATION_AIRPORT"],
            &[&["AA", "JFK", "LAX"], &["ZZ", "LAX", "JFK"], &["DL", "ATL", "XXX"]],
        )
    }

    fn dims() -> HashMap<String, Batch> {
        let airlines = table(
            AIRLINES,
            &["IATA_CODE", "AIRLINE"],
            &[&["AA", "American"], &["DL", "Delta"]],
        );
        let airports = table(
            AIRPORTS,
            &["IATA_CODE", "AIRPORT", "CITY"],
            &[
                &["JFK", "Kennedy", "New York"],
                &["LAX", "Los Angeles Intl", "Los Angeles"],
                &["ATL", "Hartsfield", "Atlanta"],
            ],
        );
        HashMap::from([(AIRLINES.to_string(), airlines), (AIRPORTS.to_string(), airports)])
    }

    #[test]
    fn test_merge_column_layout() {
        let out = merge(&DatasetRegistry::default(), flights(), &dims()).unwrap();
        assert_eq!(
            out.column_names(),
            vec![
                "AIRLINE",
                "ORIGIN_AIRPORT",
                "DESTINATION_AIRPORT",
                "IATA_CODE",
                "AIRLINE_AIRLINE",
                "IATA_CODE_ORIGIN",
                "AIRPORT_ORIGIN",
                "CITY_ORIGIN",
                "IATA_CODE_DEST",
                "AIRPORT_DEST",
                "CITY_DEST",
            ]
        );
        assert!(out.check_shape());
    }

    #[test]
    fn test_unknown_carrier_keeps_row_with_nulls() {
        let out = merge(&DatasetRegistry::default(), flights(), &dims()).unwrap();
        assert_eq!(out.row_count(), 3);
        let zz = &out.rows[1];
        assert!(zz[3].is_null());
        assert!(zz[4].is_null());
        assert_eq!(zz[6], Value::from("Los Angeles Intl"));
        assert_eq!(out.rows[0][4], Value::from("American"));
        assert!(out.rows[2][9].is_null());
    }

    #[test]
    fn test_empty_dimensions_degrade_to_nulls() {
        let mut d = dims();
        d.insert(AIRLINES.into(), Batch::empty(AIRLINES));
        d.insert(
            AIRPORTS.into(),
            table(AIRPORTS, &["IATA_CODE", "AIRPORT", "CITY"], &[]),
        );
        let out = merge(&DatasetRegistry::default(), flights(), &d).unwrap();
        assert_eq!(out.row_count(), 3);
        assert_eq!(out.column_count(), 3 + 6);
        assert!(out.rows.iter().all(|r| r[3..].iter().all(Value::is_null)));
    }

    #[test]
    fn test_duplicate_dimension_key_fails_loudly() {
        let mut d = dims();
        d.insert(
            AIRLINES.into(),
            table(
                AIRLINES,
                &["IATA_CODE", "AIRLINE"],
                &[&["AA", "American"], &["AA", "American Eagle"]],
            ),
        );
        let err = merge(&DatasetRegistry::default(), flights(), &d).unwrap_err();
        assert!(matches!(err, EtlError::DuplicateJoinKey { ref key, .. } if key == "AA"));
    }

    #[test]
    fn test_empty_fact() {
        let out = merge(&DatasetRegistry::default(), Batch::empty(FLIGHTS), &dims()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_numeric_keys_match_text_keys() {
        let fact = Batch::new(
            FLIGHTS,
            vec![
                Column::new("AIRLINE", ColumnKind::String),
                Column::new("ORIGIN_AIRPORT", ColumnKind::Integer),
                Column::new("DESTINATION_AIRPORT", ColumnKind::String),
            ],
            vec![vec!["AA".into(), Value::Int(10397), "JFK".into()]],
        );
        let mut d = dims();
        d.insert(
            AIRPORTS.into(),
            table(
                AIRPORTS,
                &["IATA_CODE", "AIRPORT", "CITY"],
                &[&["10397", "Atlanta Muni", "Atlanta"], &["JFK", "Kennedy", "New York"]],
            ),
        );
        let out = merge(&DatasetRegistry::default(), fact, &d).unwrap();
        assert_eq!(out.rows[0][6], Value::from("Atlanta Muni"));
    }
}
