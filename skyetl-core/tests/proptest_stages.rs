//! Property-based tests for the cleaning, enrichment and assembly stages.

use proptest::prelude::*;

use skyetl_core::data::assemble::ChunkAssembler;
use skyetl_core::data::batch::{Batch, Row};
use skyetl_core::data::clean::{StreamingCleaner, clean};
use skyetl_core::data::enrich::merge;
use skyetl_core::data::registry::{AIRLINES, AIRPORTS, DatasetRegistry, FLIGHTS};
use skyetl_core::data::schema::{Column, ColumnKind, Value};
use std::collections::HashMap;

const FLIGHT_COLUMNS: [&str; 5] = [
    "AIRLINE",
    "ORIGIN_AIRPORT",
    "DESTINATION_AIRPORT",
    "DEPARTURE_DELAY",
    "ARRIVAL_DELAY",
];

fn code(choices: &'static [&'static str]) -> impl Strategy<Value = Value> {
    prop_oneof![
        4 => prop::sample::select(choices).prop_map(|s: &str| Value::from(s)),
        1 => Just(Value::Null),
    ]
}

fn delay() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-100i64..1600).prop_map(Value::Int),
        (-100.0f64..1600.0).prop_map(Value::Float),
        Just(Value::Null),
        Just(Value::from("NaN")),
        Just(Value::from("late")),
    ]
}

fn flight_row() -> impl Strategy<Value = Row> {
    (
        code(&["AA", "DL", "UA", "ZZ"]),
        code(&["JFK", "LAX", "ATL", "XXX"]),
        code(&["JFK", "LAX", "ATL", "XXX"]),
        delay(),
        delay(),
    )
        .prop_map(|(a, o, d, dep, arr)| vec![a, o, d, dep, arr])
}

fn flights(rows: Vec<Row>) -> Batch {
    Batch::new(
        FLIGHTS,
        FLIGHT_COLUMNS
            .iter()
            .map(|n| Column::new(*n, ColumnKind::String))
            .collect(),
        rows,
    )
}

fn dimensions() -> HashMap<String, Batch> {
    let text = |name: &str, cols: &[&str], rows: &[&[&str]]| {
        Batch::new(
            name,
            cols.iter().map(|c| Column::new(*c, ColumnKind::String)).collect(),
            rows.iter()
                .map(|r| r.iter().map(|v| Value::from(*v)).collect())
                .collect(),
        )
    };
    HashMap::from([
        (
            AIRLINES.to_string(),
            text(
                AIRLINES,
                &["IATA_CODE", "AIRLINE"],
                &[&["AA", "American"], &["DL", "Delta"], &["UA", "United"]],
            ),
        ),
        (
            AIRPORTS.to_string(),
            text(
                AIRPORTS,
                &["IATA_CODE", "AIRPORT", "CITY"],
                &[
                    &["JFK", "Kennedy", "New York"],
                    &["LAX", "LAX Intl", "Los Angeles"],
                    &["ATL", "Hartsfield", "Atlanta"],
                ],
            ),
        ),
    ])
}

fn flights_def() -> skyetl_core::data::registry::DatasetDefinition {
    DatasetRegistry::default().get(FLIGHTS).cloned().unwrap()
}

// --- Cleaning properties ---

proptest! {
    #[test]
    fn cleaning_is_idempotent(rows in prop::collection::vec(flight_row(), 0..60)) {
        let def = flights_def();
        let (once, _) = clean(&def, flights(rows)).unwrap();
        let (twice, report) = clean(&def, once.clone()).unwrap();
        prop_assert_eq!(&twice, &once);
        prop_assert_eq!(report.rows_in, report.rows_out);
    }

    #[test]
    fn cleaning_never_adds_rows(rows in prop::collection::vec(flight_row(), 0..60)) {
        let n = rows.len();
        let (out, report) = clean(&flights_def(), flights(rows)).unwrap();
        prop_assert!(out.row_count() <= n);
        prop_assert_eq!(
            report.rows_out,
            report.rows_in
                - report.dropped_missing
                - report.dropped_duplicates
                - report.dropped_out_of_range
        );
        prop_assert!(out.check_shape());
    }

    #[test]
    fn streaming_cleaner_matches_whole_batch(
        rows in prop::collection::vec(flight_row(), 1..60),
        chunk_size in 1usize..10,
    ) {
        let def = flights_def();
        let (whole, _) = clean(&def, flights(rows.clone())).unwrap();
        let mut cleaner = StreamingCleaner::new(def);
        let mut streamed = Vec::new();
        for part in rows.chunks(chunk_size) {
            streamed.extend(cleaner.clean_chunk(flights(part.to_vec())).unwrap().rows);
        }
        prop_assert_eq!(streamed, whole.rows);
    }

    #[test]
    fn streaming_cleaner_agrees_when_chunk_kinds_differ(
        rows in prop::collection::vec(text_flight_row(), 1..40),
        chunk_size in 1usize..6,
    ) {
        let def = flights_def();
        let (whole, _) = clean(&def, text_flights(rows.clone())).unwrap();
        let mut cleaner = StreamingCleaner::new(def);
        let mut streamed = 0;
        for part in rows.chunks(chunk_size) {
            streamed += cleaner.clean_chunk(text_flights(part.to_vec())).unwrap().row_count();
        }
        prop_assert_eq!(streamed, whole.row_count());
    }
}

const TEXT_FLIGHT_COLUMNS: [&str; 4] =
    ["AIRLINE", "ORIGIN_AIRPORT", "DESTINATION_AIRPORT", "TAIL_NUMBER"];

/// Raw text rows whose TAIL_NUMBER column reads as integers in some chunks
/// and as text in others.
fn text_flight_row() -> impl Strategy<Value = Vec<Option<String>>> {
    (
        prop::sample::select(&["AA", "DL"][..]),
        prop::sample::select(&["JFK", "LAX"][..]),
        prop::sample::select(&["123", "456", "N1X"][..]),
    )
        .prop_map(|(airline, origin, tail)| {
            vec![
                Some(airline.to_string()),
                Some(origin.to_string()),
                Some("ATL".to_string()),
                Some(tail.to_string()),
            ]
        })
}

fn text_flights(rows: Vec<Vec<Option<String>>>) -> Batch {
    let headers = TEXT_FLIGHT_COLUMNS.iter().map(|c| c.to_string()).collect();
    Batch::from_text_rows(FLIGHTS, headers, rows)
}

// --- Enrichment properties ---

proptest! {
    #[test]
    fn merge_preserves_fact_row_count(rows in prop::collection::vec(flight_row(), 0..60)) {
        let fact = flights(rows);
        let n = fact.row_count();
        let out = merge(&DatasetRegistry::default(), fact, &dimensions()).unwrap();
        prop_assert_eq!(out.row_count(), n);
        prop_assert!(out.check_shape());
    }
}

// --- Assembly properties ---

proptest! {
    #[test]
    fn chunks_reassemble_to_the_original(
        values in prop::collection::vec(any::<i64>(), 1..200),
        chunk_size in 1usize..25,
    ) {
        let batch = Batch::new(
            FLIGHTS,
            vec![Column::new("FLIGHT_NUMBER", ColumnKind::Integer)],
            values.into_iter().map(|v| vec![Value::Int(v)]).collect(),
        );
        let mut assembler = ChunkAssembler::new(FLIGHTS);
        for chunk in batch.chunks(chunk_size) {
            assembler
                .push(Batch::new(FLIGHTS, chunk.columns.to_vec(), chunk.rows.to_vec()))
                .unwrap();
        }
        prop_assert_eq!(assembler.chunks(), batch.row_count().div_ceil(chunk_size));
        prop_assert_eq!(assembler.finish(), batch);
    }
}
