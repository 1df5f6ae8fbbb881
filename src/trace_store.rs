//! Per-cell time series parsed from the tabular trace dataset.
//!
//! The dataset has one row per (cell, frame) observation. Rows are grouped
//! into one [`Trace`] per distinct `(fov, cell)` pair, in order of first
//! appearance, and every trace keeps its observations sorted by frame.

use crate::error::{CurationError, CurationResult, ErrorCode};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

pub const REQUIRED_COLUMNS: [&str; 4] = ["fov", "cell", "frame", "value"];
pub const EXPORT_COLUMNS: [&str; 7] = ["fov", "cell", "frame", "value", "x", "y", "good"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId {
    pub fov: u32,
    pub cell: u32,
}

impl CellId {
    pub fn new(fov: u32, cell: u32) -> Self {
        Self { fov, cell }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fov, self.cell)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub cell_id: CellId,
    pub frames: Vec<usize>,
    pub values: Vec<f64>,
    pub x_positions: Vec<f64>,
    pub y_positions: Vec<f64>,
    quality: bool,
}

impl Trace {
    pub fn fov(&self) -> u32 {
        self.cell_id.fov
    }

    pub fn cell(&self) -> u32 {
        self.cell_id.cell
    }

    pub fn is_good(&self) -> bool {
        self.quality
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Index of `frame` in the observation sequence, if the cell was seen then.
    pub fn frame_index(&self, frame: usize) -> Option<usize> {
        self.frames.binary_search(&frame).ok()
    }

    pub fn position_at(&self, frame: usize) -> Option<(f64, f64)> {
        self.frame_index(frame)
            .map(|i| (self.x_positions[i], self.y_positions[i]))
    }

    pub fn value_at(&self, frame: usize) -> Option<f64> {
        self.frame_index(frame).map(|i| self.values[i])
    }

    pub fn points(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.frames.iter().copied().zip(self.values.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowParseError {
    /// 1-based line in the source text; the header is line 1.
    pub line: u64,
    pub message: String,
}

impl fmt::Display for RowParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub rows_read: usize,
    pub rows_loaded: usize,
    pub errors: Vec<RowParseError>,
}

impl LoadSummary {
    pub fn rows_skipped(&self) -> usize {
        self.errors.len()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    fov: usize,
    cell: usize,
    frame: usize,
    value: usize,
    x: Option<usize>,
    y: Option<usize>,
    good: Option<usize>,
}

impl Columns {
    fn from_header(header: &csv::StringRecord) -> CurationResult<Self> {
        let index: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_ascii_lowercase(), i))
            .collect();
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|name| !index.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(CurationError::schema(format!(
                "trace dataset is missing required column(s): {}",
                missing.join(", ")
            )));
        }
        Ok(Self {
            fov: index["fov"],
            cell: index["cell"],
            frame: index["frame"],
            value: index["value"],
            x: index.get("x").copied(),
            y: index.get("y").copied(),
            good: index.get("good").copied(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    line: u64,
    frame: usize,
    value: f64,
    x: f64,
    y: f64,
}

#[derive(Debug, Default)]
struct TraceBuilder {
    observations: Vec<Observation>,
    quality: bool,
}

fn parse_index(field: &str, name: &str) -> Result<usize, String> {
    let text = field.trim();
    if let Ok(v) = text.parse::<usize>() {
        return Ok(v);
    }
    // Writers that went through a float column emit "3.0".
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => {
            Ok(v as usize)
        }
        _ => Err(format!("'{name}' is not a non-negative integer: '{text}'")),
    }
}

fn parse_id(field: &str, name: &str) -> Result<u32, String> {
    let v = parse_index(field, name)?;
    u32::try_from(v).map_err(|_| format!("'{name}' is out of range: '{}'", field.trim()))
}

fn parse_number(field: &str, name: &str) -> Result<f64, String> {
    let text = field.trim();
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("'{name}' is not a finite number: '{text}'")),
    }
}

fn parse_optional_number(field: Option<&str>, name: &str) -> Result<f64, String> {
    match field.map(str::trim) {
        None | Some("") => Ok(0.0),
        Some(text) => parse_number(text, name),
    }
}

fn parse_good(field: Option<&str>) -> Result<bool, String> {
    match field.map(|s| s.trim().to_ascii_lowercase()) {
        None => Ok(true),
        Some(text) => match text.as_str() {
            "" | "true" | "t" | "yes" | "1" | "1.0" => Ok(true),
            "false" | "f" | "no" | "0" | "0.0" => Ok(false),
            _ => Err(format!("'good' is not a boolean: '{text}'")),
        },
    }
}

fn parse_row(
    record: &csv::StringRecord,
    columns: &Columns,
    width: usize,
) -> Result<(CellId, Observation, bool), String> {
    if record.len() != width {
        return Err(format!(
            "expected {width} fields, found {}",
            record.len()
        ));
    }
    let field = |i: usize| record.get(i).unwrap_or_default();
    let fov = parse_id(field(columns.fov), "fov")?;
    let cell = parse_id(field(columns.cell), "cell")?;
    let frame = parse_index(field(columns.frame), "frame")?;
    let value = parse_number(field(columns.value), "value")?;
    let x = parse_optional_number(columns.x.map(field), "x")?;
    let y = parse_optional_number(columns.y.map(field), "y")?;
    let good = parse_good(columns.good.map(field))?;
    Ok((
        CellId::new(fov, cell),
        Observation {
            line: 0,
            frame,
            value,
            x,
            y,
        },
        good,
    ))
}

/// The loaded dataset: one trace per cell, in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceSet {
    traces: IndexMap<CellId, Trace>,
}

impl TraceSet {
    /// Parses the tabular text. Only a missing required column is fatal;
    /// unreadable rows are skipped and reported in the summary.
    pub fn load(text: &str) -> CurationResult<(Self, LoadSummary)> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let header = reader.headers()?.clone();
        let columns = Columns::from_header(&header)?;
        let width = header.len();

        let mut summary = LoadSummary::default();
        let mut builders: IndexMap<CellId, TraceBuilder> = IndexMap::new();
        for (row_idx, result) in reader.records().enumerate() {
            summary.rows_read += 1;
            let fallback_line = row_idx as u64 + 2;
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(fallback_line);
                    Self::skip_row(&mut summary, line, e.to_string());
                    continue;
                }
            };
            let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);
            match parse_row(&record, &columns, width) {
                Ok((cell_id, mut observation, good)) => {
                    observation.line = line;
                    let builder = builders.entry(cell_id).or_insert_with(|| TraceBuilder {
                        observations: vec![],
                        quality: true,
                    });
                    builder.observations.push(observation);
                    builder.quality &= good;
                }
                Err(message) => Self::skip_row(&mut summary, line, message),
            }
        }

        let mut traces = IndexMap::with_capacity(builders.len());
        for (cell_id, mut builder) in builders {
            // Stable sort keeps the first occurrence of a duplicated frame in front.
            builder.observations.sort_by_key(|o| o.frame);
            let mut trace = Trace {
                cell_id,
                frames: Vec::with_capacity(builder.observations.len()),
                values: Vec::with_capacity(builder.observations.len()),
                x_positions: Vec::with_capacity(builder.observations.len()),
                y_positions: Vec::with_capacity(builder.observations.len()),
                quality: builder.quality,
            };
            for o in builder.observations {
                if trace.frames.last() == Some(&o.frame) {
                    Self::skip_row(
                        &mut summary,
                        o.line,
                        format!("duplicate frame {} for cell {cell_id}", o.frame),
                    );
                    continue;
                }
                trace.frames.push(o.frame);
                trace.values.push(o.value);
                trace.x_positions.push(o.x);
                trace.y_positions.push(o.y);
            }
            summary.rows_loaded += trace.len();
            traces.insert(cell_id, trace);
        }
        summary.errors.sort_by_key(|e| e.line);

        log::info!(
            "Loaded {} traces from {} rows ({} skipped)",
            traces.len(),
            summary.rows_read,
            summary.rows_skipped()
        );
        Ok((Self { traces }, summary))
    }

    fn skip_row(summary: &mut LoadSummary, line: u64, message: String) {
        log::warn!("Skipping trace row at line {line}: {message}");
        summary.errors.push(RowParseError { line, message });
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn get(&self, cell_id: &CellId) -> Option<&Trace> {
        self.traces.get(cell_id)
    }

    pub fn contains(&self, cell_id: &CellId) -> bool {
        self.traces.contains_key(cell_id)
    }

    /// Position of the cell in load order.
    pub fn index_of(&self, cell_id: &CellId) -> Option<usize> {
        self.traces.get_index_of(cell_id)
    }

    pub fn cell_ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.traces.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trace> {
        self.traces.values()
    }

    /// Cells in load order within `[start, end)`.
    pub fn cell_ids_in(&self, start: usize, end: usize) -> Vec<CellId> {
        self.traces
            .get_range(start..end.min(self.traces.len()))
            .map(|slice| slice.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn good_count(&self) -> usize {
        self.traces.values().filter(|t| t.quality).count()
    }

    pub fn bad_count(&self) -> usize {
        self.len() - self.good_count()
    }

    pub fn quality(&self, cell_id: &CellId) -> CurationResult<bool> {
        self.traces
            .get(cell_id)
            .map(|t| t.quality)
            .ok_or_else(|| Self::missing(cell_id))
    }

    /// Inverts the flag and returns the new value.
    pub fn toggle_quality(&mut self, cell_id: &CellId) -> CurationResult<bool> {
        let trace = self
            .traces
            .get_mut(cell_id)
            .ok_or_else(|| Self::missing(cell_id))?;
        trace.quality = !trace.quality;
        log::debug!("Cell {cell_id} marked {}", if trace.quality { "good" } else { "bad" });
        Ok(trace.quality)
    }

    pub fn set_quality(&mut self, cell_id: &CellId, good: bool) -> CurationResult<()> {
        let trace = self
            .traces
            .get_mut(cell_id)
            .ok_or_else(|| Self::missing(cell_id))?;
        trace.quality = good;
        Ok(())
    }

    fn missing(cell_id: &CellId) -> CurationError {
        CurationError::not_found(format!("no trace for cell {cell_id}"))
    }

    /// Serializes every observation with the current quality flags.
    pub fn export(&self) -> CurationResult<String> {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer.write_record(EXPORT_COLUMNS)?;
        for trace in self.traces.values() {
            let fov = trace.fov().to_string();
            let cell = trace.cell().to_string();
            let good = trace.quality.to_string();
            for i in 0..trace.len() {
                writer.write_record(&[
                    fov.clone(),
                    cell.clone(),
                    trace.frames[i].to_string(),
                    trace.values[i].to_string(),
                    trace.x_positions[i].to_string(),
                    trace.y_positions[i].to_string(),
                    good.clone(),
                ])?;
            }
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| CurationError::from(e.into_error()))?;
        String::from_utf8(bytes)
            .map_err(|e| CurationError::new(ErrorCode::Io, e.to_string()))
    }

    /// Writes the export next to `source` and returns the written path.
    /// `source` is a path on the local filesystem.
    pub fn save_inspected(&self, source: &Path, suffix: &str) -> CurationResult<PathBuf> {
        let target = inspected_path(source, suffix);
        self.write_export(&target)?;
        Ok(target)
    }

    pub fn write_export(&self, target: &Path) -> CurationResult<()> {
        std::fs::write(target, self.export()?).map_err(|e| {
            CurationError::new(
                ErrorCode::Io,
                format!("Could not write '{}': {e}", target.display()),
            )
        })?;
        log::info!("Saved curated traces to {}", target.display());
        Ok(())
    }
}

/// `dir/name.csv` becomes `dir/name<suffix>.csv`. A file that already
/// carries the suffix maps onto itself, so re-curation updates the curated
/// copy and the raw dataset is never touched.
pub fn inspected_path(source: &Path, suffix: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "traces".to_string());
    let stem = if !suffix.is_empty() && stem.ends_with(suffix) {
        stem
    } else {
        format!("{stem}{suffix}")
    };
    let name = match source.extension() {
        Some(ext) => format!("{stem}.{}", ext.to_string_lossy()),
        None => stem,
    };
    source.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
fov,cell,frame,value,x,y,good
0,1,0,10.5,12.0,14.0,true
0,1,1,11.0,12.5,14.5,true
0,2,0,3.0,50.0,60.0,false
0,1,2,12.25,13.0,15.0,true
0,2,2,4.0,51.0,61.0,false
";

    fn load(text: &str) -> (TraceSet, LoadSummary) {
        TraceSet::load(text).unwrap()
    }

    #[test]
    fn test_load_groups_rows_per_cell_in_first_seen_order() {
        let (set, summary) = load(SAMPLE);
        assert!(summary.is_clean());
        assert_eq!(summary.rows_loaded, 5);
        assert_eq!(
            set.cell_ids().collect::<Vec<_>>(),
            vec![CellId::new(0, 1), CellId::new(0, 2)]
        );
        let t = set.get(&CellId::new(0, 1)).unwrap();
        assert_eq!(t.frames, vec![0, 1, 2]);
        assert_eq!(t.values, vec![10.5, 11.0, 12.25]);
        assert_eq!(t.position_at(1), Some((12.5, 14.5)));
        assert!(t.is_good());
        let t2 = set.get(&CellId::new(0, 2)).unwrap();
        assert_eq!(t2.frames, vec![0, 2]);
        assert!(!t2.is_good());
        assert_eq!(t2.position_at(1), None);
    }

    #[test]
    fn test_parallel_sequences_have_equal_length() {
        let (set, _) = load(SAMPLE);
        for t in set.iter() {
            assert_eq!(t.frames.len(), t.values.len());
            assert_eq!(t.frames.len(), t.x_positions.len());
            assert_eq!(t.frames.len(), t.y_positions.len());
            assert!(t.frames.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_optional_columns_default() {
        let (set, _) = load("fov,cell,frame,value\n1,4,0,2.0\n1,4,1,3.0\n");
        let t = set.get(&CellId::new(1, 4)).unwrap();
        assert!(t.is_good());
        assert_eq!(t.x_positions, vec![0.0, 0.0]);
        assert_eq!(t.y_positions, vec![0.0, 0.0]);
    }

    #[test]
    fn test_missing_required_columns_names_all_of_them() {
        let err = TraceSet::load("fov,frame,x,y\n0,0,1,1\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::Schema);
        assert!(err.message.contains("cell"));
        assert!(err.message.contains("value"));
        assert!(!err.message.contains("fov,"));
    }

    #[test]
    fn test_header_matching_ignores_case_and_whitespace() {
        let (set, _) = load(" FOV , Cell ,Frame,VALUE\n0,1,0,1.0\n");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_non_numeric_value_skips_only_that_row() {
        let text = "fov,cell,frame,value\n0,1,0,1.0\n0,1,1,abc\n0,1,2,3.0\n";
        let (set, summary) = load(text);
        let t = set.get(&CellId::new(0, 1)).unwrap();
        assert_eq!(t.frames, vec![0, 2]);
        assert_eq!(t.values, vec![1.0, 3.0]);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].line, 3);
        assert!(summary.errors[0].message.contains("value"));
    }

    #[test]
    fn test_short_row_and_bad_good_flag_are_skipped() {
        let text = "fov,cell,frame,value,good\n0,1,0,1.0,true\n0,1,1\n0,1,2,2.0,maybe\n0,1,3,4.0,0\n";
        let (set, summary) = load(text);
        assert_eq!(summary.rows_read, 4);
        assert_eq!(summary.rows_skipped(), 2);
        let t = set.get(&CellId::new(0, 1)).unwrap();
        assert_eq!(t.frames, vec![0, 3]);
        assert!(!t.is_good());
    }

    #[test]
    fn test_unsorted_rows_are_sorted_and_duplicates_dropped() {
        let text = "fov,cell,frame,value\n0,1,5,5.0\n0,1,2,2.0\n0,1,5,99.0\n";
        let (set, summary) = load(text);
        let t = set.get(&CellId::new(0, 1)).unwrap();
        assert_eq!(t.frames, vec![2, 5]);
        assert_eq!(t.values, vec![2.0, 5.0]);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].line, 4);
    }

    #[test]
    fn test_float_formatted_indices_are_accepted() {
        let (set, summary) = load("fov,cell,frame,value\n0.0,3.0,1.0,2.5\n");
        assert!(summary.is_clean());
        assert_eq!(set.get(&CellId::new(0, 3)).unwrap().frames, vec![1]);
    }

    #[test]
    fn test_cell_with_only_bad_rows_yields_no_trace() {
        let (set, summary) = load("fov,cell,frame,value\n0,1,0,x\n0,2,0,1.0\n");
        assert_eq!(set.len(), 1);
        assert!(!set.contains(&CellId::new(0, 1)));
        assert_eq!(summary.rows_skipped(), 1);
    }

    #[test]
    fn test_toggle_twice_restores_and_set_is_idempotent() {
        let (mut set, _) = load(SAMPLE);
        let id = CellId::new(0, 1);
        assert!(!set.toggle_quality(&id).unwrap());
        assert!(set.toggle_quality(&id).unwrap());
        set.set_quality(&id, true).unwrap();
        set.set_quality(&id, true).unwrap();
        assert!(set.quality(&id).unwrap());
        assert_eq!(set.good_count(), 1);
        assert_eq!(set.bad_count(), 1);
    }

    #[test]
    fn test_unknown_cell_is_not_found() {
        let (mut set, _) = load(SAMPLE);
        let id = CellId::new(9, 9);
        assert_eq!(set.toggle_quality(&id).unwrap_err().code, ErrorCode::NotFound);
        assert_eq!(set.set_quality(&id, false).unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn test_export_reload_preserves_curation() {
        let (mut set, _) = load(SAMPLE);
        set.toggle_quality(&CellId::new(0, 1)).unwrap();
        set.set_quality(&CellId::new(0, 2), true).unwrap();
        set.toggle_quality(&CellId::new(0, 2)).unwrap();
        let text = set.export().unwrap();
        assert!(text.starts_with("fov,cell,frame,value,x,y,good\n"));
        let (reloaded, summary) = load(&text);
        assert!(summary.is_clean());
        assert_eq!(reloaded, set);
    }

    #[test]
    fn test_export_keeps_frame_order_within_cell() {
        let (set, _) = load(SAMPLE);
        let text = set.export().unwrap();
        let frames: Vec<&str> = text
            .lines()
            .skip(1)
            .filter(|l| l.starts_with("0,1,"))
            .map(|l| l.split(',').nth(2).unwrap())
            .collect();
        assert_eq!(frames, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_cell_ids_in_clamps_to_len() {
        let (set, _) = load(SAMPLE);
        assert_eq!(set.cell_ids_in(1, 10), vec![CellId::new(0, 2)]);
        assert!(set.cell_ids_in(5, 10).is_empty());
    }

    #[test]
    fn test_inspected_path_never_touches_raw_dataset() {
        let raw = Path::new("/out/fov_000/run_fov000_traces.csv");
        let curated = inspected_path(raw, "_inspected");
        assert_eq!(
            curated,
            Path::new("/out/fov_000/run_fov000_traces_inspected.csv")
        );
        assert_ne!(curated, raw);
        assert_eq!(inspected_path(&curated, "_inspected"), curated);
    }

    #[test]
    fn test_save_inspected_writes_sibling_file() {
        let td = tempdir().unwrap();
        let source = td.path().join("traces.csv");
        std::fs::write(&source, SAMPLE).unwrap();
        let (mut set, _) = load(SAMPLE);
        set.set_quality(&CellId::new(0, 1), false).unwrap();
        let written = set.save_inspected(&source, "_inspected").unwrap();
        assert_eq!(written, td.path().join("traces_inspected.csv"));
        assert_eq!(std::fs::read_to_string(&source).unwrap(), SAMPLE);
        let (reloaded, _) = load(&std::fs::read_to_string(&written).unwrap());
        assert!(!reloaded.quality(&CellId::new(0, 1)).unwrap());
    }
}
