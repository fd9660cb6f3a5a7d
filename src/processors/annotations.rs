//! Export of the latest human classification per ROI.
//!
//! The export runs in two halves. [`ExportQuery`] composes the SQL that
//! selects, for each ROI in the chosen datasets, the most recent human
//! classification and its aggregated tags; the operator runs it with their
//! own database client. [`normalize`] then turns each result row into the
//! export format, where `class_tag` combines the class name with its tags.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Timelike, Utc};
use csv::ReaderBuilder;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::core::pid::bin_of;

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Separator between aggregated tags in the query output.
pub const TAG_SEPARATOR: &str = "||";

/// Marker placed between a class name and its tags in `class_tag`.
pub const TAG_MARKER: &str = "_TAG_";

/// Errors that can occur while preparing or normalizing an export.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("No datasets provided or parsed")]
    NoDatasets,
}

/// Result type for annotation operations.
pub type Result<T> = std::result::Result<T, AnnotationError>;

/// Non-blank lines of a list file, skipping `#` comments.
pub fn load_list_file(path: &Path) -> Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut values = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let value = line.trim();
        if !value.is_empty() && !value.starts_with('#') {
            values.push(value.to_string());
        }
    }
    Ok(values)
}

/// Unique, sorted bins named in a file of bins or PIDs.
///
/// Only the first comma-separated token of each line is read. Reading stops
/// once `limit` distinct bins have been seen.
///
/// # Errors
///
/// Returns [`AnnotationError::NotFound`] if the file does not exist.
pub fn load_bins_from_file(path: &Path, limit: Option<usize>) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(AnnotationError::NotFound(path.to_path_buf()));
    }

    let reader = BufReader::new(File::open(path)?);
    let mut bins = BTreeSet::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let token = line.split(',').next().unwrap_or_default().trim();
        bins.insert(bin_of(token).to_string());

        if limit.is_some_and(|l| l > 0 && bins.len() >= l) {
            break;
        }
    }

    Ok(bins.into_iter().collect())
}

/// Merge datasets from the command line and a list file.
///
/// Falls back to `defaults` when both are empty. The result is trimmed,
/// deduplicated and sorted.
///
/// # Errors
///
/// Returns [`AnnotationError::NoDatasets`] if nothing remains.
pub fn resolve_datasets(cli: &[String], from_file: &[String], defaults: &[String]) -> Result<Vec<String>> {
    let mut chosen: Vec<&String> = cli.iter().chain(from_file.iter()).collect();
    if chosen.is_empty() {
        chosen = defaults.iter().collect();
    }

    let datasets: BTreeSet<String> = chosen
        .into_iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if datasets.is_empty() {
        return Err(AnnotationError::NoDatasets);
    }
    Ok(datasets.into_iter().collect())
}

/// Export filters as given by the caller, with list files not yet read.
#[derive(Debug, Clone, Default)]
pub struct ExportFilters {
    pub datasets: Vec<String>,
    pub datasets_file: Option<PathBuf>,
    pub bins_file: Option<PathBuf>,
    pub tags: Vec<String>,
    pub users: Vec<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    /// Row limit of the query. The bins file is always read in full.
    pub limit: Option<usize>,
}

impl ExportFilters {
    /// Read the list files and build the query.
    ///
    /// # Errors
    ///
    /// Returns an error if a list file cannot be read or no dataset remains.
    pub fn resolve(self, default_datasets: &[String]) -> Result<ExportQuery> {
        let from_file = match &self.datasets_file {
            Some(path) => load_list_file(path)?,
            None => Vec::new(),
        };
        let datasets = resolve_datasets(&self.datasets, &from_file, default_datasets)?;

        let bins = match &self.bins_file {
            Some(path) => load_bins_from_file(path, None)?,
            None => Vec::new(),
        };

        Ok(ExportQuery {
            datasets,
            bins,
            tags: self.tags,
            users: self.users,
            since: self.since,
            until: self.until,
            limit: self.limit,
        })
    }
}

/// Filters for the export query.
#[derive(Debug, Clone, Default)]
pub struct ExportQuery {
    pub datasets: Vec<String>,
    pub bins: Vec<String>,
    /// Substrings matched case-insensitively against aggregated tags.
    pub tags: Vec<String>,
    /// Classification authors.
    pub users: Vec<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}

/// A bound value for a named query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    List(Vec<String>),
    Text(String),
}

impl std::fmt::Display for QueryParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryParam::List(values) => write!(f, "{}", values.join(", ")),
            QueryParam::Text(value) => write!(f, "{}", value),
        }
    }
}

// Dataset slug is the last path component of the timeseries URL.
const DATASET_EXPR: &str = r"regexp_replace(ts.url, '.*/([^/]+)/$', '\1')";

impl ExportQuery {
    /// SQL text with `:name` placeholders for every value in [`Self::params`].
    pub fn build_sql(&self) -> String {
        let tags_cte = format!(
            r"WITH tag_last AS (
  SELECT
    t.bin,
    t.roi,
    tl.name AS taglabel,
    MAX(t.time) AS tag_time
  FROM public.classify_tag t
  JOIN public.classify_taglabel tl ON tl.id = t.tag_id
  JOIN public.classify_timeseries ts ON ts.id = t.timeseries_id::uuid
  WHERE t.negation = FALSE
    AND {dataset} = ANY(:ds_list)
  GROUP BY t.bin, t.roi, tl.name
),
lt AS (
  SELECT
    bin,
    roi,
    STRING_AGG(taglabel, '{sep}' ORDER BY tag_time DESC) AS raw_tags,
    MAX(tag_time) AS latest_tag_time
  FROM tag_last
  GROUP BY bin, roi
)",
            dataset = DATASET_EXPR,
            sep = TAG_SEPARATOR,
        );

        let mut class_filters = vec![format!("{} = ANY(:ds_list)", DATASET_EXPR)];
        if !self.bins.is_empty() {
            class_filters.push("c.bin = ANY(:bins)".to_string());
        }
        if !self.users.is_empty() {
            class_filters.push("au.username = ANY(:user_list)".to_string());
        }
        if self.since.is_some() {
            class_filters.push("COALESCE(c.verification_time, c.time) > :since".to_string());
        }
        if self.until.is_some() {
            class_filters.push("COALESCE(c.verification_time, c.time) <= :until".to_string());
        }

        let class_cte = format!(
            r",
base_class AS (
  SELECT
    c.id,
    c.bin,
    c.roi,
    c.user_id,
    c.classification_id,
    c.time,
    c.verification_time,
    COALESCE(c.verification_time, c.time) AS class_event_time,
    {dataset} AS dataset
  FROM public.classify_classification c
  JOIN public.classify_timeseries ts ON ts.id = c.timeseries_id::uuid
  LEFT JOIN public.auth_user au ON au.id = c.user_id
  WHERE {filters}
),
ranked_class AS (
  SELECT *,
         ROW_NUMBER() OVER (
           PARTITION BY bin, roi
           ORDER BY class_event_time DESC, id DESC
         ) AS rn
  FROM base_class
)",
            dataset = DATASET_EXPR,
            filters = class_filters.join("\n    AND "),
        );

        let tag_clause = if self.tags.is_empty() {
            String::new()
        } else {
            "\n  AND (lt.raw_tags IS NOT NULL AND lt.raw_tags ILIKE ANY(:tag_like))".to_string()
        };
        let limit_clause = match self.limit {
            Some(limit) if limit > 0 => format!("\nLIMIT {}", limit),
            _ => String::new(),
        };

        format!(
            r"{tags_cte}{class_cte}
SELECT
  rc.bin,
  rc.roi,
  (rc.bin || '_' || LPAD(rc.roi::text, 5, '0')) AS pid,
  cl.name AS classname,
  lt.raw_tags AS raw_tag,
  rc.time AS created_at,
  GREATEST(rc.class_event_time, COALESCE(lt.latest_tag_time, rc.class_event_time)) AS last_event_time,
  rc.dataset
FROM ranked_class rc
JOIN public.classify_classlabel cl ON cl.id = rc.classification_id
LEFT JOIN lt ON lt.bin = rc.bin AND lt.roi = rc.roi
WHERE rc.rn = 1{tag_clause}
ORDER BY rc.bin, rc.roi{limit_clause};
"
        )
    }

    /// Named parameter values, in the order they are introduced.
    pub fn params(&self) -> Vec<(&'static str, QueryParam)> {
        let mut params = vec![("ds_list", QueryParam::List(self.datasets.clone()))];
        if !self.bins.is_empty() {
            params.push(("bins", QueryParam::List(self.bins.clone())));
        }
        if !self.tags.is_empty() {
            let like = self.tags.iter().map(|t| format!("%{}%", t)).collect();
            params.push(("tag_like", QueryParam::List(like)));
        }
        if !self.users.is_empty() {
            params.push(("user_list", QueryParam::List(self.users.clone())));
        }
        if let Some(since) = &self.since {
            params.push(("since", QueryParam::Text(since.clone())));
        }
        if let Some(until) = &self.until {
            params.push(("until", QueryParam::Text(until.clone())));
        }
        params
    }
}

/// One row of the export query result.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawAnnotation {
    pub pid: String,
    #[serde(default)]
    pub classname: String,
    #[serde(default)]
    pub raw_tag: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub last_event_time: Option<String>,
    #[serde(default)]
    pub dataset: String,
}

/// One row of the export file.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub pid: String,
    pub classname: String,
    pub raw_tag: String,
    pub class_tag: String,
    /// UTC timestamp, empty if the source value did not parse.
    pub last_event_time: String,
    pub created_at: String,
    pub dataset: String,
}

/// Column order of the export file.
pub const EXPORT_COLUMNS: [&str; 7] = [
    "pid",
    "classname",
    "raw_tag",
    "class_tag",
    "last_event_time",
    "created_at",
    "dataset",
];

/// Load export query results saved as CSV.
pub fn load_raw_annotations(path: &Path) -> Result<Vec<RawAnnotation>> {
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let mut rows = Vec::new();
    for result in reader.deserialize() {
        let row: RawAnnotation = result?;
        rows.push(row);
    }
    Ok(rows)
}

/// Parse a timestamp as written by PostgreSQL or ISO 8601 tools.
///
/// Values without an offset are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Render a UTC timestamp as `YYYY-MM-DD HH:MM:SS[.ffffff]+00:00`.
///
/// Fractional seconds, when present, always take six digits.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    let precision = if ts.nanosecond() == 0 {
        SecondsFormat::Secs
    } else {
        SecondsFormat::Micros
    };
    ts.to_rfc3339_opts(precision, false).replacen('T', " ", 1)
}

fn normalize_timestamp(value: Option<&str>) -> String {
    value
        .and_then(parse_timestamp)
        .map(|ts| format_timestamp(&ts))
        .unwrap_or_default()
}

/// Replace every whitespace run with an underscore.
pub fn underscore_whitespace(value: &str) -> String {
    WHITESPACE.replace_all(value, "_").into_owned()
}

/// Build the combined class and tag label.
///
/// ```
/// use plankton_pipeline::processors::annotations::class_tag;
///
/// assert_eq!(class_tag("Dinophysis", ""), "Dinophysis");
/// assert_eq!(class_tag("Dinophysis", "dividing||bad focus"), "Dinophysis_TAG_dividing_TAG_bad_focus");
/// ```
pub fn class_tag(classname: &str, raw_tag: &str) -> String {
    if raw_tag.is_empty() {
        return classname.to_string();
    }
    let tags = underscore_whitespace(raw_tag).replace(TAG_SEPARATOR, TAG_MARKER);
    format!("{}{}{}", classname, TAG_MARKER, tags)
}

/// Normalize one query row into an export row.
pub fn normalize(raw: &RawAnnotation) -> Annotation {
    let classname = underscore_whitespace(&raw.classname);
    let raw_tag = raw.raw_tag.as_deref().unwrap_or_default().trim().to_string();
    let class_tag = class_tag(&classname, &raw_tag);

    Annotation {
        pid: raw.pid.clone(),
        classname,
        raw_tag,
        class_tag,
        last_event_time: normalize_timestamp(raw.last_event_time.as_deref()),
        created_at: normalize_timestamp(raw.created_at.as_deref()),
        dataset: raw.dataset.clone(),
    }
}

/// Path of the PID list written next to an export: `<out without ext>_pids.txt`.
pub fn pid_list_path(out: &Path) -> PathBuf {
    let stem = out.with_extension("");
    PathBuf::from(format!("{}_pids.txt", stem.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_load_list_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("datasets.txt");
        fs::write(&path, "mvco\n\n# comment\n  nauset  \n").unwrap();

        assert_eq!(load_list_file(&path).unwrap(), strings(&["mvco", "nauset"]));
    }

    #[test]
    fn test_load_bins_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bins.csv");
        fs::write(
            &path,
            "# bins\nD20240419T084427_IFCB124_00012,extra\nD20240418T084427_IFCB124\nD20240419T084427_IFCB124_00013\n",
        )
        .unwrap();

        let bins = load_bins_from_file(&path, None).unwrap();
        assert_eq!(
            bins,
            strings(&["D20240418T084427_IFCB124", "D20240419T084427_IFCB124"])
        );

        let limited = load_bins_from_file(&path, Some(1)).unwrap();
        assert_eq!(limited, strings(&["D20240419T084427_IFCB124"]));
    }

    #[test]
    fn test_load_bins_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load_bins_from_file(&dir.path().join("absent.txt"), None).unwrap_err();
        assert!(matches!(err, AnnotationError::NotFound(_)));
    }

    #[test]
    fn test_resolve_datasets() {
        let defaults = strings(&["mvco", "gom"]);

        let resolved = resolve_datasets(&strings(&[" pie ", "mvco"]), &strings(&["pie"]), &defaults).unwrap();
        assert_eq!(resolved, strings(&["mvco", "pie"]));

        let fallback = resolve_datasets(&[], &[], &defaults).unwrap();
        assert_eq!(fallback, strings(&["gom", "mvco"]));

        let err = resolve_datasets(&strings(&["  "]), &[], &defaults).unwrap_err();
        assert!(matches!(err, AnnotationError::NoDatasets));
    }

    #[test]
    fn test_build_sql_minimal() {
        let query = ExportQuery {
            datasets: strings(&["mvco"]),
            ..ExportQuery::default()
        };
        let sql = query.build_sql();

        assert!(sql.starts_with("WITH tag_last AS ("));
        assert!(sql.contains(r"regexp_replace(ts.url, '.*/([^/]+)/$', '\1') = ANY(:ds_list)"));
        assert!(sql.contains("STRING_AGG(taglabel, '||' ORDER BY tag_time DESC)"));
        assert!(sql.contains("WHERE rc.rn = 1\nORDER BY rc.bin, rc.roi;"));
        assert!(!sql.contains(":bins"));
        assert!(!sql.contains("LIMIT"));
        assert_eq!(query.params().len(), 1);
    }

    #[test]
    fn test_build_sql_all_filters() {
        let query = ExportQuery {
            datasets: strings(&["mvco"]),
            bins: strings(&["D20240418T084427_IFCB124"]),
            tags: strings(&["dividing"]),
            users: strings(&["analyst"]),
            since: Some("2024-01-01".to_string()),
            until: Some("2024-12-31".to_string()),
            limit: Some(10),
        };
        let sql = query.build_sql();

        for fragment in [
            "c.bin = ANY(:bins)",
            "au.username = ANY(:user_list)",
            "COALESCE(c.verification_time, c.time) > :since",
            "COALESCE(c.verification_time, c.time) <= :until",
            "lt.raw_tags ILIKE ANY(:tag_like)",
            "LIMIT 10;",
        ] {
            assert!(sql.contains(fragment), "missing {}", fragment);
        }

        let params = query.params();
        let names: Vec<&str> = params.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["ds_list", "bins", "tag_like", "user_list", "since", "until"]);
        assert_eq!(params[2].1, QueryParam::List(strings(&["%dividing%"])));
    }

    #[test]
    fn test_export_filters_keep_every_bin_under_row_limit() {
        let dir = TempDir::new().unwrap();
        let bins_file = dir.path().join("bins.txt");
        fs::write(
            &bins_file,
            "D20240419T000000_IFCB1_00001\nD20240418T000000_IFCB1_00001\n",
        )
        .unwrap();

        let query = ExportFilters {
            datasets: strings(&["mvco"]),
            bins_file: Some(bins_file),
            limit: Some(1),
            ..ExportFilters::default()
        }
        .resolve(&[])
        .unwrap();

        assert_eq!(
            query.bins,
            strings(&["D20240418T000000_IFCB1", "D20240419T000000_IFCB1"])
        );
        assert_eq!(query.limit, Some(1));
        assert!(query.build_sql().contains("LIMIT 1;"));
        assert_eq!(
            query.params()[1],
            ("bins", QueryParam::List(strings(&["D20240418T000000_IFCB1", "D20240419T000000_IFCB1"])))
        );
    }

    #[test]
    fn test_export_filters_datasets_file_and_defaults() {
        let dir = TempDir::new().unwrap();
        let datasets_file = dir.path().join("datasets.txt");
        fs::write(&datasets_file, "nauset\n").unwrap();

        let query = ExportFilters {
            datasets_file: Some(datasets_file),
            ..ExportFilters::default()
        }
        .resolve(&strings(&["mvco"]))
        .unwrap();
        assert_eq!(query.datasets, strings(&["nauset"]));

        let query = ExportFilters::default().resolve(&strings(&["mvco"])).unwrap();
        assert_eq!(query.datasets, strings(&["mvco"]));
        assert!(query.bins.is_empty());

        let err = ExportFilters::default().resolve(&[]).unwrap_err();
        assert!(matches!(err, AnnotationError::NoDatasets));
    }

    #[test]
    fn test_timestamps() {
        let ts = parse_timestamp("2024-04-18T08:44:27Z").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-04-18 08:44:27+00:00");

        let ts = parse_timestamp("2024-04-18 10:44:27+02").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-04-18 08:44:27+00:00");

        let ts = parse_timestamp("2024-04-18 08:44:27").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-04-18 08:44:27+00:00");

        let ts = parse_timestamp("2024-04-18 08:44:27.123+00:00").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-04-18 08:44:27.123000+00:00");

        let ts = parse_timestamp("2024-04-18T08:44:27.5Z").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-04-18 08:44:27.500000+00:00");

        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_normalize() {
        let raw = RawAnnotation {
            pid: "D20240418T084427_IFCB124_00042".to_string(),
            classname: "Alexandrium catenella".to_string(),
            raw_tag: Some("  chain||bad focus ".to_string()),
            created_at: Some("2024-04-18T08:44:27Z".to_string()),
            last_event_time: Some("not a time".to_string()),
            dataset: "mvco".to_string(),
        };

        let row = normalize(&raw);
        assert_eq!(row.classname, "Alexandrium_catenella");
        assert_eq!(row.raw_tag, "chain||bad focus");
        assert_eq!(row.class_tag, "Alexandrium_catenella_TAG_chain_TAG_bad_focus");
        assert_eq!(row.created_at, "2024-04-18 08:44:27+00:00");
        assert_eq!(row.last_event_time, "");

        let untagged = normalize(&RawAnnotation {
            pid: "bin_00001".to_string(),
            classname: "detritus".to_string(),
            ..RawAnnotation::default()
        });
        assert_eq!(untagged.class_tag, "detritus");
        assert_eq!(untagged.raw_tag, "");
    }

    #[test]
    fn test_load_raw_annotations_empty_tag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raw.csv");
        fs::write(
            &path,
            "bin,roi,pid,classname,raw_tag,created_at,last_event_time,dataset\n\
             D1_IFCB1,1,D1_IFCB1_00001,detritus,,2024-04-18 08:44:27+00,2024-04-18 08:44:27+00,mvco\n",
        )
        .unwrap();

        let rows = load_raw_annotations(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].raw_tag, None);
        assert_eq!(normalize(&rows[0]).created_at, "2024-04-18 08:44:27+00:00");
    }

    #[test]
    fn test_pid_list_path() {
        assert_eq!(
            pid_list_path(Path::new("/out/export.csv")),
            PathBuf::from("/out/export_pids.txt")
        );
    }
}
