use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Calendar-month key (`YYYYMM`) aligning an observation with its
/// contemporaneous environmental grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, KiraError> {
        if !(1..=12).contains(&month) || !(0..=9999).contains(&year) {
            return Err(KiraError::InvalidYearMonth(format!("{year:04}{month:02}")));
        }
        Ok(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.len() != 6 || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(KiraError::InvalidYearMonth(value.to_string()));
        }
        let year = trimmed[..4]
            .parse::<i32>()
            .map_err(|_| KiraError::InvalidYearMonth(value.to_string()))?;
        let month = trimmed[4..]
            .parse::<u32>()
            .map_err(|_| KiraError::InvalidYearMonth(value.to_string()))?;
        Self::new(year, month).map_err(|_| KiraError::InvalidYearMonth(value.to_string()))
    }
}

impl TryFrom<String> for YearMonth {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

/// Coerces a raw occurrence event date to a calendar date.
///
/// Keeps only the start of a date range (`a/b`), strips any time component
/// (`...T...`), then accepts `YYYY-MM-DD` as is, completes `YYYY-MM` with
/// day `01` and `YYYY` with `-01-01`. Every other shape, and any string that
/// does not name a real calendar day, yields `None`.
pub fn clean_dates(raw: &str) -> Option<NaiveDate> {
    let start = raw.split('/').next().unwrap_or_default();
    let day_part = start.split('T').next().unwrap_or_default().trim();

    let completed = if has_shape(day_part, "dddd-dd-dd") {
        day_part.to_string()
    } else if has_shape(day_part, "dddd-dd") {
        format!("{day_part}-01")
    } else if has_shape(day_part, "dddd") {
        format!("{day_part}-01-01")
    } else {
        return None;
    };
    NaiveDate::parse_from_str(&completed, "%Y-%m-%d").ok()
}

fn has_shape(value: &str, shape: &str) -> bool {
    value.len() == shape.len()
        && value.bytes().zip(shape.bytes()).all(|(ch, want)| match want {
            b'd' => ch.is_ascii_digit(),
            other => ch == other,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OccurrenceStatus {
    Present,
    Absent,
}

impl FromStr for OccurrenceStatus {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PRESENT" => Ok(OccurrenceStatus::Present),
            "ABSENT" => Ok(OccurrenceStatus::Absent),
            _ => Err(KiraError::Table(format!("unknown occurrence status: {value}"))),
        }
    }
}

/// Presence label of a joined observation: target species or target-group
/// background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObservationClass {
    Background,
    Target,
}

impl ObservationClass {
    pub fn label(self) -> u8 {
        match self {
            ObservationClass::Background => 0,
            ObservationClass::Target => 1,
        }
    }

    pub fn from_label(label: u8) -> Result<Self, KiraError> {
        match label {
            0 => Ok(ObservationClass::Background),
            1 => Ok(ObservationClass::Target),
            other => Err(KiraError::Table(format!("invalid class label: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Done => write!(f, "DONE"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Download and extract each archive as soon as its job completes.
    Materialize,
    /// Record the archive key only; `materialize` fetches it later.
    Handle,
}

/// Sort key for taxonomic status used when collapsing records that share a
/// valid id: `accepted` first, then `alternate representation`, then any
/// other status in byte order, then records without a status.
pub fn status_priority(status: Option<&str>) -> (u8, String) {
    match status.map(|value| value.trim().to_ascii_lowercase()) {
        Some(value) if value == "accepted" => (0, value),
        Some(value) if value == "alternate representation" => (1, value),
        Some(value) => (2, value),
        None => (3, String::new()),
    }
}

/// Closed search polygon with counter-clockwise winding, validated to be
/// simple (no self-intersections) and non-degenerate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchArea {
    vertices: Vec<(f64, f64)>,
}

impl SearchArea {
    /// Builds the polygon from `(lon, lat)` vertices. The ring may be given
    /// open or closed; clockwise rings are reversed.
    pub fn new(points: &[(f64, f64)]) -> Result<Self, KiraError> {
        let mut vertices = points.to_vec();
        if vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }
        if vertices.len() < 3 {
            return Err(KiraError::InvalidSearchArea(format!(
                "polygon needs at least 3 distinct vertices, got {}",
                vertices.len()
            )));
        }
        for &(lon, lat) in &vertices {
            if !lon.is_finite() || !lat.is_finite() {
                return Err(KiraError::InvalidSearchArea(
                    "non-finite coordinate".to_string(),
                ));
            }
            if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
                return Err(KiraError::InvalidSearchArea(format!(
                    "vertex ({lon}, {lat}) outside WGS84 bounds"
                )));
            }
        }
        for window in 0..vertices.len() {
            let next = (window + 1) % vertices.len();
            if vertices[window] == vertices[next] {
                return Err(KiraError::InvalidSearchArea(format!(
                    "repeated vertex at position {window}"
                )));
            }
        }

        let area = signed_area(&vertices);
        if area.abs() < f64::EPSILON {
            return Err(KiraError::InvalidSearchArea(
                "polygon has zero area".to_string(),
            ));
        }
        if let Some((a, b)) = first_self_intersection(&vertices) {
            return Err(KiraError::InvalidSearchArea(format!(
                "edges {a} and {b} intersect"
            )));
        }
        if area < 0.0 {
            vertices.reverse();
        }
        Ok(Self { vertices })
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }

    pub fn is_counter_clockwise(&self) -> bool {
        signed_area(&self.vertices) > 0.0
    }

    /// Closed WKT ring, the form the occurrence archive's `within`
    /// predicate expects.
    pub fn to_wkt(&self) -> String {
        let mut ring = self
            .vertices
            .iter()
            .map(|(lon, lat)| format!("{lon} {lat}"))
            .collect::<Vec<_>>();
        if let Some((lon, lat)) = self.vertices.first() {
            ring.push(format!("{lon} {lat}"));
        }
        format!("POLYGON(({}))", ring.join(", "))
    }
}

fn signed_area(vertices: &[(f64, f64)]) -> f64 {
    let n = vertices.len();
    let twice = (0..n)
        .map(|i| {
            let (x1, y1) = vertices[i];
            let (x2, y2) = vertices[(i + 1) % n];
            x1 * y2 - x2 * y1
        })
        .sum::<f64>();
    twice / 2.0
}

fn first_self_intersection(vertices: &[(f64, f64)]) -> Option<(usize, usize)> {
    let n = vertices.len();
    for i in 0..n {
        let a = (vertices[i], vertices[(i + 1) % n]);
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            if adjacent {
                continue;
            }
            let b = (vertices[j], vertices[(j + 1) % n]);
            if segments_intersect(a, b) {
                return Some((i, j));
            }
        }
    }
    None
}

fn orientation(p: (f64, f64), q: (f64, f64), r: (f64, f64)) -> Ordering {
    let value = (q.0 - p.0) * (r.1 - p.1) - (q.1 - p.1) * (r.0 - p.0);
    value.partial_cmp(&0.0).unwrap_or(Ordering::Equal)
}

fn on_segment(p: (f64, f64), q: (f64, f64), r: (f64, f64)) -> bool {
    q.0 <= p.0.max(r.0) && q.0 >= p.0.min(r.0) && q.1 <= p.1.max(r.1) && q.1 >= p.1.min(r.1)
}

fn segments_intersect(a: ((f64, f64), (f64, f64)), b: ((f64, f64), (f64, f64))) -> bool {
    let (p1, q1) = a;
    let (p2, q2) = b;
    let o1 = orientation(p1, q1, p2);
    let o2 = orientation(p1, q1, q2);
    let o3 = orientation(p2, q2, p1);
    let o4 = orientation(p2, q2, q1);

    if o1 != o2 && o3 != o4 {
        return true;
    }
    (o1 == Ordering::Equal && on_segment(p1, p2, q1))
        || (o2 == Ordering::Equal && on_segment(p1, q2, q1))
        || (o3 == Ordering::Equal && on_segment(p2, p1, q2))
        || (o4 == Ordering::Equal && on_segment(p2, q1, q2))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn clean_dates_shapes() {
        assert_eq!(clean_dates("2020-05-15/2020-05-20"), Some(date(2020, 5, 15)));
        assert_eq!(clean_dates("2020-05"), Some(date(2020, 5, 1)));
        assert_eq!(clean_dates("2020"), Some(date(2020, 1, 1)));
        assert_eq!(clean_dates("2020-05-15T10:22:00Z"), Some(date(2020, 5, 15)));
        assert_eq!(clean_dates("2019-11/2020-02"), Some(date(2019, 11, 1)));
        assert_eq!(clean_dates("not-a-date"), None);
    }

    #[test]
    fn clean_dates_rejects_impossible_days() {
        assert_eq!(clean_dates("2020-02-30"), None);
        assert_eq!(clean_dates("2020-13"), None);
        assert_eq!(clean_dates("20-05-15"), None);
        assert_eq!(clean_dates(""), None);
        assert_eq!(clean_dates("2020-5-1"), None);
    }

    #[test]
    fn year_month_parse_and_display() {
        let ym: YearMonth = "202001".parse().unwrap();
        assert_eq!(ym.year(), 2020);
        assert_eq!(ym.month(), 1);
        assert_eq!(ym.to_string(), "202001");
        assert_eq!(YearMonth::from_date(date(2021, 11, 30)).to_string(), "202111");
        assert_matches!("202013".parse::<YearMonth>(), Err(KiraError::InvalidYearMonth(_)));
        assert_matches!("2020-1".parse::<YearMonth>(), Err(KiraError::InvalidYearMonth(_)));
    }

    #[test]
    fn status_priority_orders_accepted_first() {
        let mut statuses = vec![
            None,
            Some("unaccepted"),
            Some("alternate representation"),
            Some("accepted"),
        ];
        statuses.sort_by_key(|status| status_priority(*status));
        assert_eq!(
            statuses,
            vec![
                Some("accepted"),
                Some("alternate representation"),
                Some("unaccepted"),
                None
            ]
        );
    }

    #[test]
    fn search_area_normalizes_clockwise_ring() {
        let clockwise = [(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0), (0.0, 0.0)];
        let area = SearchArea::new(&clockwise).unwrap();
        assert!(area.is_counter_clockwise());
        assert_eq!(area.vertices().len(), 4);
        assert_eq!(
            area.to_wkt(),
            "POLYGON((10 0, 10 10, 0 10, 0 0, 10 0))"
        );
    }

    #[test]
    fn search_area_rejects_bow_tie() {
        let bow_tie = [(0.0, 0.0), (10.0, 10.0), (10.0, 0.0), (0.0, 12.0)];
        assert_matches!(
            SearchArea::new(&bow_tie),
            Err(KiraError::InvalidSearchArea(_))
        );
    }

    #[test]
    fn search_area_rejects_degenerate_rings() {
        assert_matches!(
            SearchArea::new(&[(0.0, 0.0), (1.0, 1.0)]),
            Err(KiraError::InvalidSearchArea(_))
        );
        assert_matches!(
            SearchArea::new(&[(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)]),
            Err(KiraError::InvalidSearchArea(_))
        );
        assert_matches!(
            SearchArea::new(&[(0.0, 0.0), (200.0, 1.0), (2.0, 5.0)]),
            Err(KiraError::InvalidSearchArea(_))
        );
    }
}
