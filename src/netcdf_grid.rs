use std::path::Path;

use netcdf::{AttributeValue, Extent, Variable};

use crate::environment::{Grid, GridReader};
use crate::error::KiraError;

const LAT_NAMES: [&str; 3] = ["lat", "latitude", "nav_lat"];
const LON_NAMES: [&str; 3] = ["lon", "longitude", "nav_lon"];

/// Reader for NetCDF files as delivered by the environmental data service.
///
/// The data variable is the one whose trailing dimensions are latitude and
/// longitude. Every leading dimension (time, depth) is pinned to index 0,
/// so a depth axis yields its first level. `_FillValue`/`missing_value`
/// cells become `None`; packed values are unpacked with `scale_factor` and
/// `add_offset`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetcdfGridReader;

impl GridReader for NetcdfGridReader {
    fn read(&self, path: &Path) -> Result<Grid, KiraError> {
        let fail = |message: String| KiraError::GridRead {
            path: path.to_path_buf(),
            message,
        };
        let file = netcdf::open(path).map_err(|err| fail(err.to_string()))?;

        let lat = axis(&file, &LAT_NAMES).map_err(&fail)?;
        let lon = axis(&file, &LON_NAMES).map_err(&fail)?;

        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let candidates = file
            .variables()
            .filter(is_surface_field)
            .collect::<Vec<_>>();
        let variable = match candidates.len() {
            0 => return Err(fail("no variable on a lat/lon grid".to_string())),
            1 => &candidates[0],
            _ => candidates
                .iter()
                .find(|variable| stem.contains(&variable.name()))
                .ok_or_else(|| {
                    fail(format!(
                        "{} gridded variables and none named in the file name",
                        candidates.len()
                    ))
                })?,
        };

        let rank = variable.dimensions().len();
        let extents = (0..rank)
            .map(|position| {
                if position + 2 < rank {
                    Extent::from(0usize)
                } else {
                    Extent::from(..)
                }
            })
            .collect::<Vec<_>>();
        let raw = variable
            .get_values::<f64, _>(extents)
            .map_err(|err| fail(format!("{}: {err}", variable.name())))?;

        let fill = [
            numeric_attribute(variable, "_FillValue"),
            numeric_attribute(variable, "missing_value"),
        ];
        let scale = numeric_attribute(variable, "scale_factor").unwrap_or(1.0);
        let offset = numeric_attribute(variable, "add_offset").unwrap_or(0.0);
        let values = raw
            .into_iter()
            .map(|value| {
                let missing = !value.is_finite() || fill.iter().flatten().any(|fill| *fill == value);
                (!missing).then_some(value * scale + offset)
            })
            .collect();
        Grid::new(lon, lat, values).map_err(fail)
    }
}

fn axis(file: &netcdf::File, names: &[&str]) -> Result<Vec<f64>, String> {
    let variable = names
        .iter()
        .find_map(|name| file.variable(name))
        .ok_or_else(|| format!("no coordinate variable among {names:?}"))?;
    if variable.dimensions().len() != 1 {
        return Err(format!("coordinate {} is not one-dimensional", variable.name()));
    }
    variable
        .get_values::<f64, _>(..)
        .map_err(|err| format!("{}: {err}", variable.name()))
}

fn is_surface_field(variable: &Variable<'_>) -> bool {
    let dims = variable.dimensions();
    let [.., lat, lon] = dims else {
        return false;
    };
    LAT_NAMES.contains(&lat.name().as_str()) && LON_NAMES.contains(&lon.name().as_str())
}

fn numeric_attribute(variable: &Variable<'_>, name: &str) -> Option<f64> {
    match variable.attribute(name)?.value().ok()? {
        AttributeValue::Double(value) => Some(value),
        AttributeValue::Float(value) => Some(f64::from(value)),
        AttributeValue::Int(value) => Some(f64::from(value)),
        AttributeValue::Short(value) => Some(f64::from(value)),
        AttributeValue::Schar(value) => Some(f64::from(value)),
        AttributeValue::Uchar(value) => Some(f64::from(value)),
        AttributeValue::Ushort(value) => Some(f64::from(value)),
        AttributeValue::Uint(value) => Some(f64::from(value)),
        _ => None,
    }
}
