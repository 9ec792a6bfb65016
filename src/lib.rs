pub mod app;
pub mod backbone;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod environment;
pub mod error;
pub mod fs_util;
pub mod gbif;
pub mod joiner;
#[cfg(feature = "netcdf")]
pub mod netcdf_grid;
pub mod occurrence;
pub mod output;
pub mod paging;
pub mod store;
pub mod table;
pub mod taxonomy;
pub mod worms;
