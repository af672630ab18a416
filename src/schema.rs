// src/schema.rs

use std::{fs, path::{Path, PathBuf}};

use anyhow::Error;
use schemars::schema_for;

use crate::{config::ChainConfig, pathmap::PathMapRule};

pub const CHAIN_SCHEMA_FILE: &str = "chain.schema.json";
pub const PATH_MAP_SCHEMA_FILE: &str = "pathmap.schema.json";

/// Write the JSON schemas of the chain file and of a path-map rule file into
/// `out_dir`. Returns the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir)?;

    let chain = out_dir.join(CHAIN_SCHEMA_FILE);
    fs::write(&chain, serde_json::to_string_pretty(&schema_for!(ChainConfig))?)?;

    let rules = out_dir.join(PATH_MAP_SCHEMA_FILE);
    fs::write(&rules, serde_json::to_string_pretty(&schema_for!(Vec<PathMapRule>))?)?;

    Ok(vec![chain, rules])
}
