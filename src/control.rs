//! External interfaces (§6): the device-mapper construction line and the
//! out-of-band control-message channel. This crate only parses/formats these;
//! it does not register anything with an actual device-mapper.

use crate::errors::{RemapError, Result};
use crate::stats::Stats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLine {
    pub start_sector: u64,
    pub length_sectors: u64,
    pub main_device_path: String,
    pub spare_device_path: String,
}

const TARGET_NAME: &str = "dm-remap-v4";

impl TableLine {
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(RemapError::BadArgs(format!(
                "expected 5 fields in table line, got {}",
                fields.len()
            )));
        }
        let start_sector: u64 = fields[0]
            .parse()
            .map_err(|_| RemapError::BadArgs("bad start_sector".into()))?;
        let length_sectors: u64 = fields[1]
            .parse()
            .map_err(|_| RemapError::BadArgs("bad length_sectors".into()))?;
        if fields[2] != TARGET_NAME {
            return Err(RemapError::BadArgs(format!("unknown target type {}", fields[2])));
        }
        Ok(TableLine {
            start_sector,
            length_sectors,
            main_device_path: fields[3].to_string(),
            spare_device_path: fields[4].to_string(),
        })
    }
}

impl std::fmt::Display for TableLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.start_sector, self.length_sectors, TARGET_NAME, self.main_device_path, self.spare_device_path
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    AddRemap {
        main_sector: u64,
        spare_sector: u64,
        length_sectors: u64,
    },
    SpareAdd {
        path: String,
    },
    SpareRemove {
        path: String,
    },
    Stats,
}

/// Reply to a dispatched `ControlMessage` (§6 external interface).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlResponse {
    Ack,
    Stats(Stats),
}

impl ControlMessage {
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["add_remap", main, spare, length] => Ok(ControlMessage::AddRemap {
                main_sector: main.parse().map_err(|_| RemapError::BadArgs("bad main sector".into()))?,
                spare_sector: spare.parse().map_err(|_| RemapError::BadArgs("bad spare sector".into()))?,
                length_sectors: length.parse().map_err(|_| RemapError::BadArgs("bad length".into()))?,
            }),
            ["spare_add", path] => Ok(ControlMessage::SpareAdd { path: path.to_string() }),
            ["spare_remove", path] => Ok(ControlMessage::SpareRemove { path: path.to_string() }),
            ["stats"] => Ok(ControlMessage::Stats),
            _ => Err(RemapError::BadArgs(format!("unrecognized control message: {line}"))),
        }
    }
}
