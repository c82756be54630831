/*!
Module containing basic connector and ground-truth source traits

A connector provides the bytes of guest physical memory. The built-in connectors read a raw
snapshot of guest RAM either through `std::io` ([`FileIoMemory`]) or through a read-only
mapping ([`MmapMemory`], feature `filemap`). In both cases the file offset is the physical
address minus the configured RAM base.

[`CpuState`] is implemented by connectors that can query the hypervisor for register state.
*/

pub mod args;
#[doc(hidden)]
pub use args::ConnectorArgs;

pub mod cpu_state;
#[doc(hidden)]
pub use cpu_state::{CpuState, TranslationRegisters};

pub mod fileio;
#[doc(hidden)]
pub use fileio::FileIoMemory;

#[cfg(feature = "filemap")]
pub mod mmap;
#[cfg(feature = "filemap")]
#[doc(hidden)]
pub use mmap::MmapMemory;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::mem::PhysicalMemory;
use crate::types::{size, PhysicalAddress};

use std::fs::File;

use log::info;

/// Parses a byte count given as decimal or `0x` prefixed hex with an optional `k`, `m` or `g` unit.
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim().to_lowercase();
    let (digits, unit) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], size::kb(1)),
        Some('m') => (&value[..value.len() - 1], size::mb(1)),
        Some('g') => (&value[..value.len() - 1], size::gb(1)),
        _ => (&value[..], 1),
    };

    let parsed = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => digits.replace('_', "").parse::<u64>(),
    };

    parsed
        .ok()
        .and_then(|v| v.checked_mul(unit))
        .ok_or(Error(ErrorOrigin::Args, ErrorKind::InvalidMemorySize))
}

/// Opens a snapshot connector from arguments.
///
/// Recognized arguments: the default value or `path` (snapshot file), `ram_base` (hex physical
/// address of the first byte, default 0), `mode` (`mmap` or `file`).
pub fn create_connector(args: &ConnectorArgs) -> Result<Box<dyn PhysicalMemory>> {
    let path = args
        .get("path")
        .or_else(|| args.get_default())
        .ok_or_else(|| {
            Error(ErrorOrigin::Args, ErrorKind::RequiredArgNotFound)
                .log_error("a snapshot path is required")
        })?;
    let ram_base = args.get_parsed("ram_base", PhysicalAddress::NULL)?;
    let mode = args.get("mode").map(String::as_str).unwrap_or("mmap");

    info!("opening {} with mode={} ram_base={}", path, mode, ram_base);

    match mode {
        #[cfg(feature = "filemap")]
        "mmap" => Ok(Box::new(MmapMemory::open(path, ram_base)?)),
        #[cfg(not(feature = "filemap"))]
        "mmap" => open_file(args, path, ram_base),
        "file" => open_file(args, path, ram_base),
        _ => Err(Error(ErrorOrigin::Args, ErrorKind::ArgValidation)
            .log_error(format!("unknown connector mode: {}", mode))),
    }
}

fn open_file(
    args: &ConnectorArgs,
    path: &str,
    ram_base: PhysicalAddress,
) -> Result<Box<dyn PhysicalMemory>> {
    let file = File::open(path).map_err(|err| {
        Error(ErrorOrigin::Connector, ErrorKind::UnableToReadFile).log_error(err)
    })?;
    let mut mem = FileIoMemory::with_reader(file, ram_base)?;
    if let Some(size) = args.get("size") {
        mem = FileIoMemory::with_size(mem.into_reader(), ram_base, parse_size(size)?);
    }
    Ok(Box::new(mem))
}
