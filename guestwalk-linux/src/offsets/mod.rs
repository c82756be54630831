/*!
Kernel structure offsets.

The layout of `task_struct` and friends is decided when the guest kernel is compiled,
so the walker has to be told where the fields live. Offsets come in named tables,
see [`LinuxOffsetTable`]. A set of tables for common kernels is embedded at build time from
the TOML files in the `offsets/` folder of this crate. More tables can be loaded from TOML at
runtime, they are tried before the embedded ones.

A TOML offset file looks like this:

```toml
[[offsets]]
name = "my-kernel"
arch = "aarch64"

[offsets.task]
pid = 0x4E8
comm = 0x738
tasks_next = 0x3A0
tasks_prev = 0x3A8
mm = 0x520
real_parent = 0x2E8

[offsets.mm]
pgd = 0x48
```
*/

mod offset_table;

pub use offset_table::{
    FileOffsets, LinuxOffsetFile, LinuxOffsetTable, LinuxOffsetsArchitecture, MmLayoutOffsets,
    MmOffsets, TaskOffsets, VmaCollection, VmaOffsets,
};

use std::fs;
use std::path::Path;

use guestwalk::architecture::ArchitectureIdent;
use guestwalk::error::{Error, ErrorKind, ErrorOrigin, Result};

use log::{debug, info};

#[cfg(feature = "embed_offsets")]
const EMBEDDED_OFFSETS: &str = include_str!(concat!(env!("OUT_DIR"), "/linux_offsets.toml"));

impl LinuxOffsetsArchitecture {
    /// Returns true if tables for this architecture apply to the given paging architecture.
    pub fn matches(self, arch: ArchitectureIdent) -> bool {
        matches!(
            (self, arch),
            (LinuxOffsetsArchitecture::AArch64, ArchitectureIdent::AArch64 { .. })
                | (LinuxOffsetsArchitecture::X86_64, ArchitectureIdent::X86_64 { .. })
        )
    }
}

impl From<ArchitectureIdent> for LinuxOffsetsArchitecture {
    fn from(arch: ArchitectureIdent) -> Self {
        match arch {
            ArchitectureIdent::AArch64 { .. } => LinuxOffsetsArchitecture::AArch64,
            ArchitectureIdent::X86_64 { .. } => LinuxOffsetsArchitecture::X86_64,
        }
    }
}

impl LinuxOffsetFile {
    pub fn from_toml_str(tomlstr: &str) -> Result<Self> {
        toml::from_str(tomlstr).map_err(|err| {
            Error(ErrorOrigin::Offsets, ErrorKind::Configuration).log_error(err)
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let tomlstr = fs::read_to_string(path.as_ref()).map_err(|err| {
            Error(ErrorOrigin::Offsets, ErrorKind::UnableToReadFile)
                .log_error(format!("{}: {}", path.as_ref().display(), err))
        })?;
        Self::from_toml_str(&tomlstr)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| Error(ErrorOrigin::Offsets, ErrorKind::Encoding).log_error(err))
    }
}

/// The ordered set of offset tables considered during initialization.
///
/// Tables added by the user come first, then the embedded tables in the order of their
/// files. When a table is selected by name, auto-detection is skipped.
#[derive(Debug, Clone, Default)]
pub struct LinuxOffsets {
    user: Vec<LinuxOffsetTable>,
    builtin: Vec<LinuxOffsetTable>,
    selected: Option<String>,
}

impl LinuxOffsets {
    /// Constructs a set containing the embedded tables.
    pub fn new() -> Result<Self> {
        Ok(Self {
            user: Vec::new(),
            builtin: Self::builtin_tables()?,
            selected: None,
        })
    }

    /// Constructs a set without any embedded tables.
    pub fn empty() -> Self {
        Self::default()
    }

    #[cfg(feature = "embed_offsets")]
    fn builtin_tables() -> Result<Vec<LinuxOffsetTable>> {
        let file = LinuxOffsetFile::from_toml_str(EMBEDDED_OFFSETS)?;
        debug!("{} embedded offset tables", file.offsets.len());
        Ok(file.offsets)
    }

    #[cfg(not(feature = "embed_offsets"))]
    fn builtin_tables() -> Result<Vec<LinuxOffsetTable>> {
        Ok(Vec::new())
    }

    /// Adds a table in front of all embedded tables, after previously added ones.
    pub fn add(mut self, table: LinuxOffsetTable) -> Self {
        self.user.push(table);
        self
    }

    pub fn add_file(mut self, file: LinuxOffsetFile) -> Self {
        self.user.extend(file.offsets);
        self
    }

    /// Loads all tables of a TOML offset file.
    pub fn add_path<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let file = LinuxOffsetFile::from_path(path)?;
        Ok(self.add_file(file))
    }

    pub fn add_toml_str(self, tomlstr: &str) -> Result<Self> {
        let file = LinuxOffsetFile::from_toml_str(tomlstr)?;
        Ok(self.add_file(file))
    }

    /// Uses the table with the given name only, no auto-detection takes place.
    pub fn select(mut self, name: &str) -> Self {
        self.selected = Some(name.to_string());
        self
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// All tables in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &LinuxOffsetTable> {
        self.user.iter().chain(self.builtin.iter())
    }

    pub fn by_name(&self, name: &str) -> Option<&LinuxOffsetTable> {
        self.iter().find(|t| t.name == name)
    }

    /// Returns the tables to try for the given architecture in priority order.
    ///
    /// With an explicit selection this is the selected table only. Selecting a table that
    /// does not exist or that belongs to a different architecture is an error.
    pub fn candidates(&self, arch: ArchitectureIdent) -> Result<Vec<&LinuxOffsetTable>> {
        match &self.selected {
            Some(name) => {
                let table = self.by_name(name).ok_or_else(|| {
                    Error(ErrorOrigin::Offsets, ErrorKind::NotFound)
                        .log_error(format!("offset table {} not found", name))
                })?;
                if !table.arch.matches(arch) {
                    return Err(Error(ErrorOrigin::Offsets, ErrorKind::InvalidArchitecture)
                        .log_error(format!("offset table {} is for {}", name, table.arch)));
                }
                info!("using offset table {}", name);
                Ok(vec![table])
            }
            None => {
                let tables = self
                    .iter()
                    .filter(|t| t.arch.matches(arch))
                    .collect::<Vec<_>>();
                debug!("{} offset table candidates for {}", tables.len(), arch);
                Ok(tables)
            }
        }
    }
}
