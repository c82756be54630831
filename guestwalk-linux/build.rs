use std::{
    env,
    error::Error,
    fs::{self, File},
    io::{Read, Write},
    path::Path,
};

#[path = "src/offsets/offset_table.rs"]
#[allow(dead_code)]
mod offset_table;

use offset_table::LinuxOffsetFile;

fn main() -> Result<(), Box<dyn Error>> {
    let out_dir = env::var("OUT_DIR")?;
    let dest_path = Path::new(&out_dir).join("linux_offsets.toml");
    let mut all_the_files = File::create(&dest_path)?;

    println!("cargo:rerun-if-changed=offsets");

    // files are merged in name order, the order of the tables inside a file is kept
    let mut paths = fs::read_dir("./offsets")?
        .filter_map(|f| f.ok())
        .filter(|f| f.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|f| f.path())
        .filter(|p| p.extension().map(|e| e == "toml").unwrap_or(false))
        .collect::<Vec<_>>();
    paths.sort();

    for path in paths.iter() {
        let mut file = File::open(path)?;
        let mut tomlstr = String::new();
        file.read_to_string(&mut tomlstr)?;

        // fail the build early on a malformed file
        let _: LinuxOffsetFile = toml::from_str(&tomlstr)?;

        all_the_files.write_all(tomlstr.as_bytes())?;
        all_the_files.write_all(b"\n")?;
    }

    Ok(())
}
