/// Runs a full discovery on a Linux guest and prints the result as JSON.
mod args;

use clap::{Arg, ArgAction};

use guestwalk::error::{Error, ErrorKind, ErrorOrigin, Result};
use guestwalk_linux::linux::DiscoveryOptions;

fn main() -> Result<()> {
    let matches = args::command("discover")
        .arg(
            Arg::new("processes-only")
                .long("processes-only")
                .short('p')
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("pretty").long("pretty").action(ArgAction::SetTrue))
        .get_matches();
    args::init_logger(&matches);

    let mut kernel = args::build_kernel(&matches)?;
    let options = if matches.get_flag("processes-only") {
        DiscoveryOptions::processes_only()
    } else {
        DiscoveryOptions::default()
    };
    let result = kernel.discover(options)?;

    let json = if matches.get_flag("pretty") {
        serde_json::to_string_pretty(&result)
    } else {
        serde_json::to_string(&result)
    }
    .map_err(|err| Error(ErrorOrigin::Other, ErrorKind::Encoding).log_error(err))?;
    println!("{}", json);

    if !result.is_complete() {
        log::warn!("discovery is partial: {:?}", result.completeness);
    }
    Ok(())
}
