//! Command line handling shared by the demos.

use clap::{crate_authors, crate_version, Arg, ArgAction, ArgMatches, Command};
use log::Level;

use guestwalk::architecture::ArchitectureIdent;
use guestwalk::connector::{create_connector, ConnectorArgs};
use guestwalk::error::Result;
use guestwalk::mem::{CachedPhysicalMemory, PhysicalMemory};
use guestwalk::types::{PhysicalAddress, VirtualAddress};

use guestwalk_linux::kernel::AnchorHint;
use guestwalk_linux::linux::LinuxKernel;
use guestwalk_linux::offsets::LinuxOffsets;

use guestwalk_qmp::QmpClient;

pub type Kernel = LinuxKernel<CachedPhysicalMemory<Box<dyn PhysicalMemory>>>;

pub fn command(name: &'static str) -> Command {
    Command::new(name)
        .version(crate_version!())
        .author(crate_authors!())
        .arg(Arg::new("verbose").short('v').action(ArgAction::Count))
        .arg(
            Arg::new("connector")
                .help("snapshot path and connector arguments, e.g. guest.raw,ram_base=0x40000000")
                .action(ArgAction::Set)
                .required(true),
        )
        .arg(Arg::new("arch").long("arch").short('a').action(ArgAction::Set))
        .arg(
            Arg::new("root")
                .long("root")
                .short('r')
                .help("physical address of the kernel's top level table")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("init-task")
                .long("init-task")
                .help("virtual address of init_task")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("offsets")
                .long("offsets")
                .short('o')
                .help("additional offset table file")
                .action(ArgAction::Append),
        )
        .arg(Arg::new("table").long("table").short('t').action(ArgAction::Set))
        .arg(
            Arg::new("qmp")
                .long("qmp")
                .help("qmp server to query the register state from")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("cpu")
                .long("cpu")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize))
                .default_value("0"),
        )
        .arg(Arg::new("no-scan").long("no-scan").action(ArgAction::SetTrue))
}

pub fn init_logger(matches: &ArgMatches) {
    let level = match matches.get_count("verbose") {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    };
    simplelog::TermLogger::init(
        level.to_level_filter(),
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .unwrap();
}

pub fn build_kernel(matches: &ArgMatches) -> Result<Kernel> {
    let conn_args = matches
        .get_one::<String>("connector")
        .map(String::as_str)
        .unwrap_or_default()
        .parse::<ConnectorArgs>()?;
    let connector = create_connector(&conn_args)?;

    let mut offsets = LinuxOffsets::new()?;
    if let Some(paths) = matches.get_many::<String>("offsets") {
        for path in paths {
            offsets = offsets.add_path(path)?;
        }
    }
    if let Some(table) = matches.get_one::<String>("table") {
        offsets = offsets.select(table);
    }

    let mut builder = LinuxKernel::builder(connector).offsets(offsets);
    if let Some(arch) = matches.get_one::<String>("arch") {
        builder = builder.arch(arch.parse::<ArchitectureIdent>()?);
    }
    if let Some(root) = matches.get_one::<String>("root") {
        builder = builder.kernel_root(root.parse::<PhysicalAddress>()?);
    }
    if let Some(init_task) = matches.get_one::<String>("init-task") {
        builder = builder.anchor_hint(AnchorHint::Virtual(init_task.parse::<VirtualAddress>()?));
    }
    if let Some(addr) = matches.get_one::<String>("qmp") {
        let cpu = *matches.get_one::<usize>("cpu").unwrap();
        builder = builder.cpu_state(QmpClient::connect(addr.as_str())?, cpu);
    }
    if matches.get_flag("no-scan") {
        builder = builder.no_scan();
    }

    builder.build_default_caches().build()
}
