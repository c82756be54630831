use clap::{crate_authors, crate_version, Arg, ArgAction, Command};
use log::Level;

use guestwalk::connector::CpuState;
use guestwalk::error::Result;
use guestwalk_qmp::QmpClient;

fn main() -> Result<()> {
    let matches = Command::new("read_registers")
        .version(crate_version!())
        .author(crate_authors!())
        .arg(Arg::new("verbose").short('v').action(ArgAction::Count))
        .arg(
            Arg::new("addr")
                .help("address of the qmp server, e.g. 127.0.0.1:4444")
                .action(ArgAction::Set)
                .required(true),
        )
        .arg(
            Arg::new("cpu")
                .long("cpu")
                .short('c')
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize))
                .default_value("0"),
        )
        .get_matches();

    let level = match matches.get_count("verbose") {
        0 => Level::Warn,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    };
    simplelog::TermLogger::init(
        level.to_level_filter(),
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .unwrap();

    let addr = matches.get_one::<String>("addr").unwrap();
    let cpu = *matches.get_one::<usize>("cpu").unwrap();

    let mut client = QmpClient::connect(addr.as_str())?;
    let version = client.version().to_string();
    println!("qemu {}, {}", version, client.status()?);

    let registers = client.translation_registers(cpu)?;
    println!("cpu {}: {:x?}", cpu, registers);
    println!("kernel root: {}", registers.kernel_root());
    if let Some(task) = client.current_task(cpu)? {
        println!("current task: {}", task);
    }

    Ok(())
}
