/// Lists the processes of a Linux guest.
mod args;

use guestwalk::error::Result;

fn main() -> Result<()> {
    let matches = args::command("process_list").get_matches();
    args::init_logger(&matches);

    let mut kernel = args::build_kernel(&matches)?;
    println!(
        "kernel root {} ({:?}), offsets {}, init_task {}",
        kernel.kernel_root.root, kernel.kernel_root.source, kernel.offsets.name, kernel.init_task
    );

    let list = kernel.process_list();
    println!("{:>6} {:>6} {:<16} {:>18} {:>18}", "PID", "PPID", "NAME", "TASK", "PGD");
    for p in list.records.iter() {
        println!(
            "{:>6} {:>6} {:<16} {:>18} {:>18}",
            p.pid,
            p.parent_pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            p.name,
            p.address,
            p.pgd
                .map(|pgd| pgd.to_string())
                .unwrap_or_else(|| "kernel thread".to_string()),
        );
    }
    println!("{} processes ({:?})", list.records.len(), list.status);

    Ok(())
}
