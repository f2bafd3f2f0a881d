//! `laskd status` — check if the daemon is running.

use std::path::Path;

use crate::paths;
use crate::VERSION;

pub fn run(data_dir: &Path) -> anyhow::Result<()> {
    println!();
    println!("  laskd v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    let pid_path = paths::pid_file_path();
    let pid_alive = if pid_path.exists() {
        let pid_str = std::fs::read_to_string(&pid_path).unwrap_or_default();
        let pid: u32 = pid_str.trim().parse().unwrap_or(0);
        if pid > 0 && process_alive(pid) {
            println!("  PID: {} (running)", pid);
            true
        } else {
            println!("  PID file: {} (stale — process not found)", pid);
            false
        }
    } else {
        println!("  PID file: not found");
        false
    };

    let socket_path = paths::socket_path();
    if socket_path.exists() {
        println!("  Socket: {}", socket_path.display());
    } else {
        println!("  Socket: not found");
    }

    println!();
    if !pid_alive {
        println!("  laskd is not running.");
        println!("  Start with: laskd start");
        println!();
    }

    Ok(())
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
