//! `laskd init` — bootstrap a fresh machine: create the data dir
//! structure and print next-steps guidance.

use std::path::Path;

use crate::paths;

pub fn run(data_dir: &Path) -> anyhow::Result<()> {
    println!();

    paths::ensure_dirs()?;
    println!("  Created {}/", data_dir.display());
    println!("  Logs:   {}/", paths::log_dir().display());
    println!("  Mail:   {}/", paths::mail_pending_dir().display());

    println!();
    println!("  Next steps:");
    println!("    1. Start the daemon:  laskd start");
    println!("    2. Check status:      laskd status");
    println!();

    Ok(())
}
