use anyhow::{Context, Result, bail};
use std::env;
use std::fs;

const UNIT_PATH: &str = "/etc/systemd/system/portwarden.service";

/// Writes a systemd unit that runs `portwarden serve` from the current
/// directory, reading the same .env the CLI uses.
pub fn install_service() -> Result<()> {
    if unsafe { libc::getuid() } != 0 {
        bail!("installing the systemd unit requires root");
    }

    let exe = env::current_exe().context("Could not resolve the running binary path")?;
    let workdir = env::current_dir().context("Could not resolve the working directory")?;

    let unit = format!(
        "[Unit]\n\
         Description=Portwarden Proxy Account Controller\n\
         After=network.target\n\n\
         [Service]\n\
         Type=simple\n\
         User=root\n\
         WorkingDirectory={workdir}\n\
         ExecStart={exe} serve\n\
         Restart=always\n\
         EnvironmentFile={workdir}/.env\n\n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        workdir = workdir.display(),
        exe = exe.display(),
    );

    fs::write(UNIT_PATH, unit).with_context(|| format!("Failed to write {}", UNIT_PATH))?;

    println!("Installed {}.", UNIT_PATH);
    println!("Enable and start it with:");
    println!("  systemctl daemon-reload && systemctl enable --now portwarden");
    Ok(())
}

/// Human-readable byte count for CLI tables.
pub fn format_bytes(bytes: i64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes / MIB)
    } else {
        format!("{} B", bytes as i64)
    }
}
