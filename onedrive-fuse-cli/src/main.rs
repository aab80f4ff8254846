mod cli;
mod ops;

use onedrive_fuse::Supervisor;

fn main() -> anyhow::Result<()> {
    let args = argh::from_env::<cli::CliArgs>();
    args.init_logger()?;

    let config = args.config();

    // create the mount point if it does not exist
    if !config.mount_point.exists() {
        log::info!("creating mount point at {}", config.mount_point.display());
        std::fs::create_dir_all(&config.mount_point)?;
    }

    let supervisor = Supervisor::new(config.clone(), Box::new(ops::EnosysOps));

    if config.foreground {
        log::info!("mounting OneDrive at {}", config.mount_point.display());
        supervisor.run()?;
    } else {
        log::info!(
            "mounting OneDrive at {} in the background",
            config.mount_point.display()
        );
        supervisor.run_daemonized()?;
    }

    Ok(())
}
