use std::path::PathBuf;

use argh::FromArgs;
use onedrive_fuse::config::{Config, DEFAULT_APP_ID, DEFAULT_AUTH_PORT, DEFAULT_REDIRECT_URI};

/// OneDrive FUSE CLI
///
/// Mount a OneDrive account as a local filesystem.
#[derive(FromArgs, Debug)]
pub struct CliArgs {
    /// identifier of the registered application to use
    #[argh(option, default = "DEFAULT_APP_ID.to_string()")]
    pub app_id: String,
    /// uri OneDrive redirects to when authentication is completed
    #[argh(option, default = "DEFAULT_REDIRECT_URI.to_string()")]
    pub redirect_uri: String,
    /// port to listen on for OAuth authentication
    #[argh(option, default = "DEFAULT_AUTH_PORT")]
    pub auth_port: u16,
    /// stay in the foreground instead of running in the background
    #[argh(switch, short = 'f')]
    pub foreground: bool,
    /// enable verbose logging
    #[argh(switch, short = 'v')]
    pub verbose: bool,
    /// path where the OneDrive filesystem will be mounted
    #[argh(positional)]
    pub mount_point: PathBuf,
}

impl CliArgs {
    pub fn init_logger(&self) -> anyhow::Result<()> {
        let level = if self.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new().filter_level(level).try_init()?;
        Ok(())
    }

    pub fn config(&self) -> Config {
        Config {
            app_id: self.app_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            auth_port: self.auth_port,
            mount_point: self.mount_point.clone(),
            foreground: self.foreground,
        }
    }
}
