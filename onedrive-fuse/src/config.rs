use std::path::PathBuf;

/// Identifier of the application registered with the identity provider.
pub const DEFAULT_APP_ID: &str = "f457aaf7-d90c-406c-95ae-2d590bac9b64";
/// Where OneDrive sends the browser once the user has signed in.
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:2300/authorization-code";
/// Loopback port the authorization server listens on.
pub const DEFAULT_AUTH_PORT: u16 = 2300;

/// Application configuration.
///
/// Parsed once by the caller and immutable for the process lifetime; the
/// supervisor owns it and hands read-only references to the authorization
/// server and the kernel-channel bridge.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of the registered application.
    pub app_id: String,
    /// Redirect URI announced to the identity provider.
    pub redirect_uri: String,
    /// Port the authorization server binds on the loopback interface.
    pub auth_port: u16,
    /// Where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Stay in the foreground instead of forking into the background.
    pub foreground: bool,
}

impl Config {
    /// Configuration for `mount_point` with the default application identity.
    pub fn new(mount_point: PathBuf) -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            auth_port: DEFAULT_AUTH_PORT,
            mount_point,
            foreground: false,
        }
    }
}
