//! Process lifecycle supervision.
//!
//! Four ordered resources, each with an explicit init/term pair: signal
//! handlers, the authorization server, and the mount session with its
//! reactor registration. Initialization runs in dependency order, teardown
//! strictly in reverse, and a failure partway through initialization
//! unwinds exactly the steps that already succeeded.

use std::cell::RefCell;
use std::rc::Rc;

use nix::unistd::{fork, ForkResult};

use crate::auth::{AuthCode, AuthServer};
use crate::channel::FuseChannel;
use crate::config::Config;
use crate::daemon::{self, Handshake};
use crate::error::{Error, Result};
use crate::reactor::{Interest, Reactor};
use crate::session::{ChannelBridge, ConnectionInfo, MountSession, SessionHooks};
use crate::signal::Signals;

/// Owns the reactor and sequences startup, the run loop, and shutdown.
pub struct Supervisor {
    config: Rc<Config>,
    reactor: Reactor,
    session: Rc<MountSession>,
    code: AuthCode,
    hooks: Option<Box<dyn SessionHooks>>,
    signals: Option<Signals>,
    auth: Option<Rc<RefCell<AuthServer>>>,
    bridge: Option<Rc<RefCell<ChannelBridge<FuseChannel>>>>,
}

impl Supervisor {
    pub fn new(config: Config, hooks: Box<dyn SessionHooks>) -> Self {
        Self {
            config: Rc::new(config),
            reactor: Reactor::new(),
            session: MountSession::new(),
            code: AuthCode::new(),
            hooks: Some(hooks),
            signals: None,
            auth: None,
            bridge: None,
        }
    }

    /// Handle to the captured authorization code, for the token exchange.
    pub fn auth_code(&self) -> AuthCode {
        self.code.clone()
    }

    /// Handle to the mount session's lifecycle state.
    pub fn session(&self) -> Rc<MountSession> {
        self.session.clone()
    }

    /// Run the complete lifecycle in the foreground: initialize, loop until
    /// the session exits, tear down.
    pub fn run(mut self) -> Result<()> {
        self.init()?;
        let result = self.run_loop();
        self.term();
        result
    }

    /// Fork into the background and run the lifecycle in the child.
    ///
    /// In the parent this returns once the child has reported its
    /// initialization outcome; the parent never mounts anything itself. In
    /// the child it returns when the session has ended and teardown is
    /// complete.
    pub fn run_daemonized(mut self) -> Result<()> {
        let handshake = Handshake::new()?;

        match unsafe { fork() }.map_err(Error::Daemonize)? {
            ForkResult::Parent { .. } => {
                if handshake.into_parent().wait()? {
                    Ok(())
                } else {
                    Err(Error::HandshakeFailed)
                }
            }
            ForkResult::Child => {
                let handshake = handshake.into_child();
                let initialized = daemon::detach().and_then(|()| self.init());
                handshake.report(initialized.is_ok());

                match initialized {
                    Ok(()) => {
                        let result = self.run_loop();
                        self.term();
                        result
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Initialization order: signals, authorization server, mount. Any
    /// failure unwinds the steps that already completed, in reverse.
    fn init(&mut self) -> Result<()> {
        self.init_signals()?;

        if let Err(err) = self.init_auth() {
            self.term_signals();
            return Err(err);
        }

        if let Err(err) = self.init_mount() {
            self.term_auth();
            self.term_signals();
            return Err(err);
        }

        Ok(())
    }

    fn run_loop(&mut self) -> Result<()> {
        info!("entering event loop");
        while !self.session.is_exited() {
            self.reactor.run_one_iteration()?;
        }
        info!("session exited, leaving event loop");
        Ok(())
    }

    /// Teardown is the strict reverse of initialization and is idempotent
    /// per step.
    fn term(&mut self) {
        self.term_mount();
        self.term_auth();
        self.term_signals();
    }

    fn init_signals(&mut self) -> Result<()> {
        let (signals, source) = Signals::install(self.session.clone())?;

        if let Err(err) = self
            .reactor
            .register(signals.source_fd(), Interest::Readable, source)
        {
            signals.restore();
            return Err(err);
        }

        self.signals = Some(signals);
        Ok(())
    }

    fn term_signals(&mut self) {
        if let Some(signals) = self.signals.take() {
            let _ = self.reactor.unregister(signals.source_fd());
            signals.restore();
        }
    }

    fn init_auth(&mut self) -> Result<()> {
        let server = AuthServer::bind(self.config.clone(), self.code.clone())?;
        let fd = server.fd();
        let server = Rc::new(RefCell::new(server));

        self.reactor.register(fd, Interest::Readable, server.clone())?;
        self.auth = Some(server);
        Ok(())
    }

    fn term_auth(&mut self) {
        if let Some(server) = self.auth.take() {
            server.borrow_mut().stop(&mut self.reactor);
        }
    }

    fn init_mount(&mut self) -> Result<()> {
        let hooks = self.hooks.take().ok_or(Error::AlreadyStarted)?;

        let mount_point = self.config.mount_point.clone();
        let channel = FuseChannel::mount(&mount_point).map_err(|source| Error::Mount {
            path: mount_point.clone(),
            source,
        })?;

        info!("filesystem mounted at {}", mount_point.display());

        let bridge = Rc::new(RefCell::new(ChannelBridge::new(
            channel,
            hooks,
            self.session.clone(),
        )));
        let fd = bridge.borrow().fd();

        if let Err(err) = self.reactor.register(fd, Interest::Readable, bridge.clone()) {
            // unmount before reporting; the bridge never reached the reactor
            if let Err(unmount_err) = bridge.borrow_mut().unmount() {
                error!("failed to unmount after registration failure: {unmount_err}");
            }
            self.session.set_unmounted();
            return Err(err);
        }

        bridge
            .borrow_mut()
            .notify_mount_ready(&ConnectionInfo { mount_point });
        self.bridge = Some(bridge);
        Ok(())
    }

    /// Unmounting happens only after the bridge's registration is gone, so
    /// no wait on the channel descriptor can be outstanding.
    fn term_mount(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            let fd = bridge.borrow().fd();
            // the bridge may already have unregistered itself on exit
            let _ = self.reactor.unregister(fd);

            if let Err(err) = bridge.borrow_mut().unmount() {
                error!(
                    "failed to unmount {}: {err}",
                    self.config.mount_point.display()
                );
            } else {
                info!("unmounted {}", self.config.mount_point.display());
            }
        }
        self.session.set_unmounted();
    }
}
