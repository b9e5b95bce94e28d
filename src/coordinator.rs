//! Top-level orchestration: configuration, actor start-up, quit hotkey, ordered shutdown
//!
//! The coordinator owns the master quit hotkey on its own connection. Its loop
//! blocks on that connection (or polls it when configured); stop requests from
//! signals or failing actors wake it with a client message sent to an unmapped
//! control window.

use anyhow::{anyhow, Context, Error, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::*;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::config::{self, Bindings, Config};
use crate::event_loop::{run_loop, EventSource, Flow, LoopMode, StopSignal};
use crate::hotkeys::x11::X11Backend;
use crate::hotkeys::{Action, HotkeyRouter, Owner};
use crate::keys::Combination;
use crate::lifecycle::{spawn_actor, ActorHandle, ReleaseOnce};
use crate::overlay::{self, OverlayLaunch};
use crate::presentation::viewer::ViewerSettings;
use crate::presentation::{self, PresentationLaunch};
use crate::x11_utils::{send_wake, CachedAtoms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    ShuttingDown,
    Stopped,
}

/// Cloneable stop handle usable from any thread
#[derive(Debug, Clone)]
pub struct ShutdownRequester {
    stop: StopSignal,
    failed: Arc<AtomicBool>,
    control_window: Option<Window>,
}

impl ShutdownRequester {
    pub fn new(stop: StopSignal, control_window: Option<Window>) -> Self {
        Self {
            stop,
            failed: Arc::new(AtomicBool::new(false)),
            control_window,
        }
    }

    pub fn request(&self, reason: &str) {
        info!(reason = reason, "Shutdown requested");
        self.stop.request();
        self.wake();
    }

    /// A running actor hit an unrecoverable error
    pub fn fail(&self, error: Error) {
        error!(error = %format!("{error:#}"), "Actor failed, shutting down");
        self.failed.store(true, Ordering::SeqCst);
        self.request("actor failure");
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// The coordinator may be blocked in `wait_for_event` on its own connection
    fn wake(&self) {
        let Some(window) = self.control_window else {
            return;
        };
        let result = x11rb::connect(None)
            .context("Failed to connect to X11 to wake the coordinator")
            .and_then(|(conn, _)| {
                let atoms = CachedAtoms::new(&conn)?;
                send_wake(&conn, &atoms, window)
            });
        if let Err(e) = result {
            warn!(error = %format!("{e:#}"), "Failed to wake coordinator, it will stop on its next event");
        }
    }
}

/// SIGINT and SIGTERM request an orderly shutdown
#[cfg(unix)]
fn install_signal_handler(requester: ShutdownRequester) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handler")?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                info!(signal = signal, "Received stop signal");
                requester.request("signal");
            }
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

/// Phase machine and the actors it owns
pub struct Coordinator {
    phase: Phase,
    actors: Vec<ActorHandle>,
    shutdown: ReleaseOnce,
    join_timeout: Duration,
}

impl Coordinator {
    pub fn new(join_timeout: Duration) -> Self {
        Self {
            phase: Phase::Init,
            actors: Vec::new(),
            shutdown: ReleaseOnce::new(),
            join_timeout,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = ?self.phase, to = ?phase, "Coordinator phase change");
        self.phase = phase;
    }

    pub fn adopt(&mut self, actor: ActorHandle) {
        debug!(actor = actor.name(), "Coordinator adopted actor");
        self.actors.push(actor);
    }

    pub fn start_running(&mut self) {
        if self.phase == Phase::Init {
            self.enter(Phase::Running);
        }
    }

    /// Stop every actor, join each with the bounded timeout, then enter `Stopped`.
    /// Only the first call does anything.
    pub fn shutdown(&mut self) -> bool {
        if !self.shutdown.claim() {
            debug!("Shutdown already performed");
            return false;
        }
        self.enter(Phase::ShuttingDown);

        for actor in &self.actors {
            actor.request_stop();
        }
        // Reverse start order: the overlay goes before the presentation it may talk to
        for actor in self.actors.iter_mut().rev() {
            actor.join(self.join_timeout);
        }

        self.enter(Phase::Stopped);
        true
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bindings owned by `owner`, in action order
fn bindings_for(bindings: &Bindings, owner: Owner) -> Vec<(Action, Combination)> {
    bindings
        .iter()
        .filter(|(action, _)| action.owner() == owner)
        .map(|(action, combination)| (*action, combination.clone()))
        .collect()
}

/// Unmapped window that receives wake messages
fn create_control_window(conn: &RustConnection, root: Window) -> Result<Window> {
    let window = conn.generate_id().context("Failed to generate control window ID")?;
    conn.create_window(
        x11rb::COPY_DEPTH_FROM_PARENT,
        window,
        root,
        0,
        0,
        1,
        1,
        0,
        WindowClass::INPUT_ONLY,
        x11rb::COPY_FROM_PARENT,
        &CreateWindowAux::new(),
    )
    .context("Failed to create control window")?;
    conn.flush().context("Failed to flush X11 connection after creating control window")?;
    Ok(window)
}

struct CoordinatorPump<'a> {
    conn: &'a RustConnection,
    router: HotkeyRouter<X11Backend<'a>>,
    wake_atom: Atom,
    stop: StopSignal,
}

impl CoordinatorPump<'_> {
    fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::KeyPress(press) => {
                let Some(signal) = self.router.backend().signal_for(&press) else {
                    return Flow::Continue;
                };
                let mut quit = false;
                self.router.dispatch(signal, |action| quit = action == Action::Quit);
                if quit {
                    info!("Quit hotkey pressed");
                    self.stop.request();
                    return Flow::Exit;
                }
                Flow::Continue
            }
            Event::ClientMessage(message) if message.type_ == self.wake_atom => {
                debug!("Coordinator woken");
                if self.stop.is_requested() { Flow::Exit } else { Flow::Idle }
            }
            Event::Error(e) => {
                warn!(error = ?e, "X11 error on coordinator connection");
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }
}

impl EventSource for CoordinatorPump<'_> {
    fn poll_once(&mut self) -> Result<Flow> {
        match self.conn.poll_for_event().context("Coordinator X11 connection failed")? {
            Some(event) => Ok(self.handle_event(event)),
            None => Ok(Flow::Idle),
        }
    }

    fn wait_once(&mut self) -> Result<Flow> {
        let event = self.conn.wait_for_event().context("Coordinator X11 connection failed")?;
        Ok(self.handle_event(event))
    }
}

/// Cross-actor channels. A sender exists only when its coupling option is on.
struct Wiring {
    overlay_peer: Option<Sender<Action>>,
    overlay_inbox: mpsc::Receiver<Action>,
    presentation_peer: Option<Sender<Action>>,
    presentation_inbox: mpsc::Receiver<Action>,
}

fn wire(config: &Config) -> Wiring {
    let (to_overlay, overlay_inbox) = mpsc::channel();
    let (to_presentation, presentation_inbox) = mpsc::channel();
    Wiring {
        overlay_peer: config.general.simultaneous_navigation.then_some(to_presentation),
        overlay_inbox,
        presentation_peer: config.general.toggle_together.then_some(to_overlay),
        presentation_inbox,
    }
}

/// Start the presentation actor when configured, then the overlay
fn start_actors(
    coordinator: &mut Coordinator,
    config: &Config,
    bindings: &Bindings,
    requester: &ShutdownRequester,
) -> Result<()> {
    let wiring = wire(config);

    let texts = if config.general.use_presentation {
        let deck_path = config
            .deck_path()
            .ok_or_else(|| anyhow!("Presentation mode is on but no deck path is set"))?
            .to_path_buf();
        let (next_keys, previous_keys) = config.slide_keys()?;
        let launch = PresentationLaunch {
            deck_path,
            viewer: ViewerSettings {
                command: config.presentation.viewer_command.clone(),
                window_class: config.presentation.window_class.clone(),
                window_timeout: config.window_timeout(),
                next_keys,
                previous_keys,
            },
            bindings: bindings_for(bindings, Owner::Presentation),
            poll_interval: config.poll_interval(),
            peer: wiring.presentation_peer,
            inbox: wiring.presentation_inbox,
        };
        let on_fatal = requester.clone();
        let (handle, texts) = spawn_actor(
            "presentation",
            StopSignal::new(),
            config.startup_timeout(),
            config.join_timeout(),
            move |e| on_fatal.fail(e),
            move |startup, stop| presentation::run(launch, startup, stop),
        )?;
        coordinator.adopt(handle);
        texts
    } else {
        let path = config.texts_path().ok_or_else(|| anyhow!("Text source path not set"))?;
        config::load_texts(path)?
    };

    let launch = OverlayLaunch {
        texts,
        bindings: bindings_for(bindings, Owner::Overlay),
        text: config.text.clone(),
        log_path: config.log_path().map(Path::to_path_buf),
        poll_interval: config.poll_interval(),
        peer: wiring.overlay_peer,
        inbox: wiring.overlay_inbox,
    };
    let on_fatal = requester.clone();
    let (handle, ()) = spawn_actor(
        "overlay",
        StopSignal::new(),
        config.startup_timeout(),
        config.join_timeout(),
        move |e| on_fatal.fail(e),
        move |startup, stop| overlay::run(launch, startup, stop),
    )?;
    coordinator.adopt(handle);
    Ok(())
}

/// Run until quit, signal or actor failure. Start-up failures are returned after teardown.
pub fn run(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    let bindings = config.validate()?;
    info!(
        presentation = config.general.use_presentation,
        simultaneous_navigation = config.general.simultaneous_navigation,
        toggle_together = config.general.toggle_together,
        hotkeys = bindings.len(),
        "Configuration validated"
    );

    let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X11")?;
    let root = conn
        .setup()
        .roots
        .get(screen_num)
        .ok_or_else(|| anyhow!("X11 screen {} not found", screen_num))?
        .root;
    let atoms = CachedAtoms::new(&conn)?;
    let control_window = create_control_window(&conn, root)?;

    let stop = StopSignal::new();
    let requester = ShutdownRequester::new(stop.clone(), Some(control_window));
    #[cfg(unix)]
    install_signal_handler(requester.clone())?;

    let mut coordinator = Coordinator::new(config.join_timeout());
    let mut pump = CoordinatorPump {
        conn: &conn,
        router: HotkeyRouter::new(X11Backend::new(&conn, root)?, "coordinator"),
        wake_atom: atoms.wake,
        stop: stop.clone(),
    };

    let result = match start_actors(&mut coordinator, &config, &bindings, &requester) {
        Ok(()) => {
            for (action, combination) in bindings_for(&bindings, Owner::Coordinator) {
                pump.router.register(action, combination);
            }
            coordinator.start_running();
            let mode = if config.general.coordinator_blocking {
                LoopMode::Blocking
            } else {
                LoopMode::Polling { interval: config.poll_interval() }
            };
            run_loop("coordinator", &mut pump, mode, &stop)
        }
        Err(e) => Err(e.context("Start-up failed")),
    };

    pump.router.unregister_all();
    coordinator.shutdown();
    if let Err(e) = conn.destroy_window(control_window) {
        warn!(window = control_window, error = %e, "Failed to destroy control window");
    }
    let _ = conn.flush();

    result?;
    if requester.has_failed() {
        return Err(anyhow!("An actor stopped with a fatal error"));
    }
    info!("Orderly shutdown complete");
    Ok(())
}
