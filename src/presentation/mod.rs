//! Presentation actor: a slide cursor over the deck plus the viewer window
//!
//! The slide texts are read from the deck before the viewer starts and handed
//! back to the coordinator through the start-up handshake, so the overlay can
//! show the same list.

pub mod deck;
pub mod viewer;

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::cursor::Cursor;
use crate::event_loop::{run_loop, EventSource, Flow, LoopMode, StopSignal};
use crate::hotkeys::x11::X11Backend;
use crate::hotkeys::{Action, HotkeyRouter};
use crate::keys::Combination;
use crate::lifecycle::Startup;
use crate::x11_utils::CachedAtoms;
use deck::Deck;
use viewer::{ViewerHost, ViewerSettings};

/// The external slide viewer as seen by the actor
pub trait PresentationHost {
    fn show(&mut self) -> Result<()>;
    fn hide(&mut self) -> Result<()>;
    fn next_slide(&mut self) -> Result<()>;
    fn previous_slide(&mut self) -> Result<()>;

    /// Shut the viewer down; later calls do nothing
    fn close(&mut self);
}

pub struct PresentationActor<H: PresentationHost> {
    host: H,
    texts: Vec<String>,
    cursor: Cursor,
    /// Overlay inbox, set when showing the presentation should hide the overlay
    peer: Option<Sender<Action>>,
}

impl<H: PresentationHost> PresentationActor<H> {
    pub fn new(host: H, texts: Vec<String>, peer: Option<Sender<Action>>) -> Result<Self> {
        let cursor = Cursor::new(texts.len()).ok_or_else(|| anyhow!("Deck has no slides"))?;
        Ok(Self { host, texts, cursor, peer })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn index(&self) -> usize {
        self.cursor.index()
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    /// Move by one slide. At either end nothing is sent; a failed move leaves the index unchanged.
    pub fn advance(&mut self, delta: isize) -> bool {
        let previous = self.cursor.index();
        let Some(index) = self.cursor.step(delta) else {
            debug!(index = previous, delta = delta, "Slide cursor at boundary");
            return false;
        };

        let result = if delta > 0 {
            self.host.next_slide()
        } else {
            self.host.previous_slide()
        };
        match result {
            Ok(()) => {
                info!(index = index, slide = %self.texts[index], "Slide changed");
                true
            }
            Err(e) => {
                error!(index = index, error = %format!("{e:#}"), "Failed to change slide");
                self.cursor.restore(previous);
                false
            }
        }
    }

    fn notify_overlay(&self, action: Action) {
        if let Some(peer) = &self.peer
            && peer.send(action).is_err()
        {
            warn!(action = %action, "Overlay actor gone, cannot toggle it");
        }
    }

    pub fn show(&mut self) {
        self.notify_overlay(Action::Hide);
        match self.host.show() {
            Ok(()) => info!("Presentation shown"),
            Err(e) => error!(error = %format!("{e:#}"), "Failed to show presentation"),
        }
    }

    pub fn hide(&mut self) {
        self.notify_overlay(Action::Show);
        match self.host.hide() {
            Ok(()) => info!("Presentation hidden"),
            Err(e) => error!(error = %format!("{e:#}"), "Failed to hide presentation"),
        }
    }

    pub fn handle(&mut self, action: Action) {
        match action {
            Action::ShowPresentation => self.show(),
            Action::HidePresentation => self.hide(),
            Action::NextSlide => {
                self.advance(1);
            }
            Action::PreviousSlide => {
                self.advance(-1);
            }
            other => debug!(action = %other, "Presentation ignores action"),
        }
    }

    pub fn close(&mut self) {
        self.host.close();
    }
}

/// Everything the presentation thread needs, moved in at spawn time
pub struct PresentationLaunch {
    pub deck_path: PathBuf,
    pub viewer: ViewerSettings,
    pub bindings: Vec<(Action, Combination)>,
    pub poll_interval: Duration,
    pub peer: Option<Sender<Action>>,
    pub inbox: Receiver<Action>,
}

struct PresentationPump<'a> {
    conn: &'a RustConnection,
    router: HotkeyRouter<X11Backend<'a>>,
    actor: PresentationActor<ViewerHost<'a>>,
    inbox: Receiver<Action>,
    inbox_open: bool,
}

impl PresentationPump<'_> {
    fn drain_inbox(&mut self) -> bool {
        if !self.inbox_open {
            return false;
        }
        match self.inbox.try_recv() {
            Ok(action) => {
                debug!(action = %action, "Presentation received action from overlay");
                self.actor.handle(action);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.inbox_open = false;
                false
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::KeyPress(press) => {
                if let Some(signal) = self.router.backend().signal_for(&press) {
                    let actor = &mut self.actor;
                    self.router.dispatch(signal, |action| actor.handle(action));
                }
            }
            Event::Error(e) => warn!(error = ?e, "X11 error on presentation connection"),
            _ => {}
        }
    }

    fn shutdown(&mut self) {
        self.router.unregister_all();
        self.actor.close();
    }
}

impl EventSource for PresentationPump<'_> {
    fn poll_once(&mut self) -> Result<Flow> {
        if self.drain_inbox() {
            return Ok(Flow::Continue);
        }
        match self.conn.poll_for_event().context("Presentation X11 connection failed")? {
            Some(event) => {
                self.handle_event(event);
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Idle),
        }
    }

    fn wait_once(&mut self) -> Result<Flow> {
        if self.drain_inbox() {
            return Ok(Flow::Continue);
        }
        let event = self.conn.wait_for_event().context("Presentation X11 connection failed")?;
        self.handle_event(event);
        Ok(Flow::Continue)
    }
}

/// Presentation thread body: read the deck, launch the viewer, report the slide texts, run
pub fn run(launch: PresentationLaunch, startup: &mut Startup<Vec<String>>, stop: StopSignal) -> Result<()> {
    let texts = Deck::open(&launch.deck_path)?.texts();
    if texts.is_empty() {
        anyhow::bail!("Deck {} has no slides", launch.deck_path.display());
    }

    let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X11 for the presentation")?;
    let root = conn
        .setup()
        .roots
        .get(screen_num)
        .ok_or_else(|| anyhow!("X11 screen {} not found", screen_num))?
        .root;
    let atoms = CachedAtoms::new(&conn)?;

    let host = ViewerHost::launch(&conn, root, atoms, &launch.viewer, &launch.deck_path)?;
    let actor = PresentationActor::new(host, texts.clone(), launch.peer)?;

    let mut router = HotkeyRouter::new(X11Backend::new(&conn, root)?, "presentation");
    for (action, combination) in launch.bindings {
        router.register(action, combination);
    }

    let mut pump = PresentationPump {
        conn: &conn,
        router,
        actor,
        inbox: launch.inbox,
        inbox_open: true,
    };
    startup.ready(texts);

    let result = run_loop(
        "presentation",
        &mut pump,
        LoopMode::Polling { interval: launch.poll_interval },
        &stop,
    );
    pump.shutdown();
    result
}
