//! Overlay actor: the text cursor, visibility and timing log behind the surface
//!
//! The actor itself is display-agnostic so its state machine can be driven
//! directly; `run` wires it to an X11 surface, the overlay's hotkey grabs and
//! the inbox of actions sent by the presentation actor.

pub mod surface;

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::compositor::{Raster, TextCompositor, TextRenderer};
use crate::config::TextSettings;
use crate::cursor::Cursor;
use crate::event_loop::{run_loop, EventSource, Flow, LoopMode, StopSignal};
use crate::font;
use crate::hotkeys::x11::X11Backend;
use crate::hotkeys::{Action, HotkeyRouter};
use crate::keys::Combination;
use crate::lifecycle::Startup;
use crate::timing_log::{FileSink, LogSink, TimingLog};
use crate::x11_utils::CachedAtoms;
use surface::OverlaySurface;

/// Where overlay frames end up
pub trait OverlayDisplay {
    fn size(&self) -> (u32, u32);

    /// Replace the visible frame with `frame`
    fn present(&mut self, frame: &Raster) -> Result<()>;

    fn set_visible(&mut self, visible: bool) -> Result<()>;
}

pub struct OverlayActor<D: OverlayDisplay, R: TextRenderer, S: LogSink> {
    display: D,
    renderer: R,
    texts: Vec<String>,
    cursor: Cursor,
    visible: bool,
    log: TimingLog<S>,
    /// Presentation inbox for slide moves that follow text moves
    peer: Option<Sender<Action>>,
}

impl<D: OverlayDisplay, R: TextRenderer, S: LogSink> OverlayActor<D, R, S> {
    /// Visible at index 0 with the first text rendered
    pub fn new(display: D, renderer: R, texts: Vec<String>, log: TimingLog<S>, peer: Option<Sender<Action>>) -> Result<Self> {
        let cursor = Cursor::new(texts.len()).ok_or_else(|| anyhow!("Overlay needs at least one text"))?;
        let mut actor = Self {
            display,
            renderer,
            texts,
            cursor,
            visible: true,
            log,
            peer,
        };
        actor.render_frame().context("Failed to render the first overlay text")?;
        Ok(actor)
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn index(&self) -> usize {
        self.cursor.index()
    }

    pub fn current_text(&self) -> &str {
        &self.texts[self.cursor.index()]
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn log(&self) -> &TimingLog<S> {
        &self.log
    }

    fn render_frame(&mut self) -> Result<()> {
        let (width, height) = self.display.size();
        let frame = self.renderer.render(width, height, self.current_text())?;
        self.display.present(&frame)
    }

    /// Move by `delta` texts. At either end nothing happens: no render, no log entry.
    pub fn advance(&mut self, delta: isize, now: Instant) -> bool {
        let previous = self.cursor.index();
        let Some(index) = self.cursor.step(delta) else {
            debug!(index = previous, delta = delta, "Text cursor at boundary");
            return false;
        };

        if let Err(e) = self.render_frame() {
            error!(index = index, error = %format!("{e:#}"), "Failed to render overlay text, keeping previous frame");
        }
        let shown = self.texts[previous].clone();
        self.log.record(&shown, now);
        info!(index = index, text = %self.current_text(), "Overlay text changed");
        true
    }

    pub fn set_visible(&mut self, visible: bool) {
        match self.display.set_visible(visible) {
            Ok(()) => {
                self.visible = visible;
                info!(visible = visible, "Overlay visibility changed");
            }
            Err(e) => error!(visible = visible, error = %format!("{e:#}"), "Failed to change overlay visibility"),
        }
    }

    pub fn start_timer(&mut self, now: Instant) {
        let text = self.current_text().to_string();
        self.log.start_timer(&text, now);
    }

    fn forward(&self, action: Action) {
        if let Some(peer) = &self.peer
            && peer.send(action).is_err()
        {
            warn!(action = %action, "Presentation actor gone, cannot forward slide move");
        }
    }

    /// React to one action, from a hotkey or from the presentation actor
    pub fn handle(&mut self, action: Action, now: Instant) {
        match action {
            Action::Show => self.set_visible(true),
            Action::Hide => self.set_visible(false),
            Action::NextText => {
                self.advance(1, now);
                self.forward(Action::NextSlide);
            }
            Action::PreviousText => {
                self.advance(-1, now);
                self.forward(Action::PreviousSlide);
            }
            Action::StartTimer => self.start_timer(now),
            other => debug!(action = %other, "Overlay ignores action"),
        }
    }
}

/// Everything the overlay thread needs, moved in at spawn time
pub struct OverlayLaunch {
    pub texts: Vec<String>,
    pub bindings: Vec<(Action, Combination)>,
    pub text: TextSettings,
    pub log_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub peer: Option<Sender<Action>>,
    pub inbox: Receiver<Action>,
}

type SurfaceActor<'a> = OverlayActor<OverlaySurface<'a>, TextCompositor, FileSink>;

/// Feeds X11 events and peer actions into the actor
struct OverlayPump<'a> {
    conn: &'a RustConnection,
    router: HotkeyRouter<X11Backend<'a>>,
    actor: SurfaceActor<'a>,
    inbox: Receiver<Action>,
    inbox_open: bool,
}

impl OverlayPump<'_> {
    fn drain_inbox(&mut self) -> bool {
        if !self.inbox_open {
            return false;
        }
        match self.inbox.try_recv() {
            Ok(action) => {
                debug!(action = %action, "Overlay received action from presentation");
                self.actor.handle(action, Instant::now());
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
                let Some(signal) = self.router.backend().signal_for(&press) else {
                    debug!(keycode = press.detail, "Key press without a matching hotkey");
                    return;
                };
                let actor = &mut self.actor;
                self.router.dispatch(signal, |action| actor.handle(action, Instant::now()));
            }
            Event::Expose(expose) if expose.count == 0 => {
                if let Err(e) = self.actor.display().redraw() {
                    error!(error = %format!("{e:#}"), "Failed to redraw overlay after expose");
                }
            }
            Event::Error(e) => warn!(error = ?e, "X11 error on overlay connection"),
            _ => {}
        }
    }

    fn shutdown(&mut self) {
        self.router.unregister_all();
        self.actor.display.release();
    }
}

impl EventSource for OverlayPump<'_> {
    fn poll_once(&mut self) -> Result<Flow> {
        if self.drain_inbox() {
            return Ok(Flow::Continue);
        }
        match self.conn.poll_for_event().context("Overlay X11 connection failed")? {
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
        let event = self.conn.wait_for_event().context("Overlay X11 connection failed")?;
        self.handle_event(event);
        Ok(Flow::Continue)
    }
}

/// Overlay thread body: build the surface, register hotkeys, report ready, run
pub fn run(launch: OverlayLaunch, startup: &mut Startup<()>, stop: StopSignal) -> Result<()> {
    let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X11 for the overlay")?;
    let screen = conn
        .setup()
        .roots
        .get(screen_num)
        .ok_or_else(|| anyhow!("X11 screen {} not found", screen_num))?;
    let atoms = CachedAtoms::new(&conn)?;

    let text = &launch.text;
    let font = font::load(&text.font_path)?;
    let compositor = TextCompositor::new(font, text.font_size, text.color, text.x_pos);
    let surface = OverlaySurface::new(&conn, screen, &atoms, text.y_pos)?;
    let log = TimingLog::new(launch.log_path.map(FileSink::new), Instant::now());
    let actor = OverlayActor::new(surface, compositor, launch.texts, log, launch.peer)?;

    let mut router = HotkeyRouter::new(X11Backend::new(&conn, screen.root)?, "overlay");
    for (action, combination) in launch.bindings {
        router.register(action, combination);
    }

    let mut pump = OverlayPump {
        conn: &conn,
        router,
        actor,
        inbox: launch.inbox,
        inbox_open: true,
    };
    startup.ready(());

    let result = run_loop(
        "overlay",
        &mut pump,
        LoopMode::Polling { interval: launch.poll_interval },
        &stop,
    );
    pump.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing_log::tests::MemorySink;
    use std::cell::RefCell;
    use std::sync::mpsc;

    #[derive(Debug, Default)]
    struct FakeDisplay {
        frames: usize,
        visible: Vec<bool>,
        fail_present: bool,
    }

    impl OverlayDisplay for FakeDisplay {
        fn size(&self) -> (u32, u32) {
            (4, 2)
        }

        fn present(&mut self, _frame: &Raster) -> Result<()> {
            if self.fail_present {
                anyhow::bail!("BadAlloc");
            }
            self.frames += 1;
            Ok(())
        }

        fn set_visible(&mut self, visible: bool) -> Result<()> {
            self.visible.push(visible);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRenderer {
        rendered: RefCell<Vec<String>>,
    }

    impl TextRenderer for FakeRenderer {
        fn render(&self, width: u32, height: u32, text: &str) -> Result<Raster> {
            self.rendered.borrow_mut().push(text.to_string());
            Ok(Raster::transparent(width, height))
        }
    }

    type TestActor = OverlayActor<FakeDisplay, FakeRenderer, MemorySink>;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn actor_with(items: &[&str], logging: bool, peer: Option<Sender<Action>>) -> (TestActor, Instant) {
        let t0 = Instant::now();
        let sink = logging.then(MemorySink::default);
        let actor = OverlayActor::new(
            FakeDisplay::default(),
            FakeRenderer::default(),
            texts(items),
            TimingLog::new(sink, t0),
            peer,
        )
        .unwrap();
        (actor, t0)
    }

    #[test]
    fn test_starts_visible_at_first_text() {
        let (actor, _) = actor_with(&["a", "b"], false, None);
        assert_eq!(actor.index(), 0);
        assert!(actor.is_visible());
        assert_eq!(actor.display().frames, 1);
        assert_eq!(*actor.renderer.rendered.borrow(), texts(&["a"]));
    }

    #[test]
    fn test_empty_text_set_rejected() {
        let result: Result<TestActor> = OverlayActor::new(
            FakeDisplay::default(),
            FakeRenderer::default(),
            Vec::new(),
            TimingLog::new(None, Instant::now()),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_three_items_three_advances() {
        let (mut actor, t0) = actor_with(&["one", "two", "three"], true, None);
        for step in 1..=3u64 {
            actor.handle(Action::NextText, t0 + Duration::from_secs(step * 10));
        }
        assert_eq!(actor.index(), 2);
        assert_eq!(actor.log().sink().unwrap().writes, 2);
        // Initial frame plus two changes; the boundary press renders nothing
        assert_eq!(actor.display().frames, 3);
        assert_eq!(
            actor.log().sink().unwrap().lines,
            vec![
                "\u{2014}0:00:10".to_string(),
                "one: 0:00:10".to_string(),
                "\u{2014}0:00:10".to_string(),
                "two: 0:00:10".to_string(),
            ]
        );
    }

    #[test]
    fn test_previous_at_start_is_noop() {
        let (mut actor, t0) = actor_with(&["one", "two"], true, None);
        assert!(!actor.advance(-1, t0 + Duration::from_secs(3)));
        assert_eq!(actor.index(), 0);
        assert_eq!(actor.display().frames, 1);
        assert_eq!(actor.log().sink().unwrap().writes, 0);
    }

    #[test]
    fn test_visibility_keeps_cursor_and_content() {
        let (mut actor, t0) = actor_with(&["one", "two"], false, None);
        actor.advance(1, t0);
        actor.handle(Action::Hide, t0);
        assert!(!actor.is_visible());
        actor.handle(Action::Show, t0);
        assert!(actor.is_visible());
        assert_eq!(actor.index(), 1);
        assert_eq!(actor.display().visible, vec![false, true]);
        assert_eq!(actor.display().frames, 2);
    }

    #[test]
    fn test_start_timer_writes_zero_marker() {
        let (mut actor, t0) = actor_with(&["intro", "body"], true, None);
        actor.handle(Action::StartTimer, t0 + Duration::from_secs(30));
        actor.handle(Action::NextText, t0 + Duration::from_secs(95));
        assert_eq!(
            actor.log().sink().unwrap().lines,
            vec![
                "intro: 0:00:00".to_string(),
                "\u{2014}0:01:05".to_string(),
                "intro: 0:01:05".to_string(),
            ]
        );
    }

    #[test]
    fn test_render_failure_is_not_fatal() {
        let (mut actor, t0) = actor_with(&["one", "two"], true, None);
        actor.display.fail_present = true;
        assert!(actor.advance(1, t0));
        assert_eq!(actor.index(), 1);
        assert_eq!(actor.display().frames, 1);
        assert_eq!(actor.log().sink().unwrap().writes, 1);
    }

    #[test]
    fn test_text_moves_forwarded_to_presentation() {
        let (tx, rx) = mpsc::channel();
        let (mut actor, t0) = actor_with(&["one", "two"], false, Some(tx));
        actor.handle(Action::NextText, t0);
        actor.handle(Action::NextText, t0);
        actor.handle(Action::PreviousText, t0);
        actor.handle(Action::Show, t0);
        let forwarded: Vec<Action> = rx.try_iter().collect();
        assert_eq!(forwarded, vec![Action::NextSlide, Action::NextSlide, Action::PreviousSlide]);
    }

    #[test]
    fn test_presentation_actions_ignored() {
        let (mut actor, t0) = actor_with(&["one", "two"], false, None);
        actor.handle(Action::NextSlide, t0);
        actor.handle(Action::Quit, t0);
        assert_eq!(actor.index(), 0);
        assert!(actor.display().visible.is_empty());
    }
}
