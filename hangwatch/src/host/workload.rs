//! Scripted demo workload.
//!
//! A short sequence of events for the demo loop that walks through every
//! kind of report: quick dispatches that stay silent, slow ones reported on
//! completion, a dispatch stuck behind a worker holding a protected widget
//! lock, a blocking wait, a modal dialog pumping nested events, and
//! optionally a pair of threads deadlocked on each other's locks.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;

use super::HostEvent;
use crate::introspection::{MonitoredMutex, ShadowRegistry, ThreadHandle};

/// Locks shared between the dispatch thread and the demo's workers.
#[derive(Clone)]
pub struct DemoWorld {
    registry: ShadowRegistry,
    canvas: Arc<MonitoredMutex<u64>>,
    document: Arc<MonitoredMutex<String>>,
}

impl DemoWorld {
    pub fn new(registry: ShadowRegistry) -> Self {
        Self {
            canvas: Arc::new(registry.mutex("ui::widget::Canvas", 0)),
            document: Arc::new(registry.mutex("app::model::Document", String::new())),
            registry,
        }
    }

    pub fn registry(&self) -> &ShadowRegistry {
        &self.registry
    }
}

/// Sleep inside a native `std::thread::sleep` frame.
fn nap(me: &ThreadHandle, millis: u64) {
    let _sleep = me.enter_native("std::thread", "sleep");
    thread::sleep(Duration::from_millis(millis));
}

/// Hold the canvas lock on a registered worker for `hold`. Returns once the
/// worker owns the lock.
pub fn spawn_render_worker(world: &DemoWorld, hold: Duration) -> Result<()> {
    let (ready_tx, ready_rx) = bounded(0);
    let world = world.clone();
    thread::Builder::new()
        .name("render-worker".to_string())
        .spawn(move || {
            let me = world.registry.register_current("render-worker");
            let _run = me.enter("app::render::Worker", "run");
            let _repaint = me.enter("app::render::Worker", "repaint");
            let mut frame = world.canvas.lock(&me);
            let _ = ready_tx.send(());
            *frame += 1;
            nap(&me, u64::try_from(hold.as_millis()).unwrap_or(u64::MAX));
        })
        .context("Failed to spawn render worker")?;
    ready_rx.recv().context("Render worker exited before taking the canvas")?;
    Ok(())
}

/// Two ledger threads taking two account locks in opposite order. They
/// never finish.
pub fn spawn_deadlock_pair(world: &DemoWorld) -> Result<()> {
    let a = Arc::new(world.registry.mutex("app::bank::Account", 100_i64));
    let b = Arc::new(world.registry.mutex("app::bank::Account", 50_i64));
    let barrier = Arc::new(Barrier::new(2));

    for (name, first, second) in
        [("ledger-a", Arc::clone(&a), Arc::clone(&b)), ("ledger-b", b, a)]
    {
        let registry = world.registry.clone();
        let barrier = Arc::clone(&barrier);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let me = registry.register_current(name);
                let _run = me.enter("app::bank::Ledger", "transfer");
                let mut from = first.lock(&me);
                barrier.wait();
                let mut to = second.lock(&me);
                *from -= 10;
                *to += 10;
            })
            .with_context(|| format!("Failed to spawn {name}"))?;
    }
    Ok(())
}

/// The demo's events, in posting order.
pub fn demo_script(world: &DemoWorld) -> Vec<HostEvent> {
    let canvas_world = world.clone();
    let paint_world = world.clone();
    let document = Arc::clone(&world.document);

    vec![
        HostEvent::new("startup: install theme", |ctx| {
            let _f = ctx.thread().enter("app::ui::Theme", "install");
            nap(ctx.thread(), 5);
        }),
        HostEvent::new("startup: restore session", |ctx| {
            let _f = ctx.thread().enter("app::session::Session", "restore");
            nap(ctx.thread(), 20);
        }),
        HostEvent::new("click: Button(ok)", |ctx| {
            let _f = ctx.thread().enter("app::ui::Button", "on_click");
            nap(ctx.thread(), 2);
        }),
        HostEvent::new("menu: File > Open", |ctx| {
            let me = ctx.thread();
            let _f = me.enter("app::ui::Menu", "open_file");
            let _load = me.enter("app::plugins::Registry", "load");
            ctx.load_feed().publish("app::plugins::spellcheck");
            let _dl = me.enter_native("libloading::Library", "new");
            nap(me, 200);
        }),
        HostEvent::new("key: Ctrl+S", move |ctx| {
            let me = ctx.thread();
            let _f = me.enter("app::editor::Document", "save");
            let mut text = document.lock(me);
            text.push_str("saved");
            let _io = me.enter("std::fs::File", "read_to_end");
            nap(me, 300);
        }),
        HostEvent::new("scroll: Canvas", move |_ctx| {
            if let Err(e) = spawn_render_worker(&canvas_world, Duration::from_millis(1_500)) {
                log::warn!("{e:#}");
            }
        }),
        HostEvent::new("paint: Canvas", move |ctx| {
            let me = ctx.thread();
            let _f = me.enter("app::ui::Canvas", "paint");
            let mut frame = paint_world.canvas.lock(me);
            *frame += 1;
        }),
        HostEvent::new("sync: fetch updates", |ctx| {
            let me = ctx.thread();
            let _f = me.enter("app::net::Client", "fetch");
            me.wait_in("std::sync::Condvar", "wait", || {
                thread::sleep(Duration::from_millis(160));
            });
        }),
        HostEvent::new("dialog: Preferences", |ctx| {
            let _f = ctx.thread().enter("app::ui::Preferences", "show");
            ctx.run_nested(1);
        }),
        HostEvent::new("click: Button(apply)", |ctx| {
            let _f = ctx.thread().enter("app::ui::Button", "on_click");
            nap(ctx.thread(), 2);
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ThreadState;
    use crate::introspection::ThreadIntrospector;

    #[test]
    fn test_render_worker_owns_canvas() {
        let world = DemoWorld::new(ShadowRegistry::new());
        spawn_render_worker(&world, Duration::from_millis(200)).unwrap();
        let worker = world.registry().all_thread_ids()[0];
        let info = world.registry().thread_info(worker, true).unwrap();
        assert_eq!(info.locked_monitors[0].lock.type_name, "ui::widget::Canvas");
    }

    #[test]
    fn test_deadlock_pair_is_detected() {
        let world = DemoWorld::new(ShadowRegistry::new());
        spawn_deadlock_pair(&world).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let deadlocked = loop {
            let found = world.registry().find_monitor_deadlocked_threads();
            if found.len() == 2 || std::time::Instant::now() > deadline {
                break found;
            }
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(deadlocked.len(), 2);
        for tid in deadlocked {
            let info = world.registry().thread_info(tid, false).unwrap();
            assert_eq!(info.state, ThreadState::Blocked);
            assert!(info.lock_owner_name.unwrap().starts_with("ledger-"));
        }
    }

    #[test]
    fn test_script_has_every_scenario() {
        let world = DemoWorld::new(ShadowRegistry::new());
        let script = demo_script(&world);
        let names: Vec<_> = script.iter().map(|e| e.descriptor.as_str()).collect();
        assert!(names.contains(&"paint: Canvas"));
        assert!(names.contains(&"dialog: Preferences"));
        assert_eq!(script.len(), 10);
    }
}
