//! Component thread body.
//!
//! One thread per periodic or continuous component. While Ready the thread
//! only executes mail; while Active every cycle is
//! `state table start -> commands -> events -> run -> advance`, followed by
//! the period sleep for periodic components.

use crate::communication::mailbox::panic_message;
use crate::core::component::{ComponentShared, Task, TaskContext};
use crate::core::state::ComponentState;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on how long an idle thread sleeps between lifecycle checks
pub const IDLE_WAIT: Duration = Duration::from_millis(20);

/// Run `startup`. On failure the component is closed, flagged and Finished
/// without cleanup, and false is returned.
pub(crate) fn run_startup(shared: &Arc<ComponentShared>, task: &mut dyn Task) -> bool {
    let mut ctx = TaskContext::new(shared.clone());
    let outcome = match catch_unwind(AssertUnwindSafe(|| task.startup(&mut ctx))) {
        Ok(Ok(())) => return true,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("startup panicked: {}", panic_message(payload.as_ref())),
    };
    log::error!("{}: startup failed: {}", shared.name, outcome);
    shared.state.mark_failed(outcome);
    shared.close_mailboxes();
    shared.reject_remaining();
    shared.state.finish();
    false
}

/// Thread entry point for periodic and continuous components
pub(crate) fn run(shared: Arc<ComponentShared>, mut task: Box<dyn Task>) {
    for mailbox in shared.mailboxes() {
        mailbox.bind_owner_thread();
    }
    if !run_startup(&shared, task.as_mut()) {
        return;
    }
    if shared
        .state
        .transition(ComponentState::Initializing, ComponentState::Ready)
    {
        log::debug!("{}: ready", shared.name);
    }

    let mut ctx = TaskContext::new(shared.clone());
    let mut deadline = Instant::now();
    loop {
        match shared.state.get() {
            ComponentState::Ready => {
                shared.drain_mailboxes();
                if shared.state.get() == ComponentState::Ready {
                    shared.doorbell.wait(IDLE_WAIT);
                }
                deadline = Instant::now();
            }
            ComponentState::Active => {
                cycle(&shared, task.as_mut(), &mut ctx);
                if let Some(period) = shared.kind.period() {
                    deadline += period;
                    let now = Instant::now();
                    if now > deadline {
                        let overruns = shared.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                        log::debug!(
                            "{}: cycle overran its period by {:?} ({} overruns)",
                            shared.name,
                            now - deadline,
                            overruns
                        );
                        deadline = now;
                    } else {
                        shared.state.sleep_until(deadline, ComponentState::Active);
                    }
                }
            }
            ComponentState::Constructed | ComponentState::Initializing => {
                shared.doorbell.wait(IDLE_WAIT);
            }
            ComponentState::Finishing | ComponentState::Finished => break,
        }
    }

    shared.drain_mailboxes();
    let rejected = shared.reject_remaining();
    if rejected > 0 {
        log::debug!("{}: rejected {} queued entries", shared.name, rejected);
    }
    if catch_unwind(AssertUnwindSafe(|| task.cleanup(&mut ctx))).is_err() {
        log::error!("{}: cleanup panicked", shared.name);
    }
    if shared.state.finish() {
        log::info!(
            "{}: finished after {} cycles",
            shared.name,
            shared.cycles.load(Ordering::Relaxed)
        );
    }
}

fn cycle(shared: &ComponentShared, task: &mut dyn Task, ctx: &mut TaskContext) {
    let table = &shared.state_table;
    table.start();
    if let Some(commands) = &shared.commands {
        commands.drain_all();
    }
    if let Some(events) = &shared.events {
        events.drain_all();
    }
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run(ctx))) {
        log::error!(
            "{}: run panicked: {}",
            shared.name,
            panic_message(payload.as_ref())
        );
    }
    if table.automatic_advance() {
        table.advance();
    }
    shared.cycles.fetch_add(1, Ordering::Relaxed);
}
