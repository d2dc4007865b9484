// Copyright © 2024 Pathway

//! The splicer merges a set of strands into a single ordered rope and feeds
//! the rope to an analysis.
//!
//! Three kinds of threads meet here: producers push into their strands
//! through [`StrandTail`]s, the weaving thread moves records from the strands
//! into the rope, and the analysis thread runs the client's analysis on the
//! rope. Lifecycle requests (start, stop, dispose) come from any thread and
//! only set the target state; the weaving thread carries them out on its next
//! wake-up.
//!
//! Lifecycle events are fired after the state has changed, on the thread that
//! changed it, and before the requesting method returns. Transitions are
//! serialized, so listeners see them in order. A listener must not call
//! lifecycle methods of the same splicer.

pub mod config;
pub mod dispatch;

use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel as channel;
use itertools::Itertools;
use log::{debug, error, info, warn};
use serde::Serialize;

use self::dispatch::{Analysis, Message, RopeStats};
use crate::engine::error::{DynResult, Error, Result};
use crate::engine::events::Listeners;
use crate::engine::signal::WeaveSignal;
use crate::engine::{Record, SplicerEvent, SplicerState};
use crate::strands::{Strand, StrandId, StrandRegistry, StrandStats, StrandTail};
use crate::weaving::{Progress, Weaver, WeaverKind};

pub use self::config::SplicerConfig;

type StateChange = (SplicerState, SplicerState);

#[derive(Debug, Clone)]
enum StopMode<R> {
    Frayed,
    Clean(R),
}

/// Parameters of the current run.
#[derive(Debug)]
struct Run<R> {
    start_cutoff: Option<R>,
    beginning: Option<R>,
    resume_floor: Option<R>,
    stop: Option<StopMode<R>>,
    idle_ticks: u32,
}

impl<R> Run<R> {
    fn idle() -> Self {
        Self {
            start_cutoff: None,
            beginning: None,
            resume_floor: None,
            stop: None,
            idle_ticks: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SplicerStats {
    pub state: SplicerState,
    pub weaver: &'static str,
    pub woven: u64,
    pub defects: u64,
    pub strands: Vec<(StrandId, StrandStats)>,
    pub rope: RopeStats,
}

struct Control<R: Record> {
    state: SplicerState,
    strands: Vec<Strand<R>>,
    next_id: usize,
    weaver: Box<dyn Weaver<R>>,
    run: Run<R>,
    last_woven: Option<R>,
    woven: u64,
    defects: u64,
    last_progress: Instant,
    stall_reported: bool,
    shutdown: bool,
}

impl<R: Record> Control<R> {
    fn transition(&mut self, next: SplicerState, changes: &mut Vec<StateChange>) -> Result<()> {
        let old = self.state;
        self.state = old.transition(next)?;
        debug!("splicer state {old:?} -> {next:?}");
        changes.push((old, next));
        Ok(())
    }

    fn begin_run(&mut self, cutoff: Option<R>, changes: &mut Vec<StateChange>) -> Result<()> {
        self.transition(SplicerState::Starting, changes)?;
        self.run = Run {
            start_cutoff: cutoff,
            resume_floor: self.last_woven.clone(),
            ..Run::idle()
        };
        for strand in &self.strands {
            strand.rewind();
        }
        self.weaver.begin(&self.strands);
        self.last_progress = Instant::now();
        self.stall_reported = false;
        info!(
            "starting the {} weaver over {} strands",
            self.weaver.name(),
            self.strands.len()
        );
        Ok(())
    }

    fn request_stop(&mut self, mode: StopMode<R>, changes: &mut Vec<StateChange>) -> Result<()> {
        // A failed run has nothing left to weave.
        let mode = if self.state == SplicerState::Failed {
            StopMode::Frayed
        } else {
            mode
        };
        self.transition(SplicerState::Stopping, changes)?;
        self.run.stop = Some(mode);
        Ok(())
    }

    fn prune_disposable(&mut self) {
        self.strands.retain(|strand| {
            let disposable = strand.is_disposable();
            if disposable {
                debug!("forgetting {}", strand.id());
            }
            !disposable
        });
    }

    fn apply_floors(&self) {
        if let Some(floor) = &self.run.resume_floor {
            for strand in &self.strands {
                let dropped = strand.discard_below(floor);
                if dropped > 0 {
                    warn!(
                        "dropped {dropped} records of {} lower than the last woven record {floor:?}",
                        strand.id()
                    );
                }
            }
        }
        if let Some(beginning) = &self.run.beginning {
            for strand in &self.strands {
                let dropped = strand.discard_below(beginning);
                if dropped > 0 {
                    debug!(
                        "dropped {dropped} records of {} before the beginning {beginning:?}",
                        strand.id()
                    );
                }
            }
        }
    }

    /// Waits for every strand to show a record (or for the weaver to give up
    /// on the silent ones) and fixes the beginning of a clean start. Returns
    /// whether weaving may proceed.
    fn settle_beginning(&mut self, tick: bool) -> bool {
        if tick {
            self.run.idle_ticks = self.run.idle_ticks.saturating_add(1);
        }
        self.apply_floors();
        let ready = self
            .strands
            .iter()
            .all(|strand| !strand.is_empty() || strand.is_ended());
        let tolerated = self
            .weaver
            .idle_tolerance()
            .is_some_and(|max_idle_ticks| self.run.idle_ticks >= max_idle_ticks);
        if !ready && !tolerated {
            return false;
        }

        if let Some(cutoff) = self.run.start_cutoff.take() {
            // The lowest point every strand with data can agree on.
            let lower_bound = self.strands.iter().filter_map(Strand::head).max();
            let beginning = match lower_bound {
                Some(bound) => bound.max(cutoff),
                None => cutoff,
            };
            info!("clean start at {beginning:?}");
            self.run.beginning = Some(beginning);
            self.apply_floors();
        }
        true
    }

    fn try_start(&mut self, tick: bool, changes: &mut Vec<StateChange>) {
        if !self.settle_beginning(tick) {
            return;
        }
        if let Err(err) = self.transition(SplicerState::Started, changes) {
            error!("couldn't start weaving: {err}");
        }
    }

    fn finish_run(&mut self, changes: &mut Vec<StateChange>) {
        if self.state == SplicerState::Started {
            if let Err(err) = self.transition(SplicerState::Stopping, changes) {
                error!("couldn't stop weaving: {err}");
                return;
            }
        }
        if let Err(err) = self.transition(SplicerState::Stopped, changes) {
            error!("couldn't stop weaving: {err}");
            return;
        }
        self.close_run();
        info!(
            "splicer stopped, {} records woven so far, last one {:?}",
            self.woven, self.last_woven
        );
    }

    fn fail(&mut self, changes: &mut Vec<StateChange>) {
        if let Err(err) = self.transition(SplicerState::Failed, changes) {
            error!("couldn't mark the splicer as failed: {err}");
            return;
        }
        self.close_run();
    }

    fn close_run(&mut self) {
        self.weaver.end();
        for strand in &self.strands {
            strand.release_sentinel();
        }
        self.prune_disposable();
        self.run = Run::idle();
    }

    fn check_batch(&self, batch: &[R]) -> Result<()> {
        if let Some(position) = batch
            .iter()
            .tuple_windows()
            .position(|(previous, next)| next < previous)
        {
            return Err(Error::UnorderedBatch {
                position: position + 1,
            });
        }
        match (&self.last_woven, batch.first()) {
            (Some(last), Some(first)) if first < last => Err(Error::out_of_order(last, first)),
            _ => Ok(()),
        }
    }

    fn check_stall(&mut self, stall_warning: Duration) {
        if self.stall_reported || self.last_progress.elapsed() < stall_warning {
            return;
        }
        self.stall_reported = true;
        match self.weaver.stalled_strand(&self.strands) {
            Some(id) => {
                let head = self
                    .strands
                    .iter()
                    .find(|strand| strand.id() == id)
                    .and_then(Strand::head);
                warn!(
                    "no progress for {:?} in state {:?}, waiting for {id} (head {head:?})",
                    self.last_progress.elapsed(),
                    self.state
                );
            }
            None => warn!(
                "no progress for {:?} in state {:?}",
                self.last_progress.elapsed(),
                self.state
            ),
        }
    }

    fn cycle(
        &mut self,
        tick: bool,
        config: &SplicerConfig,
        sender: &channel::Sender<Message<R>>,
        changes: &mut Vec<StateChange>,
    ) {
        self.prune_disposable();
        if !self.state.is_running() {
            return;
        }
        if tick {
            self.weaver.on_tick();
        }
        if self.state == SplicerState::Starting {
            self.try_start(tick, changes);
            if self.state == SplicerState::Starting {
                self.check_stall(config.stall_warning);
                return;
            }
        }

        let limit = match self.run.stop.clone() {
            Some(StopMode::Frayed) => {
                self.finish_run(changes);
                return;
            }
            Some(StopMode::Clean(cutoff)) => Some(cutoff.clone()),
            None => None,
        };
        // Stopped before it ever started: the clean start still holds.
        if self.run.start_cutoff.is_some() && !self.settle_beginning(tick) {
            self.check_stall(config.stall_warning);
            return;
        }

        self.apply_floors();
        let mut batch = Vec::new();
        let progress = self
            .weaver
            .weave(&self.strands, limit.as_ref(), &mut batch);

        if !batch.is_empty() {
            if let Err(defect) = self.check_batch(&batch) {
                self.defects += 1;
                error!(
                    "the {} weaver produced a bad batch of {} records, withholding it: {defect}",
                    self.weaver.name(),
                    batch.len()
                );
                self.fail(changes);
                return;
            }
            self.woven += batch.len() as u64;
            self.last_woven = batch.last().cloned();
            self.last_progress = Instant::now();
            self.stall_reported = false;
            if sender.send(Message::Extend(batch)).is_err() {
                debug!("analysis thread is gone, dropping woven records");
            }
        }

        let retained = limit
            .as_ref()
            .is_some_and(|cutoff| self.weaver.retains_beyond(&self.strands, cutoff));
        if retained || progress == Progress::Exhausted {
            self.finish_run(changes);
        } else if progress == Progress::Idle {
            self.check_stall(config.stall_warning);
        }
    }
}

struct Shared<R: Record> {
    control: Mutex<Control<R>>,
    state_changed: Condvar,
    // Serializes transitions together with the events they fire.
    lifecycle: Mutex<()>,
    signal: Arc<WeaveSignal>,
    listeners: Listeners<R>,
    sender: channel::Sender<Message<R>>,
    rope_stats: Arc<ArcSwap<RopeStats>>,
    config: SplicerConfig,
}

impl<R: Record> Shared<R> {
    fn control(&self) -> MutexGuard<'_, Control<R>> {
        self.control.lock().unwrap()
    }

    fn with_lifecycle<T>(
        &self,
        logic: impl FnOnce(&mut Control<R>, &mut Vec<StateChange>) -> Result<T>,
    ) -> Result<T> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        let mut changes = Vec::new();
        let result = logic(&mut self.control(), &mut changes);
        self.announce(&changes);
        result
    }

    fn announce(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        self.listeners.fire_state_changes(changes);
        self.state_changed.notify_all();
        self.signal.notify();
    }

    /// One pass of the weaving thread. Returns `false` once the thread should exit.
    fn cycle(&self, tick: bool) -> bool {
        let _lifecycle = self.lifecycle.lock().unwrap();
        let mut changes = Vec::new();
        let keep_running = {
            let mut control = self.control();
            if control.shutdown || control.state == SplicerState::Disposed {
                false
            } else {
                control.cycle(tick, &self.config, &self.sender, &mut changes);
                true
            }
        };
        self.announce(&changes);
        keep_running
    }
}

impl<R: Record> StrandRegistry for Shared<R> {
    fn strand_closed(&self, id: StrandId) {
        match self.control.try_lock() {
            Ok(mut control) if !control.state.is_running() => control
                .strands
                .retain(|strand| strand.id() != id || !strand.is_disposable()),
            // Weaving is in progress, the next cycle forgets the strand.
            Ok(_) | Err(TryLockError::WouldBlock | TryLockError::Poisoned(_)) => {}
        }
        self.signal.notify();
    }
}

fn weaving_loop<R: Record>(shared: &Shared<R>) {
    let poll_interval = shared.config.poll_interval;
    let mut last_tick = Instant::now();
    loop {
        shared.signal.wait_timeout(poll_interval);
        let tick = last_tick.elapsed() >= poll_interval;
        if tick {
            last_tick = Instant::now();
        }
        if !shared.cycle(tick) {
            break;
        }
    }
    debug!("weaving thread finished");
}

/// A cloneable handle to a running splicer.
pub struct SplicerHandle<R: Record> {
    shared: Arc<Shared<R>>,
}

impl<R: Record> Clone for SplicerHandle<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Record> SplicerHandle<R> {
    pub(crate) fn listeners(&self) -> &Listeners<R> {
        &self.shared.listeners
    }

    /// Registers a new strand. Only possible while the splicer is stopped.
    pub fn begin_strand(&self) -> Result<StrandTail<R>> {
        let mut control = self.shared.control();
        if control.state != SplicerState::Stopped {
            return Err(Error::RegistrationClosed(control.state));
        }
        let strand = Strand::new(StrandId(control.next_id));
        control.next_id += 1;
        control.strands.push(strand.clone());
        debug!("registered {}", strand.id());

        let registry = Arc::downgrade(&self.shared);
        let registry: Weak<dyn StrandRegistry> = registry;
        Ok(StrandTail::new(
            strand,
            Arc::clone(&self.shared.signal),
            registry,
        ))
    }

    /// Frayed start: weaving begins as soon as every open strand has shown a record.
    pub fn start(&self) -> Result<()> {
        self.shared
            .with_lifecycle(|control, changes| control.begin_run(None, changes))
    }

    /// Clean start: nothing lower than the greater of `cutoff` and the point
    /// all strands agree on is woven.
    pub fn start_at(&self, cutoff: R) -> Result<()> {
        if cutoff.is_last() {
            return Err(Error::SentinelCutoff);
        }
        self.shared
            .with_lifecycle(|control, changes| control.begin_run(Some(cutoff), changes))
    }

    /// Frayed stop: weaving ends on the next wake-up of the weaving thread.
    pub fn stop(&self) -> Result<()> {
        self.shared.with_lifecycle(|control, changes| {
            control.request_stop(StopMode::Frayed, changes)
        })
    }

    /// Clean stop: everything up to `cutoff` is woven and every strand keeps
    /// what comes after it.
    pub fn stop_at(&self, cutoff: R) -> Result<()> {
        if cutoff.is_last() {
            return Err(Error::SentinelCutoff);
        }
        self.shared.with_lifecycle(|control, changes| {
            if let Some(last) = &control.last_woven {
                if *last > cutoff {
                    return Err(Error::cutoff_passed(&cutoff, last));
                }
            }
            control.request_stop(StopMode::Clean(cutoff), changes)
        })
    }

    /// Stops from any state, turning a pending clean stop into a frayed one.
    pub fn force_stop(&self) -> Result<()> {
        self.shared
            .with_lifecycle(|control, changes| match control.state {
                SplicerState::Stopped | SplicerState::Disposed => Ok(()),
                SplicerState::Stopping => {
                    control.run.stop = Some(StopMode::Frayed);
                    Ok(())
                }
                _ => control.request_stop(StopMode::Frayed, changes),
            })?;
        self.shared.signal.notify();
        Ok(())
    }

    /// Closes every strand and ends the weaving thread. Terminal.
    pub fn dispose(&self) -> Result<()> {
        self.shared.with_lifecycle(|control, changes| {
            control.transition(SplicerState::Disposed, changes)?;
            for strand in control.strands.drain(..) {
                strand.close();
            }
            Ok(())
        })?;
        self.shared.sender.send(Message::Shutdown).unwrap_or(());
        Ok(())
    }

    /// Removes from the rope every record lower than `cutoff`, everything for
    /// the end-of-data marker. When called from the analysis, it takes
    /// effect after the analysis returns.
    pub fn truncate(&self, cutoff: R) -> Result<()> {
        self.shared
            .sender
            .send(Message::Truncate(cutoff))
            .map_err(|_| Error::ShutDown)
    }

    /// Runs the analysis on everything woven so far and waits for it to finish.
    ///
    /// Calling this from the analysis itself deadlocks.
    pub fn analyze(&self) -> Result<()> {
        let (ack_sender, ack_receiver) = channel::bounded(1);
        self.shared
            .sender
            .send(Message::Flush(ack_sender))
            .map_err(|_| Error::ShutDown)?;
        ack_receiver.recv().map_err(|_| Error::ShutDown)
    }

    /// A copy of the visible rope. Same restriction as [`Self::analyze`].
    pub fn rope(&self) -> Result<Vec<R>> {
        let (reply_sender, reply_receiver) = channel::bounded(1);
        self.shared
            .sender
            .send(Message::Snapshot(reply_sender))
            .map_err(|_| Error::ShutDown)?;
        reply_receiver.recv().map_err(|_| Error::ShutDown)
    }

    pub fn state(&self) -> SplicerState {
        self.shared.control().state
    }

    /// Waits until the splicer reaches `target`; `false` on timeout.
    pub fn wait_for_state(&self, target: SplicerState, timeout: Duration) -> bool {
        let control = self.shared.control();
        let (control, _) = self
            .shared
            .state_changed
            .wait_timeout_while(control, timeout, |control| control.state != target)
            .unwrap();
        control.state == target
    }

    pub fn strand_count(&self) -> usize {
        self.shared.control().strands.len()
    }

    /// The strand weaving is currently waiting for, if any.
    pub fn blocking_strand(&self) -> Option<StrandId> {
        let control = self.shared.control();
        control.weaver.stalled_strand(&control.strands)
    }

    pub fn add_listener(&self, listener: impl Fn(&SplicerEvent<'_, R>) + Send + Sync + 'static) {
        self.shared.listeners.add(Arc::new(listener));
    }

    pub fn stats(&self) -> SplicerStats {
        let control = self.shared.control();
        SplicerStats {
            state: control.state,
            weaver: control.weaver.name(),
            woven: control.woven,
            defects: control.defects,
            strands: control
                .strands
                .iter()
                .map(|strand| (strand.id(), strand.stats()))
                .collect(),
            rope: **self.shared.rope_stats.load(),
        }
    }
}

/// Owns the threads of a splicer; dropping it shuts them down.
pub struct Splicer<R: Record> {
    handle: SplicerHandle<R>,
    weaving_thread: Option<JoinHandle<()>>,
    analysis_thread: Option<JoinHandle<()>>,
}

impl<R: Record> Splicer<R> {
    pub fn new(
        config: SplicerConfig,
        weaver: WeaverKind,
        analysis: impl FnMut(&[R], usize, &SplicerHandle<R>) -> DynResult<()> + Send + 'static,
    ) -> Self {
        let weaver = weaver.build(config.node_capacity);
        Self::with_weaver(config, weaver, analysis)
    }

    pub fn with_weaver(
        config: SplicerConfig,
        weaver: Box<dyn Weaver<R>>,
        analysis: impl FnMut(&[R], usize, &SplicerHandle<R>) -> DynResult<()> + Send + 'static,
    ) -> Self {
        let (sender, receiver) = channel::unbounded();
        let rope_stats = Arc::new(ArcSwap::from_pointee(RopeStats::default()));
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                state: SplicerState::Stopped,
                strands: Vec::new(),
                next_id: 0,
                weaver,
                run: Run::idle(),
                last_woven: None,
                woven: 0,
                defects: 0,
                last_progress: Instant::now(),
                stall_reported: false,
                shutdown: false,
            }),
            state_changed: Condvar::new(),
            lifecycle: Mutex::new(()),
            signal: Arc::new(WeaveSignal::new()),
            listeners: Listeners::new(),
            sender,
            rope_stats: Arc::clone(&rope_stats),
            config,
        });
        let handle = SplicerHandle { shared };

        let analysis: Analysis<R> = Box::new(analysis);
        let analysis_thread = dispatch::spawn(receiver, analysis, handle.clone(), rope_stats);
        let weaving_thread = {
            let shared = Arc::clone(&handle.shared);
            thread::Builder::new()
                .name("splicer:weaver".to_owned())
                .spawn(move || weaving_loop(&shared))
                .expect("weaving thread creation failed")
        };

        Self {
            handle,
            weaving_thread: Some(weaving_thread),
            analysis_thread: Some(analysis_thread),
        }
    }

    pub fn handle(&self) -> SplicerHandle<R> {
        self.handle.clone()
    }
}

impl<R: Record> Deref for Splicer<R> {
    type Target = SplicerHandle<R>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<R: Record> Drop for Splicer<R> {
    fn drop(&mut self) {
        self.handle.shared.control().shutdown = true;
        self.handle.shared.signal.notify();
        self.handle
            .shared
            .sender
            .send(Message::Shutdown)
            .unwrap_or(());
        for (name, thread) in [
            ("weaving", self.weaving_thread.take()),
            ("analysis", self.analysis_thread.take()),
        ] {
            if let Some(Err(payload)) = thread.map(JoinHandle::join) {
                error!(
                    "splicer {name} thread failed: {}",
                    Error::from_panic_payload(payload)
                );
            }
        }
    }
}
