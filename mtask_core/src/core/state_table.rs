//! Circular, time-indexed buffer of per-cycle component state.
//!
//! One writer (the owning component's thread) and any number of readers.
//! Each row is tagged with the tick that produced it. A reader captures a
//! [`StateIndex`] first, reads, then re-validates the index: if the writer has
//! wrapped around onto that row in the meantime the read is reported as stale
//! and must be retried or discarded.

use crate::core::payload::{Payload, TypeTag};
use crate::error::{MtaskError, MtaskResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Default number of rows (history length)
pub const DEFAULT_STATE_TABLE_CAPACITY: usize = 256;

pub const TIC_COLUMN: &str = "Tic";
pub const TOC_COLUMN: &str = "Toc";
pub const PERIOD_COLUMN: &str = "Period";

/// Marks a row that is being overwritten
const WRITING: u64 = u64::MAX;

/// Position of one committed row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIndex {
    tick: u64,
    slot: usize,
    capacity: usize,
}

impl StateIndex {
    fn new(tick: u64, capacity: usize) -> Self {
        Self {
            tick,
            slot: (tick % capacity as u64) as usize,
            capacity,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index `k` rows back in history, if `k < capacity` and the tick exists.
    pub fn previous(&self, k: usize) -> Option<StateIndex> {
        if k >= self.capacity || (k as u64) > self.tick {
            return None;
        }
        Some(StateIndex::new(self.tick - k as u64, self.capacity))
    }
}

trait Column: Send + Sync {
    fn name(&self) -> &str;
    fn type_tag(&self) -> TypeTag;
    fn commit(&self, slot: usize);
}

#[derive(Clone)]
struct ColumnEntry {
    column: Arc<dyn Column>,
    typed: Arc<dyn Any + Send + Sync>,
}

impl ColumnEntry {
    fn new<T: Payload>(column: Arc<TypedColumn<T>>) -> Self {
        Self {
            column: column.clone(),
            typed: column,
        }
    }
}

struct TypedColumn<T> {
    name: String,
    working: Mutex<T>,
    rows: Vec<RwLock<T>>,
}

impl<T: Payload> TypedColumn<T> {
    fn new(name: &str, initial: T, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            working: Mutex::new(initial.clone()),
            rows: (0..capacity).map(|_| RwLock::new(initial.clone())).collect(),
        }
    }
}

impl<T: Payload> Column for TypedColumn<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn commit(&self, slot: usize) {
        let value = self.working.lock().clone();
        *self.rows[slot].write() = value;
    }
}

#[derive(Default)]
struct Timing {
    last_tic: Option<f64>,
    recent_tics: Vec<f64>,
    average_period: f64,
}

struct TableInner {
    name: String,
    capacity: usize,
    origin: Instant,
    /// Tick committed in each row, or `WRITING`
    ticks: Vec<AtomicU64>,
    /// Number of committed rows so far
    committed: AtomicU64,
    columns: RwLock<Vec<ColumnEntry>>,
    timing: Mutex<Timing>,
    automatic_advance: AtomicBool,
    delay: AtomicUsize,
}

impl TableInner {
    fn latest(&self) -> Option<StateIndex> {
        let committed = self.committed.load(Ordering::Acquire);
        if committed == 0 {
            None
        } else {
            Some(StateIndex::new(committed - 1, self.capacity))
        }
    }

    fn is_valid(&self, index: &StateIndex) -> bool {
        if index.capacity != self.capacity {
            return false;
        }
        let Some(latest) = self.latest() else {
            return false;
        };
        index.tick <= latest.tick
            && latest.tick - index.tick < self.capacity as u64
            && self.ticks[index.slot].load(Ordering::Acquire) == index.tick
    }

    fn column<T: Payload>(&self, name: &str) -> MtaskResult<Arc<TypedColumn<T>>> {
        let columns = self.columns.read();
        let entry = columns
            .iter()
            .find(|e| e.column.name() == name)
            .ok_or_else(|| {
                MtaskError::not_found(format!("state data '{}' in table '{}'", name, self.name))
            })?;
        let tag = entry.column.type_tag();
        entry
            .typed
            .clone()
            .downcast::<TypedColumn<T>>()
            .map_err(|_| {
                MtaskError::invalid_input(format!(
                    "state data '{}' holds {} not {}",
                    name,
                    tag,
                    TypeTag::of::<T>()
                ))
            })
    }
}

/// Writer side, owned by the component.
pub struct StateTable {
    inner: Arc<TableInner>,
    tic: StateData<f64>,
    toc: StateData<f64>,
    period: StateData<f64>,
}

impl StateTable {
    pub fn new<S: Into<String>>(name: S, capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let inner = Arc::new(TableInner {
            name: name.into(),
            capacity,
            origin: Instant::now(),
            ticks: (0..capacity).map(|_| AtomicU64::new(WRITING)).collect(),
            committed: AtomicU64::new(0),
            columns: RwLock::new(Vec::new()),
            timing: Mutex::new(Timing::default()),
            automatic_advance: AtomicBool::new(true),
            delay: AtomicUsize::new(0),
        });
        let builtin = |name: &str| {
            let column: Arc<TypedColumn<f64>> = Arc::new(TypedColumn::new(name, 0.0, capacity));
            inner.columns.write().push(ColumnEntry::new(column.clone()));
            StateData { column }
        };
        let tic = builtin(TIC_COLUMN);
        let toc = builtin(TOC_COLUMN);
        let period = builtin(PERIOD_COLUMN);
        Self {
            inner,
            tic,
            toc,
            period,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Register a named column. Names are unique within the table.
    pub fn add_data<T: Payload>(&self, name: &str, initial: T) -> MtaskResult<StateData<T>> {
        let mut columns = self.inner.columns.write();
        if columns.iter().any(|e| e.column.name() == name) {
            log::warn!(
                "state table '{}': data '{}' already exists",
                self.inner.name,
                name
            );
            return Err(MtaskError::already_exists(format!(
                "state data '{}' in table '{}'",
                name, self.inner.name
            )));
        }
        let column = Arc::new(TypedColumn::new(name, initial, self.inner.capacity));
        columns.push(ColumnEntry::new(column.clone()));
        Ok(StateData { column })
    }

    /// Writer handle to an existing column
    pub fn data<T: Payload>(&self, name: &str) -> MtaskResult<StateData<T>> {
        Ok(StateData {
            column: self.inner.column::<T>(name)?,
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.inner
            .columns
            .read()
            .iter()
            .map(|e| e.column.name().to_string())
            .collect()
    }

    /// Start of cycle: records `Tic` and `Period`.
    pub fn start(&self) {
        let tic = self.inner.origin.elapsed().as_secs_f64();
        let mut timing = self.inner.timing.lock();
        let period = timing.last_tic.map(|last| tic - last).unwrap_or(0.0);
        timing.last_tic = Some(tic);
        timing.recent_tics.push(tic);
        if timing.recent_tics.len() > self.inner.capacity {
            timing.recent_tics.remove(0);
        }
        if timing.recent_tics.len() > 1 {
            let first = timing.recent_tics[0];
            timing.average_period = (tic - first) / (timing.recent_tics.len() - 1) as f64;
        }
        drop(timing);
        self.tic.set(tic);
        self.period.set(period);
    }

    /// Commit the working values of every column as the next row.
    pub fn advance(&self) -> StateIndex {
        let toc = self.inner.origin.elapsed().as_secs_f64();
        self.toc.set(toc);

        let tick = self.inner.committed.load(Ordering::Acquire);
        let index = StateIndex::new(tick, self.inner.capacity);
        let row = &self.inner.ticks[index.slot];
        row.store(WRITING, Ordering::Release);
        for entry in self.inner.columns.read().iter() {
            entry.column.commit(index.slot);
        }
        row.store(tick, Ordering::Release);
        self.inner.committed.store(tick + 1, Ordering::Release);
        index
    }

    /// Whether the run loop should call [`StateTable::advance`] after each cycle
    pub fn automatic_advance(&self) -> bool {
        self.inner.automatic_advance.load(Ordering::Relaxed)
    }

    pub fn set_automatic_advance(&self, automatic: bool) {
        self.inner
            .automatic_advance
            .store(automatic, Ordering::Relaxed);
    }

    /// Rows between the latest row and the one returned by `index_delayed`
    pub fn set_delay(&self, delay: usize) -> MtaskResult<()> {
        if delay >= self.inner.capacity {
            return Err(MtaskError::invalid_input(format!(
                "delay {} must be less than table capacity {}",
                delay, self.inner.capacity
            )));
        }
        self.inner.delay.store(delay, Ordering::Relaxed);
        Ok(())
    }

    /// Mean period over the rows still held in the table, in seconds
    pub fn average_period(&self) -> f64 {
        self.inner.timing.lock().average_period
    }

    pub fn reader(&self) -> StateTableReader {
        StateTableReader {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for StateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTable")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("committed", &self.inner.committed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Working value of one column, written by the owner during a cycle.
pub struct StateData<T> {
    column: Arc<TypedColumn<T>>,
}

impl<T: Payload> StateData<T> {
    pub fn name(&self) -> &str {
        &self.column.name
    }

    pub fn set(&self, value: T) {
        *self.column.working.lock() = value;
    }

    pub fn update<F: FnOnce(&mut T)>(&self, f: F) {
        f(&mut self.column.working.lock());
    }

    pub fn get(&self) -> T {
        self.column.working.lock().clone()
    }
}

impl<T> Clone for StateData<T> {
    fn clone(&self) -> Self {
        Self {
            column: self.column.clone(),
        }
    }
}

impl<T> std::fmt::Debug for StateData<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateData")
            .field("name", &self.column.name)
            .finish()
    }
}

/// Read side, cloneable and shareable across threads.
#[derive(Clone)]
pub struct StateTableReader {
    inner: Arc<TableInner>,
}

impl StateTableReader {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Index of the most recently committed row
    pub fn index_reader(&self) -> Option<StateIndex> {
        self.inner.latest()
    }

    /// Index of the row `delay` ticks behind the latest one
    pub fn index_delayed(&self) -> Option<StateIndex> {
        let delay = self.inner.delay.load(Ordering::Relaxed);
        self.inner.latest()?.previous(delay)
    }

    /// Number of rows committed since creation
    pub fn tick(&self) -> u64 {
        self.inner.committed.load(Ordering::Acquire)
    }

    /// False once the writer has wrapped around onto (or is writing) the row
    pub fn is_valid(&self, index: &StateIndex) -> bool {
        self.inner.is_valid(index)
    }

    pub fn average_period(&self) -> f64 {
        self.inner.timing.lock().average_period
    }

    /// Resolve a column once; the accessor reads it by index without lookups.
    pub fn accessor<T: Payload>(&self, name: &str) -> MtaskResult<StateAccessor<T>> {
        Ok(StateAccessor {
            inner: self.inner.clone(),
            column: self.inner.column::<T>(name)?,
        })
    }
}

impl std::fmt::Debug for StateTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTableReader")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl<T> std::fmt::Debug for StateAccessor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateAccessor")
            .field("name", &self.column.name)
            .finish()
    }
}

/// Typed read access to one column.
#[derive(Clone)]
pub struct StateAccessor<T> {
    inner: Arc<TableInner>,
    column: Arc<TypedColumn<T>>,
}

impl<T: Payload> StateAccessor<T> {
    pub fn name(&self) -> &str {
        &self.column.name
    }

    /// Value at `index`, or `None` if the row was overwritten while reading.
    pub fn get(&self, index: &StateIndex) -> Option<T> {
        if !self.inner.is_valid(index) {
            return None;
        }
        let value = self.column.rows[index.slot].read().clone();
        if self.inner.is_valid(index) {
            Some(value)
        } else {
            None
        }
    }

    pub fn get_latest(&self) -> Option<(StateIndex, T)> {
        let index = self.inner.latest()?;
        self.get(&index).map(|value| (index, value))
    }

    pub fn get_delayed(&self) -> Option<(StateIndex, T)> {
        let delay = self.inner.delay.load(Ordering::Relaxed);
        let index = self.inner.latest()?.previous(delay)?;
        self.get(&index).map(|value| (index, value))
    }

    /// `count` consecutive rows ending at `newest`, oldest first.
    ///
    /// Returns `None` when any requested row is no longer held by the table.
    pub fn history(&self, newest: &StateIndex, count: usize) -> Option<Vec<(u64, T)>> {
        if count == 0 {
            return Some(Vec::new());
        }
        let mut rows = Vec::with_capacity(count);
        for k in (0..count).rev() {
            let index = newest.previous(k)?;
            rows.push((index.tick, self.get(&index)?));
        }
        Some(rows)
    }
}
