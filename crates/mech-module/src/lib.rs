//! User module registry (spec §6.3): a trait-object callback table in
//! place of the reference's dynamic-library loader. Every callback is
//! optional — a module overrides only what it needs and inherits the
//! built-in default (usually a no-op, sometimes a real default behavior
//! like row-major `TaskBoardMap`) for the rest, the same "one host, one
//! extension point" shape `core-plugin`'s `PluginHost` generalizes here to
//! the full hook table (spec §9 "Dynamic callback dispatch").

use mech_types::{BoardCell, NodeId, Pool, RunContext, Schema, Task};

/// A user module's `TaskProcess` (or any other callback) failure status,
/// in `[801, 888]` (spec §7 "User module"). The core propagates the inner
/// code unchanged to `MechError::Module` / the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleError(pub i32);

/// Fills `{options, pools, banks_per_pool, banks_per_task, attr_per_dataset,
/// min_cpu_required}` once, after load (spec §6.3 `Init`).
#[derive(Debug, Clone, Default)]
pub struct InitSpec {
    pub options: Vec<String>,
    pub pools: usize,
    pub banks_per_pool: usize,
    pub banks_per_task: usize,
    pub attr_per_dataset: usize,
    pub min_cpu_required: i32,
}

/// An ordered name -> value table (spec §9 "Generic collections": small,
/// insertion-ordered, unique keys, linear lookup is enough).
#[derive(Debug, Clone, Default)]
pub struct OptionTable {
    entries: Vec<(String, String)>,
}

impl OptionTable {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value.into();
        } else {
            self.entries.push((name, value.into()));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Populates the known option table once, after `Init` (spec §6.3 `Setup`).
#[derive(Debug, Clone, Default)]
pub struct SetupSpec {
    pub known_options: OptionTable,
}

/// Every pool declared so far, keyed by `pid` (threaded through the
/// per-stage callbacks as `pools` in spec §6.3's table).
#[derive(Debug, Clone, Default)]
pub struct PoolSet {
    pools: Vec<Pool>,
}

impl PoolSet {
    pub fn push(&mut self, pool: Pool) {
        self.pools.push(pool);
    }

    pub fn get(&self, pid: u32) -> Option<&Pool> {
        self.pools.iter().find(|p| p.pid == pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut Pool> {
        self.pools.iter_mut().find(|p| p.pid == pid)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pool> {
        self.pools.iter()
    }
}

/// The full callback table a user module may implement (spec §6.3). Every
/// method defaults to a no-op or, where the spec names one, a real built-in
/// default — so a module overrides only what it needs.
pub trait UserModule: Send + Sync {
    fn init(&self, _init: &mut InitSpec) {}
    fn setup(&self, _setup: &mut SetupSpec) {}
    fn storage(&self, _pool: &mut Pool) {}
    fn prepare(&self, _node: NodeId, _fname: &str) {}
    fn node_prepare(&self, _ctx: &RunContext, _pools: &PoolSet, _p: &Pool) {}
    fn node_process(&self, _ctx: &RunContext, _pools: &PoolSet, _p: &Pool) {}
    fn loop_prepare(&self, _ctx: &RunContext, _pools: &PoolSet, _p: &Pool) {}
    fn loop_process(&self, _ctx: &RunContext, _pools: &PoolSet, _p: &Pool) {}
    fn pool_prepare(&self, _pools: &PoolSet, _p: &mut Pool) {}
    fn pool_process(&self, _pools: &PoolSet, _p: &mut Pool) -> mech_types::PoolAction {
        mech_types::PoolAction::Finalize
    }
    fn board_prepare(&self, _pools: &PoolSet, _p: &Pool, _t: &Task) -> BoardCell {
        BoardCell::Enabled
    }
    /// Default: row-major (spec §3 "default: row-major").
    fn task_board_map(&self, p: &Pool, t: &mut Task) {
        t.location = Task::row_major_location(t.tid, p.board_dims);
    }
    fn task_prepare(&self, _p: &Pool, _t: &mut Task) {}
    fn task_process(&self, _p: &Pool, _t: &mut Task) -> Result<(), ModuleError> {
        Ok(())
    }
    fn dataset_prepare(&self, _p: &Pool, _schema: &Schema) {}
    fn dataset_process(&self, _p: &Pool, _schema: &Schema) {}
}

/// The built-in fallback module: every callback is the trait default.
/// Mirrors `core-plugin`'s `NoopPluginHost`.
#[derive(Default)]
pub struct NoopModule;

impl UserModule for NoopModule {}

/// Holds the loaded module's identity (recorded as `@MODULE` in the
/// archive for restart validation, spec §4.3) alongside the boxed
/// callback table.
pub struct ModuleRegistry {
    pub name: String,
    pub module: Box<dyn UserModule>,
}

impl ModuleRegistry {
    pub fn new(name: impl Into<String>, module: Box<dyn UserModule>) -> Self {
        Self {
            name: name.into(),
            module,
        }
    }

    pub fn noop() -> Self {
        Self::new("core", Box::new(NoopModule))
    }
}
