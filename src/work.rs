//! The build driver: computes dirty state, holds the plan, schedules ready
//! edges onto the task runner, and feeds results back into the graph and the
//! logs.
//!
//! The driver itself is single-threaded and cooperative: it alternates
//! between a non-blocking launch phase and a wait on the task runner's
//! completion channel.  All graph and log mutation happens here, between one
//! edge finishing and the next scheduling decision, so there are no races to
//! think about.

use crate::{
    build_log,
    canon::canon_path,
    densemap::DenseMap,
    deps_log, dyndep,
    fs::{FileSystem, MTime},
    graph::{BuildId, DepsStyle, FileId, FileState, Graph},
    hash::{hash_command, BuildHash},
    jobserver,
    process::Termination,
    progress::Progress,
    signal,
    smallmap::SmallMap,
    task::{FinishedTask, Runner, TaskSpec},
    trace,
};
use anyhow::{anyhow, bail};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

pub struct Options {
    pub parallelism: usize,
    /// Failures tolerated before we stop launching; None means unlimited.
    pub failures_left: Option<usize>,
    /// Compute and report the plan without running anything.
    pub dry_run: bool,
}

/// Scheduling states a planned build moves through.  Builds not in the plan
/// have no state at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    /// In the plan, waiting on inputs produced by other planned builds.
    Want,
    /// All produced inputs are finished; can start any time.
    Ready,
    Running,
    /// Finished, or verified up to date and skipped.
    Done,
    Failed,
}

/// Counts of builds in each state, for progress display.
#[derive(Clone, Debug, Default)]
pub struct StateCounts([usize; 5]);

impl StateCounts {
    fn idx(state: BuildState) -> usize {
        match state {
            BuildState::Want => 0,
            BuildState::Ready => 1,
            BuildState::Running => 2,
            BuildState::Done => 3,
            BuildState::Failed => 4,
        }
    }

    pub fn get(&self, state: BuildState) -> usize {
        self.0[Self::idx(state)]
    }

    pub fn add(&mut self, state: BuildState, delta: isize) {
        let slot = &mut self.0[Self::idx(state)];
        *slot = slot.checked_add_signed(delta).unwrap();
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }
}

/// Dirty-scan visit state, for memoization and cycle detection.
#[derive(Clone, Copy, PartialEq, Default)]
enum Visit {
    #[default]
    None,
    InProgress,
    Done,
}

/// Why a build needs (or doesn't need) to run.
#[derive(Clone, Copy, PartialEq, Default)]
enum Dirtiness {
    #[default]
    Clean,
    /// The build's own outputs, command, or recorded deps are stale.
    Dirty,
    /// Clean by mtimes, but an input is being rebuilt; re-verified when the
    /// inputs are done, which is what makes restat skips cascade.
    Maybe,
}

/// A pool's live scheduling state.
struct PoolState {
    depth: usize,
    running: usize,
    /// Ready builds parked because the pool was full.
    queued: VecDeque<BuildId>,
}

/// Membership and readiness bookkeeping for the planned subgraph.
struct Plan {
    states: DenseMap<BuildId, Option<BuildState>>,
    counts: StateCounts,
    /// Per planned build: produced inputs not yet finished.
    pending_ins: DenseMap<BuildId, usize>,
    ready: VecDeque<BuildId>,
}

impl Plan {
    fn new() -> Self {
        Plan {
            states: DenseMap::new(),
            counts: StateCounts::default(),
            pending_ins: DenseMap::new(),
            ready: VecDeque::new(),
        }
    }

    fn state(&self, id: BuildId) -> Option<BuildState> {
        self.states.lookup_or(id, None)
    }

    fn set_state(&mut self, id: BuildId, state: BuildState) {
        if let Some(old) = self.state(id) {
            self.counts.add(old, -1);
        }
        self.counts.add(state, 1);
        self.states.set_grow(id, Some(state), None);
    }

    fn unfinished(&self) -> usize {
        self.counts.get(BuildState::Want)
            + self.counts.get(BuildState::Ready)
            + self.counts.get(BuildState::Running)
    }
}

enum StartOutcome {
    /// Handed to the task runner.
    Started,
    /// Finished without running: phony, or verified up to date.
    Finished,
    /// Put back or parked; try a different build.
    Deferred,
    /// No jobserver token available; stop launching for now.
    NoToken,
}

pub struct Work<'a> {
    graph: &'a mut Graph,
    build_log: &'a mut build_log::Writer,
    deps_log: &'a mut deps_log::Writer,
    fs: &'a dyn FileSystem,
    progress: &'a mut dyn Progress,
    options: &'a Options,

    file_state: FileState,
    /// Current command hash per build, memoized.
    hashes: DenseMap<BuildId, Option<BuildHash>>,
    visit: DenseMap<BuildId, Visit>,
    dirty: DenseMap<BuildId, Dirtiness>,
    plan: Plan,
    pools: SmallMap<String, PoolState>,
    /// Validation targets collected while planning, built alongside.
    pending_validations: Vec<FileId>,

    runner: Runner,
    jobserver: Option<jobserver::Client>,
    start_time: Instant,
    tasks_ran: usize,
    failures_left: Option<usize>,
    interrupted: bool,
}

impl<'a> Work<'a> {
    pub fn new(
        graph: &'a mut Graph,
        build_log: &'a mut build_log::Writer,
        deps_log: &'a mut deps_log::Writer,
        options: &'a Options,
        progress: &'a mut dyn Progress,
        pools: SmallMap<String, usize>,
        fs: &'a dyn FileSystem,
        jobserver: Option<jobserver::Client>,
    ) -> Self {
        let mut pool_states = SmallMap::default();
        // Depth 0 is the default pool: unbounded.
        pool_states.insert(
            String::new(),
            PoolState {
                depth: 0,
                running: 0,
                queued: VecDeque::new(),
            },
        );
        for (name, depth) in pools.into_iter() {
            pool_states.insert(
                name,
                PoolState {
                    depth,
                    running: 0,
                    queued: VecDeque::new(),
                },
            );
        }
        let file_state = FileState::new(graph);
        Work {
            graph,
            build_log,
            deps_log,
            fs,
            progress,
            options,
            file_state,
            hashes: DenseMap::new(),
            visit: DenseMap::new(),
            dirty: DenseMap::new(),
            plan: Plan::new(),
            pools: pool_states,
            pending_validations: Vec::new(),
            runner: Runner::new(options.parallelism),
            jobserver,
            start_time: Instant::now(),
            tasks_ran: 0,
            failures_left: options.failures_left,
            interrupted: false,
        }
    }

    /// If `name` is a file some build produces, its id.
    pub fn is_build_target(&self, name: &str) -> Option<FileId> {
        let name = canon_path(name);
        let id = self.graph.lookup_file_id(&name)?;
        self.graph.file(id).input.map(|_| id)
    }

    pub fn want_file(&mut self, name: &str) -> anyhow::Result<()> {
        let name = canon_path(name);
        match self.graph.lookup_file_id(&name) {
            Some(id) => self.want_fileid(id),
            None => bail!("unknown target '{}'", name),
        }
    }

    /// Bring a target into the plan: compute its transitive dirty state and
    /// mark every dirty edge on the way as wanted.
    pub fn want_fileid(&mut self, id: FileId) -> anyhow::Result<()> {
        let mut stack = Vec::new();
        self.ensure_dirty_file(id, &mut stack)?;
        if self.graph.file(id).input.is_none() {
            if self.file_state.get(id) == Some(MTime::Missing) {
                bail!(
                    "'{}' missing and no known rule to make it",
                    self.graph.file(id).name
                );
            }
            return Ok(());
        }
        self.plan_file(id)?;

        // Planned edges may have requested validations; validations may
        // request more.
        while let Some(v) = self.pending_validations.pop() {
            let mut stack = Vec::new();
            self.ensure_dirty_file(v, &mut stack)?;
            self.plan_file(v)?;
        }
        Ok(())
    }

    /// Post-order dirty computation for one file; recurses into its
    /// producing build, if any.  For source files, "dirty" means missing.
    fn ensure_dirty_file(&mut self, id: FileId, stack: &mut Vec<BuildId>) -> anyhow::Result<bool> {
        if let Some(bid) = self.graph.file(id).input {
            self.ensure_dirty_build(bid, stack)
        } else {
            if self.file_state.get(id).is_none() {
                let name = self.graph.file(id).name.clone();
                self.file_state.restat(id, self.fs, &name)?;
            }
            Ok(self.file_state.get(id) == Some(MTime::Missing))
        }
    }

    fn ensure_dirty_build(&mut self, bid: BuildId, stack: &mut Vec<BuildId>) -> anyhow::Result<bool> {
        match self.visit.lookup_or(bid, Visit::None) {
            Visit::Done => return Ok(self.dirty.lookup_or(bid, Dirtiness::Clean) != Dirtiness::Clean),
            Visit::InProgress => return Err(self.cycle_error(stack, bid)),
            Visit::None => {}
        }
        self.visit.set_grow(bid, Visit::InProgress, Visit::None);
        stack.push(bid);

        let dirtying: Vec<FileId> = self.graph.build(bid).dirtying_ins().collect();
        let order_only: Vec<FileId> = self.graph.build(bid).order_only_ins().to_vec();

        let mut input_dirty = false;
        for &in_id in &dirtying {
            let dirty = self.ensure_dirty_file(in_id, stack)?;
            self.check_missing_source(in_id, bid, dirty)?;
            input_dirty |= dirty;
        }
        for &in_id in &order_only {
            // Order-only inputs must exist and be up to date before the edge
            // runs, but their freshness doesn't dirty it.
            let dirty = self.ensure_dirty_file(in_id, stack)?;
            self.check_missing_source(in_id, bid, dirty)?;
        }

        for out in self.graph.build(bid).outs().to_vec() {
            if self.file_state.get(out).is_none() {
                let name = self.graph.file(out).name.clone();
                self.file_state.restat(out, self.fs, &name)?;
            }
        }

        let (dirty, dirtiness) = if self.graph.build(bid).is_phony() {
            // Phony edges never run; they only propagate their inputs'
            // dirtiness to their outputs.
            (input_dirty, if input_dirty { Dirtiness::Dirty } else { Dirtiness::Clean })
        } else if self.is_out_of_date(bid) {
            (true, Dirtiness::Dirty)
        } else if input_dirty {
            (true, Dirtiness::Maybe)
        } else {
            (false, Dirtiness::Clean)
        };

        self.dirty.set_grow(bid, dirtiness, Dirtiness::default());
        stack.pop();
        self.visit.set_grow(bid, Visit::Done, Visit::None);
        Ok(dirty)
    }

    fn check_missing_source(&self, in_id: FileId, bid: BuildId, dirty: bool) -> anyhow::Result<()> {
        if dirty && self.graph.file(in_id).input.is_none() {
            bail!(
                "'{}', needed by '{}', missing and no known rule to make it",
                self.graph.file(in_id).name,
                self.graph.file(self.graph.build(bid).outs()[0]).name
            );
        }
        Ok(())
    }

    fn cycle_error(&self, stack: &[BuildId], bid: BuildId) -> anyhow::Error {
        let first_out =
            |bid: BuildId| self.graph.file(self.graph.build(bid).outs()[0]).name.as_str();
        let pos = stack.iter().position(|&b| b == bid).unwrap_or(0);
        let mut names: Vec<&str> = stack[pos..].iter().map(|&b| first_out(b)).collect();
        names.push(first_out(bid));
        anyhow!("dependency cycle: {}", names.join(" -> "))
    }

    /// Decide whether a build's own recorded state is stale, given that all
    /// involved files have been stat()ed.  This is the comparison rerun at
    /// pop time for Maybe builds, which is what lets restat no-ops cascade.
    fn is_out_of_date(&mut self, bid: BuildId) -> bool {
        let build = self.graph.build(bid);

        let mut out_mtimes = Vec::with_capacity(build.outs().len());
        for &out in build.outs() {
            match self.file_state.get(out) {
                Some(MTime::Stamp(mtime)) => out_mtimes.push(mtime),
                // A missing output always rebuilds.
                _ => return true,
            }
        }

        // Discovered deps must have been recorded, and recorded no earlier
        // than the output they belong to.
        if build.deps_style != DepsStyle::None || build.depfile.is_some() {
            match self.deps_log.lookup(build.outs()[0]) {
                None => return true,
                Some(entry) => {
                    if entry.mtime < out_mtimes[0] {
                        return true;
                    }
                }
            }
        }

        // An output older than any dirtying input is stale; missing inputs
        // (e.g. a phony output that is not a real file) force a rebuild.
        let mut most_recent_input = i64::MIN;
        for in_id in build.dirtying_ins() {
            match self.file_state.get(in_id) {
                Some(MTime::Stamp(mtime)) => most_recent_input = most_recent_input.max(mtime),
                _ => return true,
            }
        }
        if out_mtimes.iter().any(|&out| out < most_recent_input) {
            return true;
        }

        // The command must match what the log last saw.  Restat and
        // generator edges are not recorded, so they get no hash check; their
        // freshness is mtime-only.
        if !build.restat && !build.generator {
            let hash = self.build_hash(bid);
            for &out in self.graph.build(bid).outs() {
                match self.build_log.lookup(&self.graph.file(out).name) {
                    Some(entry) if entry.command_hash == hash => {}
                    _ => return true,
                }
            }
        }
        false
    }

    fn build_hash(&mut self, bid: BuildId) -> BuildHash {
        if let Some(hash) = self.hashes.lookup_or(bid, None) {
            return hash;
        }
        let build = self.graph.build(bid);
        let hash = hash_command(build.cmdline.as_deref().unwrap_or(""), build.rspfile.as_ref());
        self.hashes.set_grow(bid, Some(hash), None);
        hash
    }

    /// Add a file's producing build to the plan if it needs work, after its
    /// own producers.
    fn plan_file(&mut self, id: FileId) -> anyhow::Result<()> {
        let Some(bid) = self.graph.file(id).input else {
            return Ok(());
        };
        if self.dirty.lookup_or(bid, Dirtiness::Clean) == Dirtiness::Clean {
            return Ok(());
        }
        if self.plan.state(bid).is_some() {
            return Ok(());
        }
        self.plan.set_state(bid, BuildState::Want);

        let dep_ins: Vec<FileId> = self.graph.build(bid).depend_ins().collect();
        for &in_id in &dep_ins {
            self.plan_file(in_id)?;
        }
        for &v in self.graph.build(bid).validation_ins() {
            self.pending_validations.push(v);
        }

        let pending = self.count_pending(bid);
        self.plan.pending_ins.set_grow(bid, pending, 0);
        if pending == 0 {
            self.make_ready(bid);
        }
        Ok(())
    }

    /// How many of a build's produced inputs are still unfinished in the plan.
    fn count_pending(&self, bid: BuildId) -> usize {
        self.graph
            .build(bid)
            .depend_ins()
            .filter(|&in_id| {
                self.graph.file(in_id).input.map_or(false, |producer| {
                    matches!(
                        self.plan.state(producer),
                        Some(BuildState::Want) | Some(BuildState::Ready) | Some(BuildState::Running)
                    )
                })
            })
            .count()
    }

    fn make_ready(&mut self, bid: BuildId) {
        self.plan.set_state(bid, BuildState::Ready);
        self.plan.ready.push_back(bid);
    }

    /// A build finished (or was skipped): tell its dependents, readying any
    /// that were only waiting on us.
    fn ready_dependents(&mut self, bid: BuildId) {
        let outs: HashSet<FileId> = self.graph.build(bid).outs().iter().copied().collect();
        let mut dependents: HashSet<BuildId> = HashSet::new();
        for &out in &outs {
            for &d in &self.graph.file(out).dependents {
                if self.plan.state(d) == Some(BuildState::Want) {
                    dependents.insert(d);
                }
            }
        }
        for d in dependents {
            let satisfied = self
                .graph
                .build(d)
                .depend_ins()
                .filter(|in_id| outs.contains(in_id))
                .count();
            let pending = self.plan.pending_ins.lookup_or(d, 0).saturating_sub(satisfied);
            self.plan.pending_ins.set_grow(d, pending, 0);
            if pending == 0 {
                self.make_ready(d);
            }
        }
    }

    /// Pop the next ready build that its pool will admit.
    fn next_ready(&mut self) -> Option<BuildId> {
        while let Some(bid) = self.plan.ready.pop_front() {
            let pool_name = self.graph.build(bid).pool.clone();
            let pool = self
                .pools
                .get_mut(pool_name.as_str())
                .expect("pools validated at load");
            if pool.depth > 0 && pool.running >= pool.depth {
                pool.queued.push_back(bid);
                continue;
            }
            return Some(bid);
        }
        None
    }

    /// A build from `pool_name` finished; admit a parked one if any.
    fn pool_finished(&mut self, pool_name: &str) {
        let pool = self.pools.get_mut(pool_name).expect("pool exists");
        pool.running = pool.running.saturating_sub(1);
        if let Some(parked) = pool.queued.pop_front() {
            self.plan.ready.push_front(parked);
        }
    }

    /// Load and apply a build's dyndep file, integrating any new edges into
    /// the dirty state and the plan.  Fatal on unknown outputs or cycles.
    fn load_dyndep(&mut self, bid: BuildId, dd: FileId) -> anyhow::Result<()> {
        let affected = dyndep::load(self.graph, dd)?;
        if !self.graph.build(bid).dyndep_loaded {
            bail!(
                "dyndep file '{}' has no entry for '{}'",
                self.graph.file(dd).name,
                self.graph.file(self.graph.build(bid).outs()[0]).name
            );
        }
        for abid in affected {
            // Walk the extended input set with the edge marked in-progress,
            // so a dyndep-introduced cycle back into this edge is reported
            // rather than recursed into.
            self.visit.set_grow(abid, Visit::InProgress, Visit::None);
            let mut stack = vec![abid];
            let dep_ins: Vec<FileId> = self.graph.build(abid).depend_ins().collect();
            for &in_id in &dep_ins {
                let dirty = self.ensure_dirty_file(in_id, &mut stack)?;
                self.check_missing_source(in_id, abid, dirty)?;
            }
            for out in self.graph.build(abid).outs().to_vec() {
                if self.file_state.get(out).is_none() {
                    let name = self.graph.file(out).name.clone();
                    self.file_state.restat(out, self.fs, &name)?;
                }
            }
            self.visit.set_grow(abid, Visit::Done, Visit::None);

            for &in_id in &dep_ins {
                self.plan_file(in_id)?;
            }
            if matches!(
                self.plan.state(abid),
                Some(BuildState::Want) | Some(BuildState::Ready)
            ) {
                let pending = self.count_pending(abid);
                self.plan.pending_ins.set_grow(abid, pending, 0);
            }

            // Dependents already planned may now be waiting on outputs this
            // edge just claimed.
            let new_outs: Vec<FileId> = self.graph.build(abid).outs().to_vec();
            let mut dependents: HashSet<BuildId> = HashSet::new();
            for &out in &new_outs {
                for &d in &self.graph.file(out).dependents {
                    if d != abid && self.plan.state(d).is_some() {
                        dependents.insert(d);
                    }
                }
            }
            for d in dependents {
                if matches!(
                    self.plan.state(d),
                    Some(BuildState::Want) | Some(BuildState::Ready)
                ) {
                    let pending = self.count_pending(d);
                    self.plan.pending_ins.set_grow(d, pending, 0);
                    if pending > 0 && self.plan.state(d) == Some(BuildState::Ready) {
                        self.plan.set_state(d, BuildState::Want);
                        self.plan.ready.retain(|&r| r != d);
                        for (_, pool) in self.pools.iter_mut() {
                            pool.queued.retain(|&r| r != d);
                        }
                    } else if pending == 0 && self.plan.state(d) == Some(BuildState::Want) {
                        self.make_ready(d);
                    }
                }
            }
        }
        Ok(())
    }

    /// Try to run one popped build.  May finish it instantly (phony, or
    /// verified clean), defer it (dyndep made it unready), or start it.
    fn start_build(&mut self, bid: BuildId) -> anyhow::Result<StartOutcome> {
        // Dyndep files extend the edge before it may run.
        if let Some(dd) = self.graph.build(bid).dyndep {
            if !self.graph.build(bid).dyndep_loaded {
                self.load_dyndep(bid, dd)?;
                let pending = self.count_pending(bid);
                if pending > 0 {
                    self.plan.pending_ins.set_grow(bid, pending, 0);
                    self.plan.set_state(bid, BuildState::Want);
                    return Ok(StartOutcome::Deferred);
                }
            }
        }

        if self.graph.build(bid).is_phony() {
            self.plan.set_state(bid, BuildState::Done);
            self.ready_dependents(bid);
            return Ok(StartOutcome::Finished);
        }

        // A build that was only dirty because its inputs were being rebuilt
        // gets re-verified now that they are done; if nothing actually
        // changed (restat upstream), skip it and cascade.
        if !self.options.dry_run
            && self.dirty.lookup_or(bid, Dirtiness::Clean) == Dirtiness::Maybe
            && !self.is_out_of_date(bid)
        {
            self.plan.set_state(bid, BuildState::Done);
            self.ready_dependents(bid);
            return Ok(StartOutcome::Finished);
        }

        if self.options.dry_run {
            let message = crate::progress::build_message(self.graph.build(bid)).to_owned();
            self.progress.log(&message);
            self.tasks_ran += 1;
            self.plan.set_state(bid, BuildState::Done);
            self.ready_dependents(bid);
            return Ok(StartOutcome::Finished);
        }

        // Beyond the first running job, each start needs a jobserver token
        // when a jobserver is present.
        if let Some(js) = &mut self.jobserver {
            if self.runner.running() > js.held() && !js.try_acquire() {
                return Ok(StartOutcome::NoToken);
            }
        }

        // Make sure output directories exist before the command needs them.
        for &out in self.graph.build(bid).outs().to_vec().iter() {
            let name = self.graph.file(out).name.clone();
            if let Some(parent) = Path::new(&name).parent() {
                if !parent.as_os_str().is_empty() {
                    self.fs
                        .create_dirs(parent.to_str().unwrap_or_default())
                        .map_err(|err| anyhow!("mkdir for {}: {}", name, err))?;
                }
            }
        }

        let build = self.graph.build(bid);
        let outs = build.outs().to_vec();
        let spec = TaskSpec {
            cmdline: build.cmdline.clone().expect("non-phony build"),
            first_output: self.graph.file(outs[0]).name.clone(),
            depfile: build.depfile.clone(),
            rspfile: build.rspfile.clone(),
            deps_style: build.deps_style,
            msvc_deps_prefix: build.msvc_deps_prefix.clone(),
            use_console: build.pool == "console",
        };
        let pool_name = build.pool.clone();

        self.progress.task_started(bid, self.graph.build(bid));
        self.plan.set_state(bid, BuildState::Running);
        self.pools
            .get_mut(pool_name.as_str())
            .expect("pools validated at load")
            .running += 1;
        self.runner.start(bid, spec);
        Ok(StartOutcome::Started)
    }

    /// Ingest one finished task: deps, restat, logs, plan propagation.
    fn handle_finished(&mut self, task: FinishedTask) -> anyhow::Result<()> {
        let bid = task.buildid;
        let result = task.result;

        let pool_name = self.graph.build(bid).pool.clone();
        self.pool_finished(&pool_name);
        if let Some(js) = &mut self.jobserver {
            while js.held() > self.runner.running().saturating_sub(1) {
                js.release();
            }
        }

        trace::write_complete(
            &self.graph.file(self.graph.build(bid).outs()[0]).name.clone(),
            task.tid + 1,
            task.span.0,
            task.span.1,
        );

        match result.termination {
            Termination::Success => {
                // Fold discovered deps into the graph and the deps log.
                if let Some(dep_names) = &result.discovered_deps {
                    let dep_ids: Vec<FileId> = dep_names
                        .iter()
                        .map(|name| {
                            let mut name = name.clone();
                            let slash_bits = crate::canon::canon_path_fast(&mut name);
                            self.graph.file_id(name, slash_bits)
                        })
                        .collect();
                    self.graph.update_discovered(bid, dep_ids);
                    for in_id in self.graph.build(bid).discovered_ins().to_vec() {
                        if self.file_state.get(in_id).is_none() {
                            let name = self.graph.file(in_id).name.clone();
                            self.file_state.restat(in_id, self.fs, &name)?;
                        }
                    }
                }

                // Refresh output mtimes from disk.
                let outs = self.graph.build(bid).outs().to_vec();
                for &out in &outs {
                    let name = self.graph.file(out).name.clone();
                    self.file_state.restat(out, self.fs, &name)?;
                }

                let first_out_mtime = match self.file_state.get(outs[0]) {
                    Some(MTime::Stamp(mtime)) => mtime,
                    _ => 0,
                };
                if result.discovered_deps.is_some() {
                    let ins = self.graph.build(bid).discovered_ins().to_vec();
                    self.deps_log
                        .write_deps(self.graph, outs[0], first_out_mtime, &ins)?;
                }

                let build = self.graph.build(bid);
                if !build.restat && !build.generator {
                    let start_ms = task
                        .span
                        .0
                        .duration_since(self.start_time)
                        .as_millis() as u32;
                    let end_ms = task
                        .span
                        .1
                        .duration_since(self.start_time)
                        .as_millis() as u32;
                    let hash = self.build_hash(bid);
                    for &out in &outs {
                        let mtime = match self.file_state.get(out) {
                            Some(MTime::Stamp(mtime)) => mtime,
                            _ => 0,
                        };
                        let name = self.graph.file(out).name.clone();
                        self.build_log.record(
                            &name,
                            build_log::Entry {
                                start_ms,
                                end_ms,
                                mtime,
                                command_hash: hash,
                            },
                        )?;
                    }
                }

                self.tasks_ran += 1;
                self.progress
                    .task_finished(bid, self.graph.build(bid), &result);
                self.plan.set_state(bid, BuildState::Done);
                self.ready_dependents(bid);
            }
            Termination::Failure => {
                self.progress
                    .task_finished(bid, self.graph.build(bid), &result);
                self.remove_failed_outputs(bid)?;
                self.plan.set_state(bid, BuildState::Failed);
                if let Some(left) = &mut self.failures_left {
                    *left = left.saturating_sub(1);
                }
            }
            Termination::Interrupted => {
                self.progress
                    .task_finished(bid, self.graph.build(bid), &result);
                self.plan.set_state(bid, BuildState::Failed);
                self.interrupted = true;
            }
        }
        Ok(())
    }

    /// Partial outputs of a failed command are poison; delete them so the
    /// next build reruns the edge.  Restat and generator edges keep theirs.
    fn remove_failed_outputs(&mut self, bid: BuildId) -> anyhow::Result<()> {
        let build = self.graph.build(bid);
        if build.restat || build.generator {
            return Ok(());
        }
        for &out in build.outs().to_vec().iter() {
            let name = self.graph.file(out).name.clone();
            let _ = self.fs.remove_file(&name);
            self.file_state.set(out, MTime::Missing);
        }
        Ok(())
    }

    fn cancel(&mut self) {
        let sig = signal::caught().unwrap_or(2 /* SIGINT */);
        self.runner.kill_all(sig);
        // Drain so children are reaped and output is flushed.
        while self.runner.is_running() {
            if self.runner.wait(Duration::from_millis(500)).is_none() {
                break;
            }
        }
        self.interrupted = true;
    }

    /// Run the plan to completion.  Returns the number of tasks executed, or
    /// None if any build failed or the build was interrupted.
    pub fn run(&mut self) -> anyhow::Result<Option<usize>> {
        self.progress.update(&self.plan.counts);
        let mut stop_starting = false;
        while self.plan.unfinished() > 0 || self.runner.is_running() {
            if signal::was_interrupted() {
                self.cancel();
                return Ok(None);
            }
            if self.failures_left == Some(0) {
                stop_starting = true;
            }

            // Launch phase: start everything we can.
            let mut launched = false;
            while !stop_starting && self.runner.can_start_more() {
                let Some(bid) = self.next_ready() else { break };
                match self.start_build(bid)? {
                    StartOutcome::Started | StartOutcome::Finished => launched = true,
                    StartOutcome::Deferred => launched = true,
                    StartOutcome::NoToken => {
                        self.plan.ready.push_front(bid);
                        break;
                    }
                }
            }
            self.progress.update(&self.plan.counts);
            if launched {
                // New completions may have readied more work.
                continue;
            }

            if !self.runner.is_running() {
                if stop_starting || self.plan.counts.get(BuildState::Failed) > 0 {
                    // Remaining Want/Ready builds are stranded downstream of
                    // failures.
                    break;
                }
                if self.plan.unfinished() > 0 {
                    // Only a stuck jobserver can leave us here: ready work,
                    // nothing running, no token.  Wait and retry.
                    if !self.plan.ready.is_empty() {
                        std::thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                    bail!("plan wedged: wanted builds but nothing ready or running");
                }
                break;
            }

            // Wait phase: block until a child finishes or a timeout lets us
            // notice signals.
            if let Some(task) = self.runner.wait(Duration::from_millis(500)) {
                self.handle_finished(task)?;
                self.progress.update(&self.plan.counts);
            }
            if self.interrupted {
                self.cancel();
                return Ok(None);
            }
        }

        // Drain any stragglers after a failure stop.
        while self.runner.is_running() {
            if signal::was_interrupted() || self.interrupted {
                self.cancel();
                return Ok(None);
            }
            if let Some(task) = self.runner.wait(Duration::from_millis(500)) {
                self.handle_finished(task)?;
            }
        }

        if self.plan.counts.get(BuildState::Failed) > 0 {
            return Ok(None);
        }
        Ok(Some(self.tasks_ran))
    }
}
