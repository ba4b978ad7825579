//! Scheduling: deciding which actions are stale, propagating invalidation,
//! and draining the runnable set with a worker pool until quiescence.
//!
//! One invocation owns a `Work` session.  The embedding tool constructs the
//! graph, seeds history from the result cache, calls `want_file` for each
//! target, then `run`.  The reachability check is strictly single-threaded
//! and finishes before the first worker starts; afterwards the scheduling
//! mutex is the only synchronization point for staleness and run flags, and
//! a separate lock serializes console output.

use crate::db;
use crate::eval;
use crate::graph::{ActionId, FileId, FileTimes, Graph, MTime};
use crate::task;
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// How long an idle worker (and the quiescence watcher) sleeps between polls.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Run options consumed by the engine; parsing them belongs to the caller.
pub struct Options {
    /// Number of worker threads.
    pub parallelism: usize,
    /// Print check decisions and executed command lines.
    pub verbose: bool,
    /// Never spawn subprocesses and report every action as succeeding, but
    /// still print diagnostics.
    pub dry_run: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            parallelism: default_parallelism(),
            verbose: false,
            dry_run: false,
        }
    }
}

/// Worker count used when the caller does not specify one.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 1
}

/// Execution history of one action, persisted across invocations by the
/// result cache.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct History {
    /// Exit code of the most recent run; None if the action never ran.
    pub last_exit_code: Option<i32>,
    pub run_count: u32,
    /// Decayed accumulation of run durations; the raw input to the
    /// critical-path estimate, not a per-run mean.
    pub total_time: Duration,
}

/// Mutable scheduling state, guarded by the session's mutex.  All methods
/// assume the lock is held (or that no workers exist yet).
struct RunState {
    /// Per-file staleness flag.  Set only by invalidation, cleared only by
    /// `signal_current`.
    dirty: Vec<bool>,
    /// Per-action: selected by the reachability check but not yet handed to
    /// a worker.  Doubles as the check's visited guard.
    want: Vec<bool>,
    /// Per-action: outputs must be refreshed before dependents may trust
    /// them.
    pending: Vec<bool>,
    history: Vec<History>,
    /// Actions eligible to execute right now.
    runnable: Vec<ActionId>,
    /// Per-action memo for `delay`, valid for one invocation.
    delay: Vec<Option<u64>>,
    /// Workers currently with nothing to do.
    idle: usize,
}

impl RunState {
    fn new(graph: &Graph) -> Self {
        RunState {
            dirty: vec![false; graph.files_len()],
            want: vec![false; graph.actions_len()],
            pending: vec![false; graph.actions_len()],
            history: vec![History::default(); graph.actions_len()],
            runnable: Vec::new(),
            delay: vec![None; graph.actions_len()],
            idle: 0,
        }
    }

    /// Mark a file stale and cascade forward through every action that
    /// consumes it.  Idempotent; never propagates upstream.
    fn invalidate_file(&mut self, graph: &Graph, id: FileId) {
        if self.dirty[id.index()] {
            return;
        }
        self.dirty[id.index()] = true;
        for &dep in &graph.file(id).dependents {
            self.invalidate_action(graph, dep);
        }
    }

    /// Mark an action as having work to do and stale-ify its outputs.
    fn invalidate_action(&mut self, graph: &Graph, id: ActionId) {
        self.pending[id.index()] = true;
        for out in graph.action(id).required_outs() {
            self.invalidate_file(graph, out);
        }
    }

    /// Clear a file's staleness and enqueue every consumer that became
    /// eligible.  Idempotent; this is the only way work becomes unblocked.
    fn signal_current(&mut self, graph: &Graph, id: FileId) {
        if !self.dirty[id.index()] {
            return;
        }
        self.dirty[id.index()] = false;
        for &dep in &graph.file(id).dependents {
            if self.can_run(graph, dep) {
                self.runnable.push(dep);
            }
        }
    }

    /// An action is eligible once it is wanted and none of its inputs are
    /// stale.  Ordering-only inputs gate eligibility like any other input.
    /// Consumes the want flag on success.
    fn can_run(&mut self, graph: &Graph, id: ActionId) -> bool {
        if !self.want[id.index()] {
            return false;
        }
        for f in graph.action(id).all_ins() {
            if self.dirty[f.index()] {
                return false;
            }
        }
        self.want[id.index()] = false;
        true
    }

    /// Critical-path estimate: this action's accumulated time plus the worst
    /// delay among still-pending consumers of its outputs.  Memoized for the
    /// invocation; the memo slot is seeded with the self time before
    /// recursing, so a dependency cycle yields the partial estimate instead
    /// of diverging.  A heuristic, not an exact longest path.
    fn delay(&mut self, graph: &Graph, id: ActionId) -> u64 {
        if let Some(d) = self.delay[id.index()] {
            return d;
        }
        let own = self.history[id.index()].total_time.as_nanos() as u64;
        self.delay[id.index()] = Some(own);
        let mut worst = 0;
        for out in graph.action(id).required_outs() {
            for &dep in &graph.file(out).dependents {
                if self.want[dep.index()] && self.pending[dep.index()] {
                    worst = worst.max(self.delay(graph, dep));
                }
            }
        }
        let d = own + worst;
        self.delay[id.index()] = Some(d);
        d
    }

    /// Remove and return the runnable action with the strictly greatest
    /// delay (ties broken arbitrarily).
    fn pop_best(&mut self, graph: &Graph) -> Option<ActionId> {
        let mut best: Option<(usize, u64)> = None;
        for i in 0..self.runnable.len() {
            let d = self.delay(graph, self.runnable[i]);
            match best {
                Some((_, best_delay)) if best_delay >= d => {}
                _ => best = Some((i, d)),
            }
        }
        best.map(|(i, _)| self.runnable.swap_remove(i))
    }
}

/// The staleness decision for one action, in order: pseudo-actions are
/// always stale; then missing outputs, missing inputs, an output older than
/// an input, and a previously failed run.  Stale actions invalidate their
/// outputs, cascading downstream.
fn check_action(
    graph: &Graph,
    times: &FileTimes,
    verbose: bool,
    state: &mut RunState,
    id: ActionId,
) {
    let action = graph.action(id);
    let main = graph.file(action.main_output());
    if verbose {
        println!("check {} ?", main.name);
    }
    if action.is_pseudo() {
        if verbose {
            println!("rebuilding; pseudo-action");
        }
        state.invalidate_action(graph, id);
        return;
    }
    for out in action.required_outs() {
        if times.get(graph, out) == MTime::Missing {
            if verbose {
                println!("output {} does not exist", graph.file(out).name);
            }
            state.invalidate_action(graph, id);
            return;
        }
    }
    let mut youngest_input = MTime::Missing;
    for f in action.dirtying_ins() {
        let t = times.get(graph, f);
        if t == MTime::Missing {
            if verbose {
                println!("input {} does not exist", graph.file(f).name);
            }
            // An input nobody can produce blocks this action for the whole
            // invocation: there is no signal_current to wait for.
            if graph.file(f).generating.is_none() {
                state.invalidate_file(graph, f);
            }
            state.invalidate_action(graph, id);
            return;
        }
        youngest_input = youngest_input.max(t);
    }
    if action.oldest_output(graph, times) < youngest_input {
        if verbose {
            println!("oldest output of {} is older than its newest input", main.name);
        }
        state.invalidate_action(graph, id);
        return;
    }
    if let Some(code) = state.history[id.index()].last_exit_code {
        if code != 0 {
            if verbose {
                println!("{} failed last time (exit {})", main.name, code);
            }
            state.invalidate_action(graph, id);
        }
    }
}

/// One invocation of the engine: the session object owning all mutable run
/// state for a constructed graph.
pub struct Work<'a> {
    graph: &'a Graph,
    options: Options,
    times: FileTimes,
    state: Mutex<RunState>,
    /// Serializes console diagnostics, separately from scheduling.
    console: Mutex<()>,
    /// Set once any action fails; decides the invocation's final status.
    failed: AtomicBool,
    /// Subprocesses actually spawned this invocation.
    ran: AtomicUsize,
    stop: AtomicBool,
}

impl<'a> Work<'a> {
    pub fn new(graph: &'a Graph, options: Options) -> Self {
        let options = Options {
            parallelism: options.parallelism.max(1),
            ..options
        };
        Work {
            graph,
            options,
            times: FileTimes::new(),
            state: Mutex::new(RunState::new(graph)),
            console: Mutex::new(()),
            failed: AtomicBool::new(false),
            ran: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        }
    }

    /// Seed run history from a previous invocation's cache.  Call before
    /// `want_file` so staleness decisions see prior exit codes.
    pub fn load_history(&mut self, path: &str) {
        let state = self.state.get_mut().unwrap();
        db::load(path, self.graph, &mut state.history);
    }

    /// Persist run history for the next invocation, overwriting `path`.
    pub fn save_history(&self, path: &str) -> anyhow::Result<()> {
        let state = self.state.lock().unwrap();
        db::save(path, self.graph, &state.history)
    }

    /// A copy of an action's recorded history.
    pub fn action_history(&self, id: ActionId) -> History {
        self.state.lock().unwrap().history[id.index()].clone()
    }

    /// Request that `target` be brought up to date: run the staleness check
    /// over every not-yet-visited action reachable from it.  A target
    /// without a generating action has nothing to check.
    pub fn want_file(&mut self, target: FileId) {
        let graph = self.graph;
        let state = self.state.get_mut().unwrap();
        let mut worklist = Vec::new();
        if let Some(action) = graph.file(target).generating {
            worklist.push(action);
        }
        while let Some(id) = worklist.pop() {
            if state.want[id.index()] {
                // Already visited; this also breaks dependency cycles.
                continue;
            }
            check_action(graph, &self.times, self.options.verbose, state, id);
            state.want[id.index()] = true;
            for f in graph.action(id).all_ins() {
                if let Some(generating) = graph.file(f).generating {
                    worklist.push(generating);
                }
            }
        }
    }

    /// Drain the runnable set with the worker pool until quiescence: every
    /// worker simultaneously idle with nothing runnable.  Returns the number
    /// of subprocesses spawned, or None if any action failed.
    pub fn run(&mut self) -> Option<usize> {
        {
            let state = self.state.get_mut().unwrap();
            for id in self.graph.all_actions() {
                if state.can_run(self.graph, id) {
                    state.runnable.push(id);
                }
            }
            state.idle = self.options.parallelism;
        }
        self.stop.store(false, Ordering::Relaxed);
        let this = &*self;
        std::thread::scope(|scope| {
            for _ in 0..this.options.parallelism {
                scope.spawn(move || this.worker());
            }
            // New runnable entries only appear as a side effect of a
            // completed run, so total idleness with an empty set is final.
            loop {
                std::thread::sleep(POLL_INTERVAL);
                let state = this.state.lock().unwrap();
                if state.idle == this.options.parallelism && state.runnable.is_empty() {
                    break;
                }
            }
            this.stop.store(true, Ordering::Relaxed);
        });
        if self.failed.load(Ordering::Relaxed) {
            None
        } else {
            Some(self.ran.load(Ordering::Relaxed))
        }
    }

    fn worker(&self) {
        let graph = self.graph;
        let mut busy = false;
        while !self.stop.load(Ordering::Relaxed) {
            let next = {
                let mut state = self.state.lock().unwrap();
                match state.pop_best(graph) {
                    Some(id) => {
                        if !busy {
                            state.idle -= 1;
                            busy = true;
                        }
                        Some(id)
                    }
                    None => {
                        if busy {
                            state.idle += 1;
                            busy = false;
                        }
                        None
                    }
                }
            };
            let id = match next {
                Some(id) => id,
                None => {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };
            let failed = match self.execute(id) {
                Ok(failed) => failed,
                Err(err) => {
                    let main = graph.file(graph.action(id).main_output());
                    {
                        let _console = self.console.lock().unwrap();
                        println!("error building {}: {}", main.name, err);
                    }
                    let mut state = self.state.lock().unwrap();
                    state.pending[id.index()] = false;
                    true
                }
            };
            if failed && !self.failed.swap(true, Ordering::Relaxed) {
                let main = graph.file(graph.action(id).main_output());
                let _console = self.console.lock().unwrap();
                println!("failing build because building {} failed", main.name);
            }
        }
    }

    /// Execute one action.  The caller owns it exclusively, having removed
    /// it from the runnable set.  Returns whether the run failed; an Err is
    /// a failure outside the subprocess itself.
    fn execute(&self, id: ActionId) -> anyhow::Result<bool> {
        let graph = self.graph;
        let action = graph.action(id);
        let main = graph.file(action.main_output());

        if action.is_pseudo() {
            // No command to run; unblock dependents and move on.
            let mut state = self.state.lock().unwrap();
            for out in action.required_outs() {
                state.signal_current(graph, out);
            }
            state.pending[id.index()] = false;
            return Ok(false);
        }

        // Per-run variable values, computed against the memoized mtimes.
        let oldest = action.oldest_output(graph, &self.times);
        let mut inputs = String::new();
        let mut new_inputs = String::new();
        for f in action.command_ins() {
            let name = &graph.file(f).name;
            if !inputs.is_empty() {
                inputs.push(' ');
            }
            inputs.push_str(name);
            if self.times.get(graph, f) > oldest {
                if !new_inputs.is_empty() {
                    new_inputs.push(' ');
                }
                new_inputs.push_str(name);
            }
        }
        let mut outputs = String::new();
        for out in action.required_outs() {
            if !outputs.is_empty() {
                outputs.push(' ');
            }
            outputs.push_str(&graph.file(out).name);
        }

        let mut run_vars = FxHashMap::default();
        run_vars.insert("OUTPUT".to_owned(), main.name.clone());
        run_vars.insert("OUTPUTS".to_owned(), outputs);
        run_vars.insert("INPUTS".to_owned(), inputs.clone());
        run_vars.insert("NEW_INPUTS".to_owned(), new_inputs);

        // $@ and $^ are rule-language shorthands for the same values.
        let template = action.cmdline.as_deref().unwrap_or("");
        let template = template.replace("$@", &main.name).replace("$^", &inputs);
        let cmdline = eval::expand(&template, &[&run_vars, &action.vars, &graph.globals])?;

        let (pending, stored) = {
            let state = self.state.lock().unwrap();
            (
                state.pending[id.index()],
                state.history[id.index()].last_exit_code,
            )
        };

        if pending {
            if self.options.verbose {
                let _console = self.console.lock().unwrap();
                println!("building {} by running:\n{}", main.name, cmdline);
            } else if self.options.dry_run {
                let _console = self.console.lock().unwrap();
                println!("building {}", main.name);
            }
        }

        let log = task::log_path(&main.name);
        let exit_code = match (self.options.dry_run, pending, stored) {
            (true, _, _) => 0,
            (false, false, Some(code)) => {
                // Nothing changed since the recorded result; reuse it
                // without spawning a process.
                if self.options.verbose {
                    let _console = self.console.lock().unwrap();
                    println!("using stored exit code {} for {}", code, main.name);
                }
                code
            }
            _ => {
                for out in action.required_outs().chain(action.cache_outs()) {
                    task::create_parent_dirs(&graph.file(out).name)?;
                }
                let result = task::run_task(&cmdline, &log)?;
                self.ran.fetch_add(1, Ordering::Relaxed);
                let mut state = self.state.lock().unwrap();
                let history = &mut state.history[id.index()];
                history.last_exit_code = Some(result.exit_code);
                // Bound the history's weight before folding in the sample.
                if history.run_count == 10 {
                    history.total_time = history.total_time.mul_f64(0.9);
                    history.run_count -= 1;
                }
                history.total_time += result.elapsed;
                history.run_count += 1;
                result.exit_code
            }
        };

        {
            let _console = self.console.lock().unwrap();
            let log_text = std::fs::read(&log).unwrap_or_default();
            if exit_code != 0 {
                println!("error {} building {}:", exit_code, main.name);
            } else if self.options.verbose && pending {
                println!("built {} successfully", main.name);
            } else if !log_text.is_empty() {
                println!("while building {}", main.name);
            }
            if !log_text.is_empty() {
                print!("{}", String::from_utf8_lossy(&log_text));
            }
        }

        let mut state = self.state.lock().unwrap();
        if pending && exit_code == 0 {
            for out in action.required_outs() {
                state.signal_current(graph, out);
            }
        }
        state.pending[id.index()] = false;
        Ok(exit_code != 0)
    }
}

/// Remove every on-disk file the graph knows how to regenerate.
pub fn clean(graph: &Graph, options: &Options) -> anyhow::Result<()> {
    for id in graph.all_files() {
        let file = graph.file(id);
        if file.generating.is_none() {
            continue;
        }
        if std::fs::metadata(&file.name).is_err() {
            continue;
        }
        if options.dry_run || options.verbose {
            println!("rm {}", file.name);
        }
        if !options.dry_run {
            std::fs::remove_file(&file.name).map_err(|err| anyhow!("remove {}: {}", file.name, err))?;
        }
    }
    Ok(())
}
