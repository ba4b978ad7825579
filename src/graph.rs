//! The build graph: files, the actions that produce them, and their
//! modification times.
//!
//! Files and actions form a cyclic web of references, so both live in one
//! arena owned by `Graph` and refer to each other with ids.  The graph is
//! immutable once construction finishes; all per-invocation state (staleness
//! flags, run history, ...) lives in `work::Work`.

use crate::eval;
use anyhow::bail;
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use std::time::UNIX_EPOCH;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FileId(usize);
impl FileId {
    pub(crate) fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ActionId(usize);
impl ActionId {
    pub(crate) fn index(&self) -> usize {
        self.0
    }
}

/// The role an input plays for an action.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Relation {
    /// Ordering only: must be brought up to date first, but is excluded from
    /// the staleness comparison and from command-visible input lists.
    BuildBefore,
    /// Counts toward staleness but is not exposed to the command.
    IndirectInput,
    /// Counts toward staleness and appears in `$(INPUTS)`.
    Input,
    /// The input the rule matcher instantiated the action from; otherwise
    /// behaves like `Input`.
    GeneratingInput,
}

impl Relation {
    /// Inputs excluded from the staleness comparison.
    pub fn is_order_only(self) -> bool {
        matches!(self, Relation::BuildBefore)
    }

    /// Inputs listed in `$(INPUTS)`.
    pub fn in_command(self) -> bool {
        matches!(self, Relation::Input | Relation::GeneratingInput)
    }
}

/// A file-like node in the build graph.
#[derive(Debug)]
pub struct File {
    pub name: String,
    /// The action producing this file, if any.  At most one action may
    /// produce a given file.
    pub generating: Option<ActionId>,
    /// Actions that consume this file as an input.
    pub dependents: Vec<ActionId>,
}

/// One build step, identified by its single mandatory output.
#[derive(Debug)]
pub struct Action {
    ins: Vec<(FileId, Relation)>,
    main_out: FileId,
    outs: Vec<FileId>,
    cache_outs: Vec<FileId>,
    /// Command text, fully resolved except for per-run variables.  None or
    /// empty marks a pseudo-action, which runs no subprocess and exists
    /// purely to propagate invalidation.
    pub cmdline: Option<String>,
    /// Rule-local variables, fixed at construction.
    pub vars: FxHashMap<String, String>,
}

impl Action {
    pub fn new(main_out: FileId) -> Self {
        Action {
            ins: Vec::new(),
            main_out,
            outs: Vec::new(),
            cache_outs: Vec::new(),
            cmdline: None,
            vars: FxHashMap::default(),
        }
    }

    /// Record `file` as an input.  A file appears at most once in the input
    /// list; adding it again updates the relation.
    pub fn add_input(&mut self, file: FileId, relation: Relation) {
        for (f, rel) in self.ins.iter_mut() {
            if *f == file {
                *rel = relation;
                return;
            }
        }
        self.ins.push((file, relation));
    }

    /// Record an additional required output.
    pub fn add_output(&mut self, file: FileId) {
        self.outs.push(file);
    }

    /// Record a cache-only output: produced and persisted, but never checked
    /// for staleness validity (incidental logs and the like).
    pub fn add_cache_output(&mut self, file: FileId) {
        self.cache_outs.push(file);
    }

    pub fn main_output(&self) -> FileId {
        self.main_out
    }

    /// The mandatory output plus the additional required outputs; excludes
    /// cache-only outputs.
    pub fn required_outs(&self) -> impl Iterator<Item = FileId> + '_ {
        std::iter::once(self.main_out).chain(self.outs.iter().copied())
    }

    pub fn cache_outs(&self) -> impl Iterator<Item = FileId> + '_ {
        self.cache_outs.iter().copied()
    }

    /// All inputs, regardless of relation.
    pub fn all_ins(&self) -> impl Iterator<Item = FileId> + '_ {
        self.ins.iter().map(|&(f, _)| f)
    }

    /// Inputs that count toward the staleness comparison.
    pub fn dirtying_ins(&self) -> impl Iterator<Item = FileId> + '_ {
        self.ins
            .iter()
            .filter(|&&(_, rel)| !rel.is_order_only())
            .map(|&(f, _)| f)
    }

    /// Inputs exposed to the command as `$(INPUTS)`.
    pub fn command_ins(&self) -> impl Iterator<Item = FileId> + '_ {
        self.ins
            .iter()
            .filter(|&&(_, rel)| rel.in_command())
            .map(|&(f, _)| f)
    }

    pub fn is_pseudo(&self) -> bool {
        match &self.cmdline {
            None => true,
            Some(cmd) => cmd.is_empty(),
        }
    }

    /// The oldest required output, skipping missing outputs unless every
    /// output is missing.
    pub fn oldest_output(&self, graph: &Graph, times: &FileTimes) -> MTime {
        let mut oldest = times.get(graph, self.main_out);
        for &out in &self.outs {
            let t = times.get(graph, out);
            match (oldest, t) {
                (MTime::Missing, _) => oldest = t,
                (_, MTime::Missing) => {}
                (MTime::Stamp(o), MTime::Stamp(n)) if n < o => oldest = t,
                _ => {}
            }
        }
        oldest
    }
}

/// The build graph arena.
#[derive(Default)]
pub struct Graph {
    files: Vec<File>,
    actions: Vec<Action>,
    file_to_id: FxHashMap<String, FileId>,
    /// Global variable table, consulted after rule-local variables when
    /// injecting per-run values into a command.
    pub globals: FxHashMap<String, String>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn file(&self, id: FileId) -> &File {
        &self.files[id.index()]
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.index()]
    }

    pub fn files_len(&self) -> usize {
        self.files.len()
    }

    pub fn actions_len(&self) -> usize {
        self.actions.len()
    }

    pub fn all_files(&self) -> impl Iterator<Item = FileId> {
        (0..self.files.len()).map(FileId)
    }

    pub fn all_actions(&self) -> impl Iterator<Item = ActionId> {
        (0..self.actions.len()).map(ActionId)
    }

    /// Intern a path, creating the file node on first use.
    pub fn file_id(&mut self, name: &str) -> FileId {
        match self.file_to_id.get(name) {
            Some(&id) => id,
            None => {
                let id = FileId(self.files.len());
                self.files.push(File {
                    name: name.to_owned(),
                    generating: None,
                    dependents: Vec::new(),
                });
                self.file_to_id.insert(name.to_owned(), id);
                id
            }
        }
    }

    /// Look up an already-interned path.
    pub fn lookup(&self, name: &str) -> Option<FileId> {
        self.file_to_id.get(name).copied()
    }

    /// Add a fully-described action, linking it into its files.  Fails if an
    /// output already has a generating action, or if the command references a
    /// variable that cannot resolve at dispatch time; either aborts graph
    /// construction before any scheduling happens.
    pub fn add_action(&mut self, action: Action) -> anyhow::Result<ActionId> {
        if let Some(cmd) = &action.cmdline {
            eval::check_resolvable(cmd, &action.vars, &self.globals)?;
        }
        let id = ActionId(self.actions.len());
        for &(f, _) in &action.ins {
            self.files[f.index()].dependents.push(id);
        }
        for out in action
            .required_outs()
            .chain(action.cache_outs.iter().copied())
        {
            let file = &mut self.files[out.index()];
            if file.generating.is_some() {
                bail!("two actions produce {}", file.name);
            }
            file.generating = Some(id);
        }
        self.actions.push(action);
        Ok(id)
    }
}

/// MTime info gathered for a file.  Also models "file is absent"; a missing
/// file orders before every timestamp.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum MTime {
    Missing,
    Stamp(u64),
}

/// stat() an on-disk path, producing its MTime.
pub fn stat(path: &str) -> std::io::Result<MTime> {
    Ok(match std::fs::metadata(path) {
        Ok(meta) => match meta.modified()?.duration_since(UNIX_EPOCH) {
            Ok(d) => MTime::Stamp(d.as_secs()),
            Err(_) => MTime::Stamp(0),
        },
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                MTime::Missing
            } else {
                return Err(err);
            }
        }
    })
}

/// Per-invocation memo of file modification times, shared across workers.
/// Each file is stat()ed at most once per invocation, so an output rebuilt
/// mid-run keeps its pre-run stamp until the next invocation.
pub struct FileTimes {
    times: DashMap<FileId, MTime>,
}

impl FileTimes {
    pub fn new() -> Self {
        FileTimes {
            times: DashMap::new(),
        }
    }

    /// The memoized modification time of a file; stat errors count as missing.
    pub fn get(&self, graph: &Graph, id: FileId) -> MTime {
        *self
            .times
            .entry(id)
            .or_insert_with(|| stat(&graph.file(id).name).unwrap_or(MTime::Missing))
    }
}

impl Default for FileTimes {
    fn default() -> Self {
        FileTimes::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_files(names: &[&str]) -> (Graph, Vec<FileId>) {
        let mut graph = Graph::new();
        let ids = names.iter().map(|n| graph.file_id(n)).collect();
        (graph, ids)
    }

    #[test]
    fn interning_reuses_ids() {
        let mut graph = Graph::new();
        let a = graph.file_id("a.txt");
        let b = graph.file_id("b.txt");
        assert_ne!(a, b);
        assert_eq!(a, graph.file_id("a.txt"));
        assert_eq!(graph.lookup("b.txt"), Some(b));
        assert_eq!(graph.lookup("c.txt"), None);
    }

    #[test]
    fn one_generating_action_per_file() {
        let (mut graph, ids) = graph_with_files(&["out", "in"]);
        let mut action = Action::new(ids[0]);
        action.add_input(ids[1], Relation::Input);
        graph.add_action(action).unwrap();

        let second = Action::new(ids[0]);
        assert!(graph.add_action(second).is_err());
    }

    #[test]
    fn readding_input_updates_relation() {
        let (_, ids) = graph_with_files(&["out", "in"]);
        let mut action = Action::new(ids[0]);
        action.add_input(ids[1], Relation::Input);
        action.add_input(ids[1], Relation::BuildBefore);
        assert_eq!(action.all_ins().count(), 1);
        assert_eq!(action.dirtying_ins().count(), 0);
        assert_eq!(action.command_ins().count(), 0);
    }

    #[test]
    fn relation_filters() {
        let (_, ids) = graph_with_files(&["out", "a", "b", "c", "d"]);
        let mut action = Action::new(ids[0]);
        action.add_input(ids[1], Relation::Input);
        action.add_input(ids[2], Relation::GeneratingInput);
        action.add_input(ids[3], Relation::IndirectInput);
        action.add_input(ids[4], Relation::BuildBefore);
        assert_eq!(action.all_ins().count(), 4);
        assert_eq!(action.dirtying_ins().count(), 3);
        let command: Vec<_> = action.command_ins().collect();
        assert_eq!(command, vec![ids[1], ids[2]]);
    }

    #[test]
    fn unresolvable_command_aborts_construction() {
        let (mut graph, ids) = graph_with_files(&["out"]);
        let mut action = Action::new(ids[0]);
        action.cmdline = Some("cc $(NO_SUCH_VAR)".to_owned());
        assert!(graph.add_action(action).is_err());
    }

    #[test]
    fn mtime_ordering() {
        assert!(MTime::Missing < MTime::Stamp(0));
        assert!(MTime::Stamp(1) < MTime::Stamp(2));
    }

    #[test]
    fn oldest_output_skips_missing() {
        let (mut graph, ids) = graph_with_files(&["main", "extra1", "extra2"]);
        let mut action = Action::new(ids[0]);
        action.add_output(ids[1]);
        action.add_output(ids[2]);
        action.cmdline = Some("true".to_owned());
        let id = graph.add_action(action).unwrap();

        let times = FileTimes::new();
        times.times.insert(ids[0], MTime::Missing);
        times.times.insert(ids[1], MTime::Stamp(5));
        times.times.insert(ids[2], MTime::Stamp(3));
        assert_eq!(
            graph.action(id).oldest_output(&graph, &times),
            MTime::Stamp(3)
        );
    }

    #[test]
    fn oldest_output_all_missing() {
        let (mut graph, ids) = graph_with_files(&["main", "extra"]);
        let mut action = Action::new(ids[0]);
        action.add_output(ids[1]);
        action.cmdline = Some("true".to_owned());
        let id = graph.add_action(action).unwrap();

        let times = FileTimes::new();
        times.times.insert(ids[0], MTime::Missing);
        times.times.insert(ids[1], MTime::Missing);
        assert_eq!(
            graph.action(id).oldest_output(&graph, &times),
            MTime::Missing
        );
    }
}
