//! Render graph - owns stages, keeps a valid render order under live edits

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::context::RenderContext;
use crate::port::{PortBus, PortKey, PortRole, RenderIo, StageBinding};
use crate::stage::{Gid, Stage, StageCore};

/// Structural failures of a [`StageGraph`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("graph has no stages")]
    EmptyGraph,
    #[error("no sink is reachable")]
    NoSink,
    #[error("more than one sink: {0} and {1}")]
    MultipleSinks(Gid, Gid),
    #[error("stage {0} has no downstream stages but is not a sink")]
    NotASink(Gid),
    #[error("cycle through stage {0}")]
    Cycle(Gid),
    #[error("stage {0} is not reachable from the sink")]
    Unreachable(Gid),
    #[error("stage {0} is not owned by the graph")]
    MissingStage(Gid),
    #[error("stage {0} is already owned by the graph")]
    DuplicateGid(Gid),
    #[error("stage {0} is already connected to other stages")]
    StageConnected(Gid),
    #[error("stages {0} and {1} are not connected")]
    NotConnected(Gid, Gid),
    #[error("stage {gid} has {upstream} upstream and {downstream} downstream edges")]
    Arity {
        gid: Gid,
        upstream: usize,
        downstream: usize,
    },
    #[error("the sink {0} cannot be removed")]
    SinkRequired(Gid),
    #[error("could not connect {0} to {1}")]
    ConnectFailed(Gid, Gid),
    #[error("stage {0} failed to initialize")]
    InitFailed(Gid),
    #[error("stage {0} failed to bind")]
    BindFailed(Gid),
}

/// Edge changes made during an edit, replayed backwards on failure.
#[derive(Clone, Copy, Debug)]
enum EdgeOp {
    Connected(Gid, Gid),
    /// The removed edge and the `(output, input)` port pair it used.
    Disconnected(Gid, Gid, Option<(usize, usize)>),
}

type StageMap = HashMap<Gid, Box<dyn Stage>>;

struct GraphInner {
    stages: StageMap,
    sink: Gid,
    render_order: Vec<Gid>,
    inputs: Vec<Gid>,
    outputs: Vec<Gid>,

    bus: PortBus,
    bindings: HashMap<Gid, StageBinding>,
    /// Output blocks of the stage currently rendering
    scratch: Vec<Vec<f32>>,

    initialized: bool,
}

/// A directed acyclic graph of [`Stage`]s with exactly one sink.
///
/// The graph owns every stage by [`Gid`]; adjacency is stored on the stages
/// as GID sets and always resolved through the graph, so a stage that has
/// been removed can never be reached through a stale edge.
///
/// Every method takes `&self` and serializes on one graph-wide lock, so a
/// control thread can splice stages in and out while a render thread keeps
/// calling [`render`](Self::render).
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tapegraph::{RenderContext, Stage, StageGraph, SwapBuffer};
/// use tapegraph::stages::{FinalStage, Gain, Sine};
///
/// let ctx = RenderContext::new(48_000, 64);
/// let swap = Arc::new(SwapBuffer::new(ctx.block_len()));
///
/// let mut sine = Sine::new(440.0);
/// let mut sink = FinalStage::new(swap.clone());
/// assert!(sine.connect(&mut sink));
/// let sink_gid = sink.gid();
///
/// let stages: Vec<Box<dyn Stage>> = vec![Box::new(sine), Box::new(sink)];
/// let graph = StageGraph::from_sink(ctx, stages, sink_gid).unwrap();
/// graph.initialize().unwrap();
///
/// // Splice a gain in front of the sink while the graph is live.
/// let front = graph.render_order()[0];
/// graph.insert_between(front, sink_gid, Box::new(Gain::new(0.5))).ok().unwrap();
/// graph.render(0);
/// assert_eq!(graph.render_order().len(), 3);
/// ```
pub struct StageGraph {
    ctx: RenderContext,
    inner: Mutex<GraphInner>,
}

impl StageGraph {
    /// Build a graph by walking upstream from `sink`.
    pub fn from_sink(
        ctx: RenderContext,
        stages: impl IntoIterator<Item = Box<dyn Stage>>,
        sink: Gid,
    ) -> Result<Self, GraphError> {
        let stages = collect_stages(stages)?;
        let node = stages.get(&sink).ok_or(GraphError::MissingStage(sink))?;
        if !node.is_sink() || !node.downstream().is_empty() {
            return Err(GraphError::NotASink(sink));
        }
        Self::assemble(ctx, stages, sink)
    }

    /// Build a graph by walking downstream from `sources` to the single sink.
    pub fn from_sources(
        ctx: RenderContext,
        stages: impl IntoIterator<Item = Box<dyn Stage>>,
        sources: &[Gid],
    ) -> Result<Self, GraphError> {
        let stages = collect_stages(stages)?;
        let sink = find_sink(&stages, sources)?;
        Self::assemble(ctx, stages, sink)
    }

    fn assemble(ctx: RenderContext, stages: StageMap, sink: Gid) -> Result<Self, GraphError> {
        let (render_order, inputs) = build_render_order(&stages, sink)?;
        if let Some(stray) = stages.keys().find(|gid| !render_order.contains(gid)) {
            return Err(GraphError::Unreachable(*stray));
        }
        tracing::debug!(
            stages = stages.len(),
            order = %render_order.iter().join(" "),
            "render order constructed"
        );

        Ok(Self {
            ctx,
            inner: Mutex::new(GraphInner {
                stages,
                sink,
                render_order,
                inputs,
                outputs: vec![sink],
                bus: PortBus::new(),
                bindings: HashMap::new(),
                scratch: Vec::new(),
                initialized: false,
            }),
        })
    }

    #[inline]
    pub fn ctx(&self) -> &RenderContext {
        &self.ctx
    }

    /// Call `init` on every stage, then `bind` on every stage in render order.
    ///
    /// Stops at the first failure and reports the offending stage. The graph
    /// counts as initialized only once everything has succeeded.
    pub fn initialize(&self) -> Result<(), GraphError> {
        let mut inner = self.inner.lock();
        inner.initialized = false;

        let order = inner.render_order.clone();
        for gid in order.iter() {
            let stage = inner
                .stages
                .get_mut(gid)
                .ok_or(GraphError::MissingStage(*gid))?;
            if !stage.init(&self.ctx) {
                tracing::error!(gid = %gid, name = stage.name(), "stage failed to initialize");
                return Err(GraphError::InitFailed(*gid));
            }
            stage.core_mut().set_initialized(true);
        }

        inner.bind_all(&self.ctx)?;
        inner.initialized = true;
        Ok(())
    }

    /// Render one block: every stage, in render order, for the same `time`.
    pub fn render(&self, time: u64) {
        let mut guard = self.inner.lock();
        if !guard.initialized {
            tracing::trace!(time, "render skipped: graph not initialized");
            return;
        }

        let GraphInner {
            stages,
            render_order,
            bus,
            bindings,
            scratch,
            ..
        } = &mut *guard;

        for gid in render_order.iter() {
            let (Some(stage), Some(binding)) = (stages.get_mut(gid), bindings.get(gid)) else {
                continue;
            };

            scratch.clear();
            scratch.extend(binding.outputs.iter().map(|key| bus.take(*key)));
            {
                let mut io = RenderIo::new(&self.ctx, binding, bus, scratch);
                stage.render(time, &mut io);
            }
            for (key, block) in binding.outputs.iter().zip(scratch.drain(..)) {
                bus.put(*key, block);
            }
        }
    }

    /// Splice `stage` into the existing edge `front -> back`.
    ///
    /// Returns the stage back if the edit is rejected; the graph is then
    /// exactly as it was.
    pub fn insert_between(
        &self,
        front: Gid,
        back: Gid,
        stage: Box<dyn Stage>,
    ) -> Result<(), Box<dyn Stage>> {
        let mut inner = self.inner.lock();
        let result = inner.insert_between(&self.ctx, front, back, stage);
        reject_to_caller("insert", result)
    }

    /// Insert `stage` between `target` and its single upstream stage.
    pub fn insert_before(&self, target: Gid, stage: Box<dyn Stage>) -> Result<(), Box<dyn Stage>> {
        let mut inner = self.inner.lock();
        let result = match inner.sole_neighbour(target, Side::Upstream) {
            Ok(front) => inner.insert_between(&self.ctx, front, target, stage),
            Err(e) => Err((stage, e)),
        };
        reject_to_caller("insert", result)
    }

    /// Insert `stage` between `target` and its single downstream stage.
    pub fn insert_after(&self, target: Gid, stage: Box<dyn Stage>) -> Result<(), Box<dyn Stage>> {
        let mut inner = self.inner.lock();
        let result = match inner.sole_neighbour(target, Side::Downstream) {
            Ok(back) => inner.insert_between(&self.ctx, target, back, stage),
            Err(e) => Err((stage, e)),
        };
        reject_to_caller("insert", result)
    }

    /// Take a stage out of the graph, joining its neighbours directly.
    ///
    /// Only stages with at most one upstream and one downstream edge can be
    /// removed, and never the sink.
    pub fn remove(&self, gid: Gid) -> Option<Box<dyn Stage>> {
        let mut inner = self.inner.lock();
        match inner.remove(&self.ctx, gid) {
            Ok(stage) => Some(stage),
            Err(e) => {
                tracing::warn!(gid = %gid, error = %e, "remove rejected");
                None
            }
        }
    }

    /// Swap the stage at `gid` for `stage`, moving every edge over.
    ///
    /// On success the old stage is returned with no remaining edges. On
    /// failure the new stage is handed back.
    pub fn replace(&self, gid: Gid, stage: Box<dyn Stage>) -> Result<Box<dyn Stage>, Box<dyn Stage>> {
        let mut inner = self.inner.lock();
        match inner.replace(&self.ctx, gid, stage) {
            Ok(old) => Ok(old),
            Err((stage, e)) => {
                tracing::warn!(gid = %gid, error = %e, "replace rejected");
                Err(stage)
            }
        }
    }

    /// Lock the graph and borrow one stage.
    pub fn find_stage(&self, gid: Gid) -> Option<MappedMutexGuard<'_, Box<dyn Stage>>> {
        MutexGuard::try_map(self.inner.lock(), |inner| inner.stages.get_mut(&gid)).ok()
    }

    pub fn contains(&self, gid: Gid) -> bool {
        self.inner.lock().stages.contains_key(&gid)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().stages.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    pub fn sink(&self) -> Gid {
        self.inner.lock().sink
    }

    pub fn render_order(&self) -> Vec<Gid> {
        self.inner.lock().render_order.clone()
    }

    /// Stages with no upstream edges.
    pub fn inputs(&self) -> Vec<Gid> {
        self.inner.lock().inputs.clone()
    }

    /// Sink stages (always exactly one).
    pub fn outputs(&self) -> Vec<Gid> {
        self.inner.lock().outputs.clone()
    }

    /// Overwrite the data of a port that owns its storage.
    ///
    /// Only unlinked input, passthrough and init-only ports accept host
    /// data; the graph must be initialized. Extra samples are ignored.
    pub fn write_port(&self, key: PortKey, data: &[f32]) -> bool {
        let mut inner = self.inner.lock();
        let writable = inner
            .stages
            .get(&key.gid)
            .and_then(|s| s.ports().get(key.index))
            .is_some_and(|p| p.role() != PortRole::Output && !p.is_linked());
        if !writable {
            return false;
        }
        match inner.bus.get_mut(key) {
            Some(block) => {
                let n = block.len().min(data.len());
                block[..n].copy_from_slice(&data[..n]);
                true
            }
            None => false,
        }
    }

    /// Copy out the data a port currently resolves to.
    pub fn read_port(&self, key: PortKey) -> Option<Vec<f32>> {
        let inner = self.inner.lock();
        let binding = inner.bindings.get(&key.gid)?;
        let port = inner.stages.get(&key.gid)?.ports().get(key.index)?;
        let owner = match port.role() {
            PortRole::Output => key,
            PortRole::Input => {
                let n = inner.stages[&key.gid].ports()[..key.index]
                    .iter()
                    .filter(|p| p.role() == PortRole::Input)
                    .count();
                *binding.inputs.get(n)?
            }
            PortRole::Passthrough | PortRole::InitOnly => binding
                .params
                .iter()
                .find(|(name, _)| name == port.name())
                .map(|(_, owner)| *owner)?,
        };
        inner.bus.get(owner).map(<[f32]>::to_vec)
    }
}

enum Side {
    Upstream,
    Downstream,
}

type Rejected = (Box<dyn Stage>, GraphError);

fn reject_to_caller(op: &str, result: Result<(), Rejected>) -> Result<(), Box<dyn Stage>> {
    result.map_err(|(stage, e)| {
        tracing::warn!(gid = %stage.gid(), error = %e, "{} rejected", op);
        stage
    })
}

impl GraphInner {
    fn sole_neighbour(&self, gid: Gid, side: Side) -> Result<Gid, GraphError> {
        let stage = self.stages.get(&gid).ok_or(GraphError::MissingStage(gid))?;
        let set = match side {
            Side::Upstream => stage.upstream(),
            Side::Downstream => stage.downstream(),
        };
        match (set.len(), set.iter().next()) {
            (1, Some(&n)) => Ok(n),
            _ => Err(GraphError::Arity {
                gid,
                upstream: stage.upstream().len(),
                downstream: stage.downstream().len(),
            }),
        }
    }

    fn check_fresh(&self, stage: &dyn Stage) -> Result<(), GraphError> {
        if self.stages.contains_key(&stage.gid()) {
            return Err(GraphError::DuplicateGid(stage.gid()));
        }
        if !stage.upstream().is_empty() || !stage.downstream().is_empty() {
            return Err(GraphError::StageConnected(stage.gid()));
        }
        Ok(())
    }

    fn insert_between(
        &mut self,
        ctx: &RenderContext,
        front: Gid,
        back: Gid,
        stage: Box<dyn Stage>,
    ) -> Result<(), Rejected> {
        let precondition = self.check_fresh(stage.as_ref()).and_then(|_| {
            let front_stage = self.stages.get(&front).ok_or(GraphError::MissingStage(front))?;
            if !self.stages.contains_key(&back) {
                return Err(GraphError::MissingStage(back));
            }
            if !front_stage.downstream().contains(&back) {
                return Err(GraphError::NotConnected(front, back));
            }
            Ok(())
        });
        if let Err(e) = precondition {
            return Err((stage, e));
        }

        let gid = stage.gid();
        self.stages.insert(gid, stage);

        let mut journal = Vec::new();
        let edit = self
            .disconnect(front, back, &mut journal)
            .and_then(|_| self.connect(front, gid, &mut journal))
            .and_then(|_| self.connect(gid, back, &mut journal))
            .and_then(|_| self.commit(ctx, self.sink, Some(gid)));

        match edit {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback(ctx, journal);
                match self.stages.remove(&gid) {
                    Some(stage) => Err((stage, e)),
                    None => unreachable!("inserted stage vanished during rollback"),
                }
            }
        }
    }

    fn remove(&mut self, ctx: &RenderContext, gid: Gid) -> Result<Box<dyn Stage>, GraphError> {
        if gid == self.sink {
            return Err(GraphError::SinkRequired(gid));
        }
        let stage = self.stages.get(&gid).ok_or(GraphError::MissingStage(gid))?;
        let upstream: Vec<Gid> = stage.upstream().iter().copied().collect();
        let downstream: Vec<Gid> = stage.downstream().iter().copied().collect();
        if upstream.len() > 1 || downstream.len() > 1 {
            return Err(GraphError::Arity {
                gid,
                upstream: upstream.len(),
                downstream: downstream.len(),
            });
        }

        let mut journal = Vec::new();
        let mut edit = Ok(());
        for &u in upstream.iter() {
            edit = edit.and_then(|_| self.disconnect(u, gid, &mut journal));
        }
        for &d in downstream.iter() {
            edit = edit.and_then(|_| self.disconnect(gid, d, &mut journal));
        }
        for (&u, &d) in upstream.iter().cartesian_product(downstream.iter()) {
            let already = self.stages.get(&u).is_some_and(|s| s.downstream().contains(&d));
            if !already {
                edit = edit.and_then(|_| self.connect(u, d, &mut journal));
            }
        }

        let removed = match edit {
            Ok(()) => self.stages.remove(&gid),
            Err(e) => {
                self.rollback(ctx, journal);
                return Err(e);
            }
        };

        match self.commit(ctx, self.sink, None) {
            Ok(()) => removed.ok_or(GraphError::MissingStage(gid)),
            Err(e) => {
                if let Some(stage) = removed {
                    self.stages.insert(gid, stage);
                }
                self.rollback(ctx, journal);
                Err(e)
            }
        }
    }

    fn replace(
        &mut self,
        ctx: &RenderContext,
        gid: Gid,
        stage: Box<dyn Stage>,
    ) -> Result<Box<dyn Stage>, Rejected> {
        let new_gid = stage.gid();
        let links = self.check_fresh(stage.as_ref()).and_then(|_| {
            let old = self.stages.get(&gid).ok_or(GraphError::MissingStage(gid))?;
            if gid == self.sink && !stage.is_sink() {
                return Err(GraphError::NotASink(new_gid));
            }
            Ok(edge_ports(old.core()))
        });
        let links = match links {
            Ok(links) => links,
            Err(e) => return Err((stage, e)),
        };

        self.stages.insert(new_gid, stage);
        let sink = if gid == self.sink { new_gid } else { self.sink };

        let mut journal = Vec::new();
        let mut edit = Ok(());
        for &(up, down, _) in links.iter() {
            edit = edit.and_then(|_| self.disconnect(up, down, &mut journal));
        }

        // keep each edge on the port indices it used, where the new stage has them
        let rename = |g: Gid| if g == gid { new_gid } else { g };
        let mut loose = Vec::new();
        if edit.is_ok() {
            for &(up, down, (o, i)) in links.iter() {
                let (up, down) = (rename(up), rename(down));
                if self.with_pair(up, down, |u, d| u.connect_ports(d, o, i)) {
                    journal.push(EdgeOp::Connected(up, down));
                } else {
                    loose.push((up, down));
                }
            }
        }
        for (up, down) in loose {
            edit = edit.and_then(|_| self.connect(up, down, &mut journal));
        }

        let old = match edit {
            Ok(()) => self.stages.remove(&gid),
            Err(e) => {
                self.rollback(ctx, journal);
                return Err((self.take_rejected(new_gid), e));
            }
        };

        match self.commit(ctx, sink, Some(new_gid)) {
            Ok(()) => old.ok_or_else(|| (self.take_rejected(new_gid), GraphError::MissingStage(gid))),
            Err(e) => {
                if let Some(old) = old {
                    self.stages.insert(gid, old);
                }
                self.rollback(ctx, journal);
                Err((self.take_rejected(new_gid), e))
            }
        }
    }

    fn take_rejected(&mut self, gid: Gid) -> Box<dyn Stage> {
        match self.stages.remove(&gid) {
            Some(stage) => stage,
            None => unreachable!("offered stage {} vanished during rollback", gid),
        }
    }

    /// Run `f` on the ordered pair `(up, down)` of owned stages.
    fn with_pair(&mut self, up: Gid, down: Gid, f: impl FnOnce(&mut dyn Stage, &mut dyn Stage) -> bool) -> bool {
        if up == down {
            return false;
        }
        let Some(mut d) = self.stages.remove(&down) else {
            return false;
        };
        let ok = match self.stages.get_mut(&up) {
            Some(u) => f(u.as_mut(), d.as_mut()),
            None => false,
        };
        self.stages.insert(down, d);
        ok
    }

    fn connect(&mut self, up: Gid, down: Gid, journal: &mut Vec<EdgeOp>) -> Result<(), GraphError> {
        if self.with_pair(up, down, |u, d| u.connect(d)) {
            journal.push(EdgeOp::Connected(up, down));
            Ok(())
        } else {
            Err(GraphError::ConnectFailed(up, down))
        }
    }

    fn disconnect(&mut self, up: Gid, down: Gid, journal: &mut Vec<EdgeOp>) -> Result<(), GraphError> {
        let ports = self.stages.get(&up).and_then(|u| {
            u.ports()
                .iter()
                .enumerate()
                .find(|(_, p)| p.role() == PortRole::Output && p.link().is_some_and(|k| k.gid == down))
                .and_then(|(o, p)| p.link().map(|k| (o, k.index)))
        });
        if self.with_pair(up, down, |u, d| u.disconnect(d)) {
            journal.push(EdgeOp::Disconnected(up, down, ports));
            Ok(())
        } else {
            Err(GraphError::NotConnected(up, down))
        }
    }

    /// Rebuild the render order from `sink` and, if live, init and rebind.
    ///
    /// Nothing is written to `self` unless every step succeeds.
    fn commit(&mut self, ctx: &RenderContext, sink: Gid, fresh: Option<Gid>) -> Result<(), GraphError> {
        let (order, inputs) = build_render_order(&self.stages, sink)?;
        if let Some(stray) = self.stages.keys().find(|gid| !order.contains(gid)) {
            return Err(GraphError::Unreachable(*stray));
        }

        let previous = (
            std::mem::replace(&mut self.render_order, order),
            std::mem::replace(&mut self.inputs, inputs),
            std::mem::replace(&mut self.outputs, vec![sink]),
            std::mem::replace(&mut self.sink, sink),
        );

        if self.initialized {
            let live = fresh
                .map(|gid| self.init_stage(ctx, gid))
                .unwrap_or(Ok(()))
                .and_then(|_| self.bind_all(ctx));
            if let Err(e) = live {
                (self.render_order, self.inputs, self.outputs, self.sink) = previous;
                return Err(e);
            }
        }

        tracing::debug!(order = %self.render_order.iter().join(" "), "render order rebuilt");
        Ok(())
    }

    fn init_stage(&mut self, ctx: &RenderContext, gid: Gid) -> Result<(), GraphError> {
        let stage = self.stages.get_mut(&gid).ok_or(GraphError::MissingStage(gid))?;
        if stage.is_initialized() {
            return Ok(());
        }
        if !stage.init(ctx) {
            tracing::error!(gid = %gid, name = stage.name(), "stage failed to initialize");
            return Err(GraphError::InitFailed(gid));
        }
        stage.core_mut().set_initialized(true);
        Ok(())
    }

    fn rollback(&mut self, ctx: &RenderContext, journal: Vec<EdgeOp>) {
        for op in journal.into_iter().rev() {
            let restored = match op {
                EdgeOp::Connected(a, b) => self.with_pair(a, b, |u, d| u.disconnect(d)),
                EdgeOp::Disconnected(a, b, Some((o, i))) => {
                    self.with_pair(a, b, |u, d| u.connect_ports(d, o, i) || u.connect(d))
                }
                EdgeOp::Disconnected(a, b, None) => self.with_pair(a, b, |u, d| u.connect(d)),
            };
            if !restored {
                tracing::error!(?op, "failed to restore edge during rollback");
            }
        }
        if self.initialized {
            if let Err(e) = self.bind_all(ctx) {
                tracing::error!(error = %e, "rebind after rollback failed");
            }
        }
    }

    /// Resolve every port link, allocate storage, then `bind` each stage.
    fn bind_all(&mut self, ctx: &RenderContext) -> Result<(), GraphError> {
        let mut bindings = HashMap::with_capacity(self.stages.len());
        let mut live = HashSet::new();

        for gid in self.render_order.clone().iter() {
            let binding = self.resolve_binding(ctx, *gid, &mut live)?;
            bindings.insert(*gid, binding);
        }
        self.bus.retain_live(&live);

        for gid in self.render_order.iter() {
            let Some(stage) = self.stages.get_mut(gid) else {
                return Err(GraphError::MissingStage(*gid));
            };
            if !stage.bind(ctx) {
                tracing::error!(gid = %gid, name = stage.name(), "stage failed to bind");
                return Err(GraphError::BindFailed(*gid));
            }
        }

        self.bindings = bindings;
        Ok(())
    }

    fn resolve_binding(
        &mut self,
        ctx: &RenderContext,
        gid: Gid,
        live: &mut HashSet<PortKey>,
    ) -> Result<StageBinding, GraphError> {
        let stage = self.stages.get(&gid).ok_or(GraphError::MissingStage(gid))?;
        let mut binding = StageBinding::default();
        let mut owned = Vec::new();

        for (index, port) in stage.ports().iter().enumerate() {
            let key = PortKey::new(gid, index);
            match (port.role(), port.link()) {
                (PortRole::Output, link) => {
                    if let Some(link) = link {
                        self.check_mutual(key, link, PortRole::Input)?;
                    }
                    owned.push((key, port.storage_len(ctx)));
                    binding.outputs.push(key);
                }
                (PortRole::Input, Some(link)) => {
                    self.check_mutual(key, link, PortRole::Output)?;
                    binding.inputs.push(link);
                }
                (PortRole::Input, None) => {
                    owned.push((key, port.storage_len(ctx)));
                    binding.inputs.push(key);
                }
                (PortRole::Passthrough, Some(link)) => {
                    let owner = self.resolve_passthrough(gid, link)?;
                    binding.params.push((port.name_cow(), owner));
                }
                (PortRole::Passthrough, None) | (PortRole::InitOnly, _) => {
                    owned.push((key, port.storage_len(ctx)));
                    binding.params.push((port.name_cow(), key));
                }
            }
        }

        for (key, len) in owned {
            self.bus.ensure(key, len);
            live.insert(key);
        }
        Ok(binding)
    }

    /// Both ends of a data link must point at each other.
    fn check_mutual(&self, key: PortKey, link: PortKey, role: PortRole) -> Result<(), GraphError> {
        let target = self
            .stages
            .get(&link.gid)
            .and_then(|s| s.ports().get(link.index));
        match target {
            Some(p) if p.role() == role && p.link() == Some(key) => Ok(()),
            _ => {
                tracing::error!(port = ?key, link = ?link, "dangling port link");
                Err(GraphError::BindFailed(key.gid))
            }
        }
    }

    /// Follow passthrough links up to the port that owns the data.
    fn resolve_passthrough(&self, gid: Gid, mut link: PortKey) -> Result<PortKey, GraphError> {
        for _ in 0..=self.stages.len() {
            let port = self
                .stages
                .get(&link.gid)
                .and_then(|s| s.ports().get(link.index))
                .filter(|p| p.role() == PortRole::Passthrough)
                .ok_or(GraphError::BindFailed(gid))?;
            match port.link() {
                Some(next) => link = next,
                None => return Ok(link),
            }
        }
        Err(GraphError::BindFailed(gid))
    }
}

/// Every edge touching `core` as `(up, down, (output, input))`, upstream
/// edges first.
fn edge_ports(core: &StageCore) -> Vec<(Gid, Gid, (usize, usize))> {
    let gid = core.gid();
    let mut upstream = Vec::new();
    let mut downstream = Vec::new();
    for (index, port) in core.ports().iter().enumerate() {
        let Some(key) = port.link() else {
            continue;
        };
        match port.role() {
            PortRole::Input => upstream.push((key.gid, gid, (key.index, index))),
            PortRole::Output => downstream.push((gid, key.gid, (index, key.index))),
            PortRole::Passthrough | PortRole::InitOnly => {}
        }
    }
    upstream.extend(downstream);
    upstream
}

fn collect_stages(stages: impl IntoIterator<Item = Box<dyn Stage>>) -> Result<StageMap, GraphError> {
    let mut map = StageMap::new();
    for stage in stages {
        let gid = stage.gid();
        if map.insert(gid, stage).is_some() {
            return Err(GraphError::DuplicateGid(gid));
        }
    }
    if map.is_empty() {
        return Err(GraphError::EmptyGraph);
    }
    Ok(map)
}

/// Walk downstream from `sources` and return the one sink they all reach.
fn find_sink(stages: &StageMap, sources: &[Gid]) -> Result<Gid, GraphError> {
    let mut visited = HashSet::new();
    let mut stack: Vec<Gid> = sources.to_vec();
    let mut sink: Option<Gid> = None;

    while let Some(gid) = stack.pop() {
        if !visited.insert(gid) {
            continue;
        }
        let stage = stages.get(&gid).ok_or(GraphError::MissingStage(gid))?;
        if stage.downstream().is_empty() {
            if !stage.is_sink() {
                return Err(GraphError::NotASink(gid));
            }
            match sink {
                Some(found) if found != gid => return Err(GraphError::MultipleSinks(found, gid)),
                _ => sink = Some(gid),
            }
        }
        stack.extend(stage.downstream().iter().rev().copied());
    }

    sink.ok_or(GraphError::NoSink)
}

enum Visit {
    Enter(Gid),
    Exit(Gid),
}

/// Depth-first walk over upstream edges from `sink`, emitting each stage
/// once all of its upstream stages have been emitted.
///
/// Returns the render order (sources first, sink last) and the stages with
/// no upstream edges. A stage met again while it is still being visited
/// closes a cycle.
fn build_render_order(stages: &StageMap, sink: Gid) -> Result<(Vec<Gid>, Vec<Gid>), GraphError> {
    let mut order = Vec::with_capacity(stages.len());
    let mut inputs = Vec::new();
    let mut in_progress = HashSet::new();
    let mut finished = HashSet::new();
    let mut stack = vec![Visit::Enter(sink)];

    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(gid) => {
                if finished.contains(&gid) {
                    continue;
                }
                if !in_progress.insert(gid) {
                    return Err(GraphError::Cycle(gid));
                }
                let stage = stages.get(&gid).ok_or(GraphError::MissingStage(gid))?;
                if stage.downstream().is_empty() && gid != sink {
                    return Err(if stage.is_sink() {
                        GraphError::MultipleSinks(sink, gid)
                    } else {
                        GraphError::NotASink(gid)
                    });
                }
                stack.push(Visit::Exit(gid));
                stack.extend(stage.upstream().iter().rev().map(|&up| Visit::Enter(up)));
            }
            Visit::Exit(gid) => {
                in_progress.remove(&gid);
                finished.insert(gid);
                if stages.get(&gid).is_some_and(|s| s.upstream().is_empty()) {
                    inputs.push(gid);
                }
                order.push(gid);
            }
        }
    }

    for gid in order.iter() {
        for down in stages[gid].downstream().iter() {
            let Some(stage) = stages.get(down) else {
                return Err(GraphError::MissingStage(*down));
            };
            if !finished.contains(down) {
                return Err(if stage.downstream().is_empty() && stage.is_sink() {
                    GraphError::MultipleSinks(sink, *down)
                } else {
                    GraphError::Unreachable(*down)
                });
            }
        }
    }

    Ok((order, inputs))
}
