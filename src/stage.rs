//! Core stage trait and identity types.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::context::RenderContext;
use crate::port::{Port, PortKey, PortRole, RenderIo};

static NEXT_GID: AtomicU32 = AtomicU32::new(1);

/// Unique identifier for a stage.
///
/// GIDs are handed out in increasing order when a stage is created and are
/// never reused, so a GID stays valid as a name for "that stage" across
/// every structural edit of every graph in the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Gid(pub(crate) u32);

impl Gid {
    /// Allocate a fresh GID.
    pub fn next() -> Self {
        Gid(NEXT_GID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered set of neighbouring GIDs.
pub type GidSet = BTreeSet<Gid>;

/// Identity, ports and adjacency shared by every stage.
///
/// Stage implementations embed one of these and hand it out through
/// [`Stage::core`] / [`Stage::core_mut`]; everything the graph needs to know
/// about topology lives here.
#[derive(Debug)]
pub struct StageCore {
    gid: Gid,
    ports: Vec<Port>,
    upstream: GidSet,
    downstream: GidSet,
    initialized: bool,
}

impl StageCore {
    pub fn new(ports: Vec<Port>) -> Self {
        Self {
            gid: Gid::next(),
            ports,
            upstream: GidSet::new(),
            downstream: GidSet::new(),
            initialized: false,
        }
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    #[inline]
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    #[inline]
    pub fn upstream(&self) -> &GidSet {
        &self.upstream
    }

    #[inline]
    pub fn downstream(&self) -> &GidSet {
        &self.downstream
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    fn free_ports(&self, role: PortRole) -> impl Iterator<Item = usize> + '_ {
        self.ports
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.role() == role && !p.is_linked())
            .map(|(i, _)| i)
    }

    /// Link `self -> next`, updating both ends.
    ///
    /// The first free output of `self` is linked to the first free input of
    /// `next`; a block carries every channel, so one link per edge is
    /// enough. A stage feeds several downstream stages through several
    /// outputs. Passthrough ports are linked by name when `next`'s side is
    /// free.
    pub fn connect(&mut self, next: &mut StageCore) -> bool {
        if self.gid == next.gid || self.downstream.contains(&next.gid) {
            return false;
        }

        let output = self.free_ports(PortRole::Output).next();
        let input = next.free_ports(PortRole::Input).next();
        let (Some(o), Some(i)) = (output, input) else {
            tracing::warn!(
                from = %self.gid,
                to = %next.gid,
                free_output = output.is_some(),
                free_input = input.is_some(),
                "cannot connect stages: no free port"
            );
            return false;
        };

        self.link_ports(next, o, i);
        true
    }

    /// Link output `output` of `self` to input `input` of `next`.
    ///
    /// Fails without touching either stage when the edge already exists or
    /// either port is missing, linked or of the wrong role.
    pub fn connect_ports(&mut self, next: &mut StageCore, output: usize, input: usize) -> bool {
        if self.gid == next.gid || self.downstream.contains(&next.gid) {
            return false;
        }
        let free = |ports: &[Port], i: usize, role: PortRole| {
            ports.get(i).is_some_and(|p| p.role() == role && !p.is_linked())
        };
        if !free(&self.ports[..], output, PortRole::Output) || !free(&next.ports[..], input, PortRole::Input) {
            return false;
        }
        self.link_ports(next, output, input);
        true
    }

    fn link_ports(&mut self, next: &mut StageCore, o: usize, i: usize) {
        self.ports[o].set_link(Some(PortKey::new(next.gid, i)));
        next.ports[i].set_link(Some(PortKey::new(self.gid, o)));

        for (o, port) in self.ports.iter().enumerate() {
            if port.role() != PortRole::Passthrough {
                continue;
            }
            let target = next.ports.iter_mut().find(|p| {
                p.role() == PortRole::Passthrough && !p.is_linked() && p.name() == port.name()
            });
            if let Some(target) = target {
                target.set_link(Some(PortKey::new(self.gid, o)));
            }
        }

        self.downstream.insert(next.gid);
        next.upstream.insert(self.gid);
    }

    /// Undo [`connect`](Self::connect), releasing only links between the two.
    pub fn disconnect(&mut self, next: &mut StageCore) -> bool {
        if !self.downstream.contains(&next.gid) {
            return false;
        }

        for port in self.ports.iter_mut() {
            if port.link().map(|k| k.gid) == Some(next.gid) {
                port.set_link(None);
            }
        }
        for port in next.ports.iter_mut() {
            if port.link().map(|k| k.gid) == Some(self.gid) {
                port.set_link(None);
            }
        }

        self.downstream.remove(&next.gid);
        next.upstream.remove(&self.gid);
        true
    }
}

/// One unit of per-block computation.
///
/// The graph only ever talks to stages through this trait, so the actual
/// sample computation can live anywhere: on the CPU (see
/// [`stages`](crate::stages)) or in an external compute backend that
/// uploads port data and dispatches a kernel per block.
///
/// # Lifecycle
///
/// 1. The caller constructs stages and wires them with [`Stage::connect`].
/// 2. Ownership moves into a [`StageGraph`](crate::StageGraph).
/// 3. [`StageGraph::initialize`](crate::StageGraph::initialize) calls
///    [`init`](Stage::init) on every stage, then [`bind`](Stage::bind) in
///    render order.
/// 4. [`render`](Stage::render) runs once per block, after every upstream
///    stage has rendered the same `time`.
///
/// ```
/// use tapegraph::{RenderContext, RenderIo, Stage, StageCore, Port};
///
/// struct Silence {
///     core: StageCore,
/// }
///
/// impl Stage for Silence {
///     fn core(&self) -> &StageCore { &self.core }
///     fn core_mut(&mut self) -> &mut StageCore { &mut self.core }
///
///     fn render(&mut self, _time: u64, io: &mut RenderIo<'_>) {
///         if let Some(out) = io.output(0) {
///             out.fill(0.0);
///         }
///     }
/// }
///
/// let stage = Silence { core: StageCore::new(vec![Port::output("out")]) };
/// assert!(stage.upstream().is_empty());
/// ```
pub trait Stage: Send + 'static {
    fn core(&self) -> &StageCore;

    fn core_mut(&mut self) -> &mut StageCore;

    /// One-time setup. Called before any `bind`.
    fn init(&mut self, _ctx: &RenderContext) -> bool {
        true
    }

    /// Acquire resources that depend on linked ports.
    ///
    /// Called after the graph has resolved every port link, and again after
    /// each structural edit of an initialized graph.
    fn bind(&mut self, _ctx: &RenderContext) -> bool {
        true
    }

    /// Produce one block for `time` (measured in blocks).
    fn render(&mut self, time: u64, io: &mut RenderIo<'_>);

    /// Whether this stage may terminate a graph.
    fn is_sink(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "stage"
    }

    #[inline]
    fn gid(&self) -> Gid {
        self.core().gid()
    }

    #[inline]
    fn upstream(&self) -> &GidSet {
        self.core().upstream()
    }

    #[inline]
    fn downstream(&self) -> &GidSet {
        self.core().downstream()
    }

    #[inline]
    fn ports(&self) -> &[Port] {
        self.core().ports()
    }

    #[inline]
    fn is_initialized(&self) -> bool {
        self.core().is_initialized()
    }

    /// Connect `self -> next`, updating adjacency and port links on both.
    fn connect(&mut self, next: &mut dyn Stage) -> bool {
        self.core_mut().connect(next.core_mut())
    }

    /// Add the `self -> next` edge through the given port pair.
    fn connect_ports(&mut self, next: &mut dyn Stage, output: usize, input: usize) -> bool {
        self.core_mut().connect_ports(next.core_mut(), output, input)
    }

    /// Remove the `self -> next` edge.
    fn disconnect(&mut self, next: &mut dyn Stage) -> bool {
        self.core_mut().disconnect(next.core_mut())
    }
}
