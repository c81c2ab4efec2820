//! Ports, graph-owned block storage and the per-render I/O view.
//!
//! A [`Port`] is a named slot on a stage. Ports are linked 1:1 when two
//! stages are connected; the graph resolves those links at bind time into a
//! table of data owners, and every block of data lives in the graph's
//! [`PortBus`] keyed by the owning [`PortKey`]. During
//! [`Stage::render`](crate::Stage::render) a stage sees its own slice of the
//! bus through [`RenderIo`].

use std::borrow::Cow;

use hashbrown::{HashMap, HashSet};

use crate::context::RenderContext;
use crate::stage::Gid;

/// What a port is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortRole {
    /// Block data produced upstream. Owns its data while unlinked.
    Input,
    /// Block data produced by this stage.
    Output,
    /// Forwarded unchanged from an upstream port of the same name.
    Passthrough,
    /// Written once by the host before rendering. Never linked.
    InitOnly,
}

/// Address of one port: the owning stage and the port's index on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey {
    pub gid: Gid,
    pub index: usize,
}

impl PortKey {
    pub fn new(gid: Gid, index: usize) -> Self {
        Self { gid, index }
    }
}

/// A named data slot owned by exactly one stage.
#[derive(Clone, Debug)]
pub struct Port {
    name: Cow<'static, str>,
    role: PortRole,
    link: Option<PortKey>,
    len: Option<usize>,
}

impl Port {
    fn with_role(name: impl Into<Cow<'static, str>>, role: PortRole) -> Self {
        Self {
            name: name.into(),
            role,
            link: None,
            len: None,
        }
    }

    pub fn input(name: impl Into<Cow<'static, str>>) -> Self {
        Self::with_role(name, PortRole::Input)
    }

    pub fn output(name: impl Into<Cow<'static, str>>) -> Self {
        Self::with_role(name, PortRole::Output)
    }

    pub fn passthrough(name: impl Into<Cow<'static, str>>) -> Self {
        Self::with_role(name, PortRole::Passthrough)
    }

    /// An init-only port holding `len` samples.
    pub fn init_only(name: impl Into<Cow<'static, str>>, len: usize) -> Self {
        Self {
            len: Some(len),
            ..Self::with_role(name, PortRole::InitOnly)
        }
    }

    /// Override the storage length (defaults to one block).
    pub fn with_len(mut self, len: usize) -> Self {
        self.len = Some(len);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> PortRole {
        self.role
    }

    /// The port on the other end of this port's link, if any.
    #[inline]
    pub fn link(&self) -> Option<PortKey> {
        self.link
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }

    /// Storage length in samples for the given context.
    #[inline]
    pub fn storage_len(&self, ctx: &RenderContext) -> usize {
        self.len.unwrap_or_else(|| ctx.block_len())
    }

    pub(crate) fn set_link(&mut self, link: Option<PortKey>) {
        self.link = link;
    }

    pub(crate) fn name_cow(&self) -> Cow<'static, str> {
        self.name.clone()
    }
}

/// Graph-owned storage for every port that owns its data.
#[derive(Default, Debug)]
pub struct PortBus {
    blocks: HashMap<PortKey, Vec<f32>>,
}

impl PortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `key` has storage of exactly `len` samples.
    pub(crate) fn ensure(&mut self, key: PortKey, len: usize) {
        let block = self.blocks.entry(key).or_default();
        if block.len() != len {
            block.resize(len, 0.0);
        }
    }

    /// Drop storage for every key not in `live`.
    pub(crate) fn retain_live(&mut self, live: &HashSet<PortKey>) {
        self.blocks.retain(|key, _| live.contains(key));
    }

    #[inline]
    pub fn get(&self, key: PortKey) -> Option<&[f32]> {
        self.blocks.get(&key).map(Vec::as_slice)
    }

    #[inline]
    pub fn get_mut(&mut self, key: PortKey) -> Option<&mut [f32]> {
        self.blocks.get_mut(&key).map(Vec::as_mut_slice)
    }

    /// Move a block out, leaving an empty vector behind. Does not allocate.
    #[inline]
    pub(crate) fn take(&mut self, key: PortKey) -> Vec<f32> {
        self.blocks
            .get_mut(&key)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    #[inline]
    pub(crate) fn put(&mut self, key: PortKey, block: Vec<f32>) {
        if let Some(slot) = self.blocks.get_mut(&key) {
            *slot = block;
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Resolved data owners for one stage's ports, computed at bind time.
#[derive(Clone, Debug, Default)]
pub(crate) struct StageBinding {
    pub(crate) inputs: Vec<PortKey>,
    pub(crate) outputs: Vec<PortKey>,
    pub(crate) params: Vec<(Cow<'static, str>, PortKey)>,
}

/// Read side of a [`RenderIo`].
pub struct Inputs<'a> {
    binding: &'a StageBinding,
    bus: &'a PortBus,
}

impl<'a> Inputs<'a> {
    /// Number of input ports.
    #[inline]
    pub fn len(&self) -> usize {
        self.binding.inputs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.binding.inputs.is_empty()
    }

    /// Data of the `n`th input port, or an empty slice if there is none.
    #[inline]
    pub fn get(&self, n: usize) -> &'a [f32] {
        self.binding
            .inputs
            .get(n)
            .and_then(|key| self.bus.get(*key))
            .unwrap_or(&[])
    }

    /// Data of a passthrough or init-only port, by name.
    pub fn param(&self, name: &str) -> Option<&'a [f32]> {
        self.binding
            .params
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, key)| self.bus.get(*key))
    }
}

/// Write side of a [`RenderIo`].
pub struct Outputs<'a> {
    blocks: &'a mut [Vec<f32>],
}

impl Outputs<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Mutable data of the `n`th output port.
    #[inline]
    pub fn get(&mut self, n: usize) -> Option<&mut [f32]> {
        self.blocks.get_mut(n).map(Vec::as_mut_slice)
    }

    /// Fill every output with silence.
    pub fn silence(&mut self) {
        for block in self.blocks.iter_mut() {
            block.fill(0.0);
        }
    }
}

/// A stage's view of the graph's storage during one render call.
pub struct RenderIo<'a> {
    ctx: &'a RenderContext,
    binding: &'a StageBinding,
    bus: &'a PortBus,
    outputs: &'a mut [Vec<f32>],
}

impl<'a> RenderIo<'a> {
    pub(crate) fn new(
        ctx: &'a RenderContext,
        binding: &'a StageBinding,
        bus: &'a PortBus,
        outputs: &'a mut [Vec<f32>],
    ) -> Self {
        Self {
            ctx,
            binding,
            bus,
            outputs,
        }
    }

    #[inline]
    pub fn ctx(&self) -> &RenderContext {
        self.ctx
    }

    /// Data of the `n`th input port, or an empty slice if there is none.
    #[inline]
    pub fn input(&self, n: usize) -> &[f32] {
        self.inputs().get(n)
    }

    #[inline]
    pub fn inputs(&self) -> Inputs<'_> {
        Inputs {
            binding: self.binding,
            bus: self.bus,
        }
    }

    #[inline]
    pub fn output(&mut self, n: usize) -> Option<&mut [f32]> {
        self.outputs.get_mut(n).map(Vec::as_mut_slice)
    }

    /// Borrow inputs and outputs at the same time.
    #[inline]
    pub fn split(&mut self) -> (Inputs<'_>, Outputs<'_>) {
        (
            Inputs {
                binding: self.binding,
                bus: self.bus,
            },
            Outputs {
                blocks: &mut *self.outputs,
            },
        )
    }
}
